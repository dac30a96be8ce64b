// SPDX-License-Identifier: Apache-2.0

//! Worker supervision and inventory reloading.
//!
//! The supervisor reconciles the desired target set against the live
//! workers: new targets get a worker, departed targets get their worker
//! cancelled. Cancelled workers self-terminate and are never restarted.
//! The desired set is the static inventory from the configuration file,
//! extended by the output of the inventory script when one is configured.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{error, info, warn};

use crate::config::{ScrapeConfig, TargetSpec};
use crate::metrics::Registry;
use crate::parser::{base_labels, ColumnReader, LineParser};

use super::ssh::TailTransport;
use super::worker::TailWorker;

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    registry: Arc<Registry>,
    columns: Arc<Vec<Option<ColumnReader>>>,
    transport: Arc<dyn TailTransport>,
    workers: HashMap<String, WorkerHandle>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        columns: Arc<Vec<Option<ColumnReader>>>,
        transport: Arc<dyn TailTransport>,
    ) -> Self {
        Self {
            registry,
            columns,
            transport,
            workers: HashMap::new(),
        }
    }

    /// Bring the live worker set in line with `desired`. Reconciling an
    /// unchanged set is a no-op: existing workers are never restarted.
    pub fn reconcile(&mut self, desired: &[TargetSpec]) {
        let desired_ids: HashSet<String> = desired.iter().map(|t| t.target_id()).collect();

        let departed: Vec<String> = self
            .workers
            .keys()
            .filter(|id| !desired_ids.contains(*id))
            .cloned()
            .collect();
        for id in departed {
            if let Some(worker) = self.workers.remove(&id) {
                info!(target = %id, "target left inventory, cancelling worker");
                worker.cancel.cancel();
                // The worker self-terminates; it is not joined here.
            }
        }

        for spec in desired {
            let id = spec.target_id();
            if self.workers.contains_key(&id) {
                continue;
            }

            info!(
                target = %id,
                environment = %spec.environment,
                "starting worker"
            );
            let cancel = CancellationToken::new();
            let parser = LineParser::new(
                self.columns.clone(),
                base_labels(&spec.environment, &spec.host),
            );
            let worker = TailWorker::new(
                spec.clone(),
                parser,
                self.registry.clone(),
                self.transport.clone(),
                cancel.clone(),
            );
            let handle = tokio::spawn(worker.run());
            self.workers.insert(id, WorkerHandle { cancel, handle });
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[cfg(test)]
    fn task_ids(&self) -> HashMap<String, tokio::task::Id> {
        self.workers
            .iter()
            .map(|(id, w)| (id.clone(), w.handle.id()))
            .collect()
    }

    /// Cancel every worker and wait for all of them to stop.
    pub async fn shutdown(mut self) {
        for worker in self.workers.values() {
            worker.cancel.cancel();
        }
        for (id, worker) in self.workers.drain() {
            if let Err(err) = worker.handle.await {
                error!(target = %id, error = %err, "worker task failed");
            }
        }
    }
}

/// Drive the supervisor until `cancel` fires: reconcile the static
/// inventory, then re-invoke the inventory script every `reload_interval`
/// seconds (once, if no interval is configured).
pub async fn run(mut supervisor: Supervisor, config: ScrapeConfig, cancel: CancellationToken) {
    let static_targets = config.targets();
    supervisor.reconcile(&static_targets);

    if let Some(script) = config.script.as_deref() {
        loop {
            match load_inventory(script).await {
                Ok(inventory) => {
                    let mut desired = static_targets.clone();
                    desired.extend(inventory.targets());
                    supervisor.reconcile(&desired);
                }
                Err(err) => {
                    warn!(script, error = %err, "inventory script failed, keeping current targets");
                }
            }

            match config.reload_interval {
                Some(secs) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    }
                }
                None => break,
            }
        }
    }

    cancel.cancelled().await;
    supervisor.shutdown().await;
    info!("supervisor stopped");
}

/// Invoke the inventory script through the shell and parse its stdout as a
/// scrape configuration.
async fn load_inventory(script: &str) -> Result<ScrapeConfig, BoxError> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .output()
        .await?;

    if !output.status.success() {
        return Err(format!("inventory script exited with {}", output.status).into());
    }

    let stdout = String::from_utf8(output.stdout)?;
    Ok(ScrapeConfig::from_yaml(&stdout)?)
}
