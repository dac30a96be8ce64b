// SPDX-License-Identifier: Apache-2.0

//! Per-target SSH tail worker.
//!
//! Each worker owns one (host, file) target and cycles through
//! Idle → Connecting → Tailing → Disconnected until cancelled. Connection
//! attempts are spaced by exponential backoff; a session that delivered at
//! least one log line resets the backoff. The `connected` gauge mirrors the
//! session state at every transition.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TargetSpec;
use crate::metrics::{self, LabelSet, Registry, RegistryError};
use crate::parser::LineParser;

use super::ssh::{tail_command, TailTransport};

/// First line the remote command prints once the session is up. Tail output
/// begins after it.
pub const READY_SENTINEL: &str = "##tailscrape-ready##";

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Exponential reconnect backoff: 1s doubling to a 30s cap.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            next: BACKOFF_INITIAL,
        }
    }

    /// Return the current delay and double it for the next failure.
    pub(crate) fn advance(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.next = BACKOFF_INITIAL;
    }
}

enum SessionEnd {
    Cancelled,
    Disconnected { saw_lines: bool },
}

pub struct TailWorker {
    target: TargetSpec,
    parser: LineParser,
    registry: Arc<Registry>,
    transport: Arc<dyn TailTransport>,
    cancel: CancellationToken,
    base_labels: LabelSet,
}

impl TailWorker {
    pub fn new(
        target: TargetSpec,
        parser: LineParser,
        registry: Arc<Registry>,
        transport: Arc<dyn TailTransport>,
        cancel: CancellationToken,
    ) -> Self {
        let base_labels = crate::parser::base_labels(&target.environment, &target.host);
        Self {
            target,
            parser,
            registry,
            transport,
            cancel,
            base_labels,
        }
    }

    /// Run until cancelled. Registry failures are programmer errors and
    /// terminate the worker.
    pub async fn run(self) {
        info!(
            environment = %self.target.environment,
            host = %self.target.host,
            file = %self.target.file,
            "starting tail worker"
        );

        let mut backoff = Backoff::new();
        let mut first_attempt = true;

        loop {
            self.set_connected(0.0);
            if self.cancel.is_cancelled() {
                break;
            }

            if !first_attempt {
                let delay = backoff.advance();
                debug!(host = %self.target.host, ?delay, "waiting before reconnect");
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first_attempt = false;

            match self.session().await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Disconnected { saw_lines }) => {
                    if saw_lines {
                        backoff.reset();
                    }
                }
                Err(err) => {
                    error!(host = %self.target.host, error = %err, "registry failure, stopping worker");
                    break;
                }
            }
        }

        self.set_connected(0.0);
        info!(host = %self.target.host, "tail worker stopped");
    }

    /// One connection attempt: spawn the transport, wait for the ready
    /// sentinel, then tail until the stream ends or we are cancelled.
    async fn session(&self) -> Result<SessionEnd, RegistryError> {
        let remote = tail_command(&self.target.file, READY_SENTINEL);
        let mut cmd = self.transport.command(&self.target, &remote);

        debug!(host = %self.target.host, "opening session");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(host = %self.target.host, error = %err, "failed to spawn transport");
                return Ok(SessionEnd::Disconnected { saw_lines: false });
            }
        };

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                warn!(host = %self.target.host, "transport did not pipe stdout");
                shutdown(&mut child).await;
                return Ok(SessionEnd::Disconnected { saw_lines: false });
            }
        };
        let mut lines = BufReader::new(stdout).lines();

        if !self.await_ready(&mut lines).await {
            let cancelled = self.cancel.is_cancelled();
            shutdown(&mut child).await;
            return Ok(if cancelled {
                SessionEnd::Cancelled
            } else {
                SessionEnd::Disconnected { saw_lines: false }
            });
        }

        self.set_connected(1.0);
        info!(
            environment = %self.target.environment,
            host = %self.target.host,
            file = %self.target.file,
            "connected"
        );

        let mut saw_lines = false;
        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        saw_lines = true;
                        if let Err(err) = self.ingest(&line) {
                            shutdown(&mut child).await;
                            return Err(err);
                        }
                    }
                    Ok(None) => {
                        warn!(host = %self.target.host, "log stream ended");
                        break SessionEnd::Disconnected { saw_lines };
                    }
                    Err(err) => {
                        warn!(host = %self.target.host, error = %err, "read error on log stream");
                        break SessionEnd::Disconnected { saw_lines };
                    }
                }
            }
        };

        shutdown(&mut child).await;
        Ok(end)
    }

    /// Wait for the ready sentinel within the connect timeout. Returns false
    /// on timeout, stream end, unexpected output or cancellation.
    async fn await_ready(&self, lines: &mut Lines<BufReader<ChildStdout>>) -> bool {
        let greeting = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            r = tokio::time::timeout(self.target.connect_timeout, lines.next_line()) => r,
        };

        match greeting {
            Ok(Ok(Some(line))) if line == READY_SENTINEL => true,
            Ok(Ok(Some(line))) => {
                warn!(host = %self.target.host, line = %line, "unexpected session greeting");
                false
            }
            Ok(Ok(None)) => {
                warn!(host = %self.target.host, "session closed during connect");
                false
            }
            Ok(Err(err)) => {
                warn!(host = %self.target.host, error = %err, "connect failed");
                false
            }
            Err(_) => {
                warn!(
                    host = %self.target.host,
                    timeout = ?self.target.connect_timeout,
                    "connect timed out"
                );
                false
            }
        }
    }

    /// Apply one log line to the registry. Parse failures drop the whole
    /// line and count toward `parser_errors`; only true programmer errors
    /// (unknown family, kind conflict) propagate.
    fn ingest(&self, line: &str) -> Result<(), RegistryError> {
        let parsed = match self.parser.parse(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(host = %self.target.host, error = %err, line, "dropping unparseable line");
                return self.registry.add(metrics::PARSER_ERRORS, &self.base_labels, 1.0);
            }
        };

        for (metric, value) in &parsed.samples {
            match self.registry.add(metric, &parsed.labels, *value) {
                Ok(()) => {}
                // A negative sample for a counter family is a parse-level
                // rejection, same as a ParseError. The parser's monotonic
                // guard normally catches this first.
                Err(err @ RegistryError::NegativeCounter { .. }) => {
                    debug!(host = %self.target.host, error = %err, line, "dropping line with negative counter sample");
                    return self.registry.add(metrics::PARSER_ERRORS, &self.base_labels, 1.0);
                }
                Err(err) => return Err(err),
            }
        }

        self.registry.add(metrics::LINES_PARSED, &self.base_labels, 1.0)
    }

    fn set_connected(&self, value: f64) {
        if let Err(err) = self.registry.add(metrics::CONNECTED, &self.base_labels, value) {
            error!(host = %self.target.host, error = %err, "failed to update connected gauge");
        }
    }
}

async fn shutdown(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Instant;

    use tempfile::NamedTempFile;
    use tokio::process::Command;
    use tokio::time::timeout;

    use crate::parser::{base_labels, ColumnReader, LineParser};

    /// Runs the remote command in a local shell instead of ssh.
    struct ShellTransport;

    impl TailTransport for ShellTransport {
        fn command(&self, _target: &TargetSpec, remote_cmd: &str) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(remote_cmd);
            cmd.stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true);
            cmd
        }
    }

    fn test_target(file: &str, host: &str) -> TargetSpec {
        TargetSpec {
            environment: "prod".to_string(),
            host: host.to_string(),
            file: file.to_string(),
            user: None,
            password: None,
            pkey: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn test_schema() -> Arc<Vec<Option<ColumnReader>>> {
        Arc::new(vec![
            Some(ColumnReader::Label {
                name: "ip".to_string(),
            }),
            Some(ColumnReader::Number {
                metric: "bytes".to_string(),
                monotonic: true,
            }),
        ])
    }

    fn test_registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new("test", Duration::from_secs(300)));
        registry
            .register("bytes", "help", metrics::MetricKind::Counter, None, false)
            .unwrap();
        registry
    }

    fn spawn_worker(
        file: &str,
        host: &str,
        registry: Arc<Registry>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let target = test_target(file, host);
        let parser = LineParser::new(test_schema(), base_labels("prod", host));
        let cancel = CancellationToken::new();
        let worker = TailWorker::new(
            target,
            parser,
            registry,
            Arc::new(ShellTransport),
            cancel.clone(),
        );
        (cancel.clone(), tokio::spawn(worker.run()))
    }

    /// Poll the registry exposition until it contains `needle`.
    async fn wait_for(registry: &Registry, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if registry.render().contains(needle) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?} in:\n{}",
                needle,
                registry.render()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.advance(), Duration::from_secs(1));
        assert_eq!(backoff.advance(), Duration::from_secs(2));
        assert_eq!(backoff.advance(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.advance();
        }
        assert_eq!(backoff.advance(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.advance(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn worker_tails_appended_lines() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let registry = test_registry();
        let (cancel, handle) = spawn_worker(&path, "h1", registry.clone());

        wait_for(&registry, "test_connected{environment=\"prod\",host=\"h1\"} 1").await;
        // Give tail a moment to open the file; it only reports lines
        // appended after it starts.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut appender = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(appender, "10.0.0.1 512").unwrap();
        appender.flush().unwrap();

        wait_for(
            &registry,
            "test_bytes{environment=\"prod\",host=\"h1\",ip=\"10.0.0.1\"} 512",
        )
        .await;
        wait_for(&registry, "test_lines_parsed{environment=\"prod\",host=\"h1\"} 1").await;

        cancel.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();

        assert!(registry
            .render()
            .contains("test_connected{environment=\"prod\",host=\"h1\"} 0"));
    }

    #[tokio::test]
    async fn worker_counts_parse_errors_without_updating_metrics() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let registry = test_registry();
        let (cancel, handle) = spawn_worker(&path, "h1", registry.clone());

        wait_for(&registry, "test_connected{environment=\"prod\",host=\"h1\"} 1").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut appender = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(appender, "10.0.0.1 notanumber").unwrap();
        appender.flush().unwrap();

        wait_for(&registry, "test_parser_errors{environment=\"prod\",host=\"h1\"} 1").await;

        let text = registry.render();
        assert!(!text.contains("test_bytes{"), "no sample may survive a parse error:\n{text}");
        assert!(!text.contains("test_lines_parsed{environment=\"prod\",host=\"h1\"}"));

        cancel.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn negative_counter_sample_is_recovered_as_parse_error() {
        // A schema can only mark a column non-monotonic when it feeds a
        // histogram, so the registry-level counter guard is a fallback; a
        // line tripping it must count as a parse error, not kill the worker.
        let registry = test_registry();
        let columns: Arc<Vec<Option<ColumnReader>>> = Arc::new(vec![Some(ColumnReader::Number {
            metric: "bytes".to_string(),
            monotonic: false,
        })]);
        let parser = LineParser::new(columns, base_labels("prod", "h1"));
        let worker = TailWorker::new(
            test_target("/tmp/unused.log", "h1"),
            parser,
            registry.clone(),
            Arc::new(ShellTransport),
            CancellationToken::new(),
        );

        worker.ingest("-5").unwrap();

        let text = registry.render();
        assert!(text.contains("test_parser_errors{environment=\"prod\",host=\"h1\"} 1"));
        assert!(!text.contains("test_bytes{"), "negative sample must not land:\n{text}");
        assert!(!text.contains("test_lines_parsed{environment=\"prod\",host=\"h1\"}"));
    }

    #[tokio::test]
    async fn cancellation_is_bounded_without_log_traffic() {
        // Point the worker at a file that does not exist; tail produces no
        // lines, so cancellation must interrupt a quiet session.
        let registry = test_registry();
        let (cancel, handle) = spawn_worker("/nonexistent/dir/file.log", "h9", registry.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();

        assert!(registry
            .render()
            .contains("test_connected{environment=\"prod\",host=\"h9\"} 0"));
    }
}
