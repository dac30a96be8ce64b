// SPDX-License-Identifier: Apache-2.0

//! Metric registry with labeled children, TTL-based expiry and Prometheus
//! text exposition.
//!
//! Families are registered once at startup and live for the process
//! lifetime. Children are created lazily on first write, keyed by their
//! full label-value map, and swept when they have not been updated within
//! the registry TTL. The `connected` gauge family is exempt from sweeping
//! so that a silent target still reports its connection state.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Counter of log lines that parsed successfully, per worker.
pub const LINES_PARSED: &str = "lines_parsed";
/// Counter of log lines rejected by the parser, per worker.
pub const PARSER_ERRORS: &str = "parser_errors";
/// Gauge reporting whether the SSH session to a target is established.
pub const CONNECTED: &str = "connected";

/// Standard Prometheus histogram buckets, used when a configured histogram
/// has an empty bucket list.
pub const DEFAULT_HISTOGRAM_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("metric family {name:?} already registered as {existing}")]
    KindConflict { name: String, existing: MetricKind },

    #[error("unknown metric family {0:?}")]
    UnknownFamily(String),

    #[error("negative increment {value} for counter {name:?}")]
    NegativeCounter { name: String, value: f64 },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical label-value map. BTreeMap keeps label names in lexicographic
/// order so child identity and exposition order are deterministic.
pub type LabelSet = BTreeMap<String, String>;

/// Build a [`LabelSet`] from (name, value) pairs.
pub fn labels<I, K, V>(pairs: I) -> LabelSet
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[derive(Debug)]
enum ChildValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        /// Per-bucket (non-cumulative) counts for the finite upper bounds.
        /// Observations above the last bound only count toward `count`.
        buckets: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

#[derive(Debug)]
struct Child {
    last_update: Instant,
    value: ChildValue,
}

#[derive(Debug)]
struct Family {
    help: String,
    kind: MetricKind,
    /// Upper bounds for histogram families, empty otherwise.
    buckets: Vec<f64>,
    ttl_exempt: bool,
    children: BTreeMap<LabelSet, Child>,
}

/// Shared metric registry. Many writers (one per scrape worker), one reader
/// (the exposition handler). A single registry-wide lock keeps children from
/// being observed mid-update; scrape latency stays bounded because render
/// only formats in-memory state.
pub struct Registry {
    prefix: String,
    ttl: Duration,
    families: RwLock<BTreeMap<String, Family>>,
}

impl Registry {
    /// Create a registry with the given family name prefix and child TTL.
    /// The reserved families are registered up front so they are always
    /// present in the exposition.
    pub fn new(prefix: impl Into<String>, ttl: Duration) -> Self {
        let registry = Registry {
            prefix: prefix.into(),
            ttl,
            families: RwLock::new(BTreeMap::new()),
        };

        registry
            .register(
                LINES_PARSED,
                "Total number of log lines parsed successfully.",
                MetricKind::Counter,
                None,
                false,
            )
            .expect("reserved family registration cannot conflict");
        registry
            .register(
                PARSER_ERRORS,
                "Total number of log lines rejected by the parser.",
                MetricKind::Counter,
                None,
                false,
            )
            .expect("reserved family registration cannot conflict");
        registry
            .register(
                CONNECTED,
                "Whether the SSH session to the target host is established.",
                MetricKind::Gauge,
                None,
                true,
            )
            .expect("reserved family registration cannot conflict");

        registry
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a metric family. Registering the same name with the same
    /// kind is a no-op; a kind mismatch is a programmer error.
    pub fn register(
        &self,
        name: &str,
        help: &str,
        kind: MetricKind,
        buckets: Option<&[f64]>,
        ttl_exempt: bool,
    ) -> Result<()> {
        let mut families = self.families.write().unwrap();

        if let Some(existing) = families.get(name) {
            if existing.kind != kind {
                return Err(RegistryError::KindConflict {
                    name: name.to_string(),
                    existing: existing.kind,
                });
            }
            return Ok(());
        }

        let buckets = match kind {
            MetricKind::Histogram => match buckets {
                Some(b) if !b.is_empty() => b.to_vec(),
                _ => DEFAULT_HISTOGRAM_BUCKETS.to_vec(),
            },
            _ => Vec::new(),
        };

        families.insert(
            name.to_string(),
            Family {
                help: help.to_string(),
                kind,
                buckets,
                ttl_exempt,
                children: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Update the child of `name` identified by `labels`. Counters increment
    /// by `value`, gauges are set to `value`, histograms observe `value`.
    pub fn add(&self, name: &str, labels: &LabelSet, value: f64) -> Result<()> {
        let mut families = self.families.write().unwrap();
        let family = families
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownFamily(name.to_string()))?;

        if family.kind == MetricKind::Counter && value < 0.0 {
            return Err(RegistryError::NegativeCounter {
                name: name.to_string(),
                value,
            });
        }

        let now = Instant::now();
        let kind = family.kind;
        let bucket_count = family.buckets.len();
        let bucket_idx = family.buckets.iter().position(|bound| value <= *bound);

        let child = family.children.entry(labels.clone()).or_insert_with(|| Child {
            last_update: now,
            value: match kind {
                MetricKind::Counter => ChildValue::Counter(0.0),
                MetricKind::Gauge => ChildValue::Gauge(0.0),
                MetricKind::Histogram => ChildValue::Histogram {
                    buckets: vec![0; bucket_count],
                    sum: 0.0,
                    count: 0,
                },
            },
        });

        child.last_update = now;
        match &mut child.value {
            ChildValue::Counter(total) => *total += value,
            ChildValue::Gauge(current) => *current = value,
            ChildValue::Histogram {
                buckets,
                sum,
                count,
            } => {
                if let Some(idx) = bucket_idx {
                    buckets[idx] += 1;
                }
                *sum += value;
                *count += 1;
            }
        }
        Ok(())
    }

    /// Remove every child whose last update is older than `now - TTL`,
    /// except children of TTL-exempt families.
    pub fn sweep(&self, now: Instant) {
        let ttl = self.ttl;
        let mut families = self.families.write().unwrap();
        for family in families.values_mut() {
            if family.ttl_exempt {
                continue;
            }
            family
                .children
                .retain(|_, child| now.saturating_duration_since(child.last_update) <= ttl);
        }
    }

    /// Render the full Prometheus text exposition. Families appear in name
    /// order and children in canonical label order, so consecutive renders
    /// of unchanged state are byte-identical.
    pub fn render(&self) -> String {
        let families = self.families.read().unwrap();
        let mut out = String::with_capacity(4096);

        for (name, family) in families.iter() {
            let full_name = self.prefixed(name);
            writeln!(out, "# HELP {} {}", full_name, family.help).unwrap();
            writeln!(out, "# TYPE {} {}", full_name, family.kind).unwrap();

            for (labels, child) in family.children.iter() {
                match &child.value {
                    ChildValue::Counter(v) | ChildValue::Gauge(v) => {
                        writeln!(out, "{}{} {}", full_name, format_labels(labels, None), v)
                            .unwrap();
                    }
                    ChildValue::Histogram {
                        buckets,
                        sum,
                        count,
                    } => {
                        let mut cumulative = 0u64;
                        for (bound, bucket) in family.buckets.iter().zip(buckets) {
                            cumulative += bucket;
                            let bound = bound.to_string();
                            writeln!(
                                out,
                                "{}_bucket{} {}",
                                full_name,
                                format_labels(labels, Some(bound.as_str())),
                                cumulative
                            )
                            .unwrap();
                        }
                        writeln!(
                            out,
                            "{}_bucket{} {}",
                            full_name,
                            format_labels(labels, Some("+Inf")),
                            count
                        )
                        .unwrap();
                        writeln!(out, "{}_sum{} {}", full_name, format_labels(labels, None), sum)
                            .unwrap();
                        writeln!(
                            out,
                            "{}_count{} {}",
                            full_name,
                            format_labels(labels, None),
                            count
                        )
                        .unwrap();
                    }
                }
            }
        }

        out
    }

    fn prefixed(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.prefix, name)
        }
    }
}

/// Format a label set as `{a="x",b="y"}`, optionally appending an `le`
/// bound for histogram bucket rows. Returns the empty string for an empty
/// label set.
fn format_labels(labels: &LabelSet, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }

    let mut out = String::from("{");
    let mut first = true;
    for (name, value) in labels {
        if !first {
            out.push(',');
        }
        first = false;
        write!(out, "{}=\"{}\"", name, escape_label_value(value)).unwrap();
    }
    if let Some(bound) = le {
        if !first {
            out.push(',');
        }
        write!(out, "le=\"{}\"", bound).unwrap();
    }
    out.push('}');
    out
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
