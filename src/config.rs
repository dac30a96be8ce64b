// SPDX-License-Identifier: Apache-2.0

//! Scrape configuration.
//!
//! The YAML document at `$SCRAPECONFIG` declares the metric schema
//! (`global`) and the SSH inventory (`ssh`), plus an optional inventory
//! script. Loading is two-phase: serde deserialization into the raw shape,
//! then [`ScrapeConfig::compile`] which validates the column schema and
//! produces the readers and metric families. All validation failures are
//! fatal at startup.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{self, MetricKind};
use crate::parser::ColumnReader;

/// Default location of the scrape configuration.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/scrapeconfig.yml";

/// Default SSH connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 30;

const RESERVED_METRICS: &[&str] = &[
    metrics::LINES_PARSED,
    metrics::PARSER_ERRORS,
    metrics::CONNECTED,
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("format entry {index} must map exactly one column name")]
    AmbiguousColumn { index: usize },

    #[error("unknown column kind {kind:?} for column {name:?}")]
    UnknownKind { name: String, kind: String },

    #[error("column {0:?} uses the reserved label name \"environment\"")]
    ReservedLabel(String),

    #[error("column {0:?} shadows a reserved metric name")]
    ReservedMetric(String),

    #[error("column {name:?} references unknown histogram {histogram:?}")]
    UnknownHistogram { name: String, histogram: String },

    #[error("column {name:?}: kind {kind:?} cannot feed a histogram")]
    HistogramKind { name: String, kind: String },

    #[error("histogram {0:?} bucket bounds must be strictly increasing")]
    BucketOrder(String),

    #[error("column {0:?} is declared with conflicting metric kinds")]
    ConflictingColumn(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default)]
    pub global: GlobalSection,
    #[serde(default)]
    pub ssh: SshSection,
    /// Inventory script; its stdout is parsed as another ScrapeConfig.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Seconds between inventory script invocations. Absent means the
    /// script runs once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSection {
    /// Child TTL in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// Prefix prepended to every exported family name.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Histogram bucket declarations, referenced from column type
    /// expressions. An empty list selects the standard buckets.
    #[serde(default)]
    pub histograms: BTreeMap<String, Vec<f64>>,
    /// Ordered column schema. Entries are single-key maps
    /// (`column_name: type_expr`) or null to skip a column.
    #[serde(default)]
    pub format: Vec<Option<BTreeMap<String, String>>>,
}

impl Default for GlobalSection {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            prefix: default_prefix(),
            histograms: BTreeMap::new(),
            format: Vec::new(),
        }
    }
}

fn default_ttl() -> u64 {
    600
}

fn default_prefix() -> String {
    "tailscrape".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
}

/// One scrape target resolved from the inventory: per-environment values
/// override the SSH-level defaults. Absent fields stay unset and surface as
/// runtime connect failures, not config errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub environment: String,
    pub host: String,
    pub file: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub pkey: Option<String>,
    pub connect_timeout: Duration,
}

impl TargetSpec {
    /// Stable identity of the (host, file) pair.
    pub fn target_id(&self) -> String {
        format!("ssh://{}/{}", self.host, self.file.trim_start_matches('/'))
    }
}

/// A metric family to register at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilySpec {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub buckets: Option<Vec<f64>>,
}

/// The compiled column schema: readers in declared order plus the metric
/// families the schema requires.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub columns: Vec<Option<ColumnReader>>,
    pub families: Vec<FamilySpec>,
}

impl Schema {
    /// Register every schema family with the registry.
    pub fn register(&self, registry: &metrics::Registry) -> metrics::Result<()> {
        for family in &self.families {
            registry.register(
                &family.name,
                &family.help,
                family.kind,
                family.buckets.as_deref(),
                false,
            )?;
        }
        Ok(())
    }
}

impl ScrapeConfig {
    /// Load and deserialize the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Deserialize a configuration document, e.g. inventory script output.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.global.ttl)
    }

    /// Validate the column schema and build the readers and family specs.
    pub fn compile(&self) -> Result<Schema> {
        for (name, buckets) in &self.global.histograms {
            if !buckets.windows(2).all(|w| w[0] < w[1]) {
                return Err(ConfigError::BucketOrder(name.clone()));
            }
        }

        let mut columns = Vec::with_capacity(self.global.format.len());
        let mut families: BTreeMap<String, FamilySpec> = BTreeMap::new();

        for (index, entry) in self.global.format.iter().enumerate() {
            let entry = match entry {
                None => {
                    columns.push(None);
                    continue;
                }
                Some(map) => map,
            };

            if entry.len() != 1 {
                return Err(ConfigError::AmbiguousColumn { index });
            }
            let (name, type_expr) = entry.iter().next().unwrap();

            let (kind, histogram) = match type_expr.split_once('+') {
                Some((kind, histogram)) => (kind.trim(), Some(histogram.trim())),
                None => (type_expr.trim(), None),
            };

            if let Some(histogram) = histogram {
                if kind != "number" && kind != "clf_number" {
                    return Err(ConfigError::HistogramKind {
                        name: name.clone(),
                        kind: kind.to_string(),
                    });
                }
                if !self.global.histograms.contains_key(histogram) {
                    return Err(ConfigError::UnknownHistogram {
                        name: name.clone(),
                        histogram: histogram.to_string(),
                    });
                }
            }

            let reader = match kind {
                "label" => {
                    if name == "environment" {
                        return Err(ConfigError::ReservedLabel(name.clone()));
                    }
                    ColumnReader::Label { name: name.clone() }
                }
                "request" => ColumnReader::Request,
                "request_header" => ColumnReader::RequestHeader,
                "clf_date" => ColumnReader::ClfDate,
                "number" | "clf_number" => {
                    if RESERVED_METRICS.contains(&name.as_str()) {
                        return Err(ConfigError::ReservedMetric(name.clone()));
                    }

                    let spec = match histogram {
                        Some(histogram) => FamilySpec {
                            name: name.clone(),
                            help: format!(
                                "Distribution of the {} column of matched log lines.",
                                name
                            ),
                            kind: MetricKind::Histogram,
                            buckets: match self.global.histograms[histogram].as_slice() {
                                [] => None,
                                buckets => Some(buckets.to_vec()),
                            },
                        },
                        None => FamilySpec {
                            name: name.clone(),
                            help: format!("Sum of the {} column of matched log lines.", name),
                            kind: MetricKind::Counter,
                            buckets: None,
                        },
                    };

                    if let Some(existing) = families.get(name) {
                        if existing.kind != spec.kind || existing.buckets != spec.buckets {
                            return Err(ConfigError::ConflictingColumn(name.clone()));
                        }
                    } else {
                        families.insert(name.clone(), spec);
                    }

                    let monotonic = histogram.is_none();
                    if kind == "number" {
                        ColumnReader::Number {
                            metric: name.clone(),
                            monotonic,
                        }
                    } else {
                        ColumnReader::ClfNumber {
                            metric: name.clone(),
                            monotonic,
                        }
                    }
                }
                other => {
                    return Err(ConfigError::UnknownKind {
                        name: name.clone(),
                        kind: other.to_string(),
                    });
                }
            };

            columns.push(Some(reader));
        }

        Ok(Schema {
            columns,
            families: families.into_values().collect(),
        })
    }

    /// Resolve the static inventory into scrape targets.
    pub fn targets(&self) -> Vec<TargetSpec> {
        let mut out = Vec::new();
        for (env_name, env) in &self.ssh.environments {
            for host in &env.hosts {
                out.push(TargetSpec {
                    environment: env_name.clone(),
                    host: host.clone(),
                    file: env
                        .file
                        .clone()
                        .or_else(|| self.ssh.file.clone())
                        .unwrap_or_default(),
                    user: env.user.clone().or_else(|| self.ssh.user.clone()),
                    password: env.password.clone().or_else(|| self.ssh.password.clone()),
                    pkey: env.pkey.clone().or_else(|| self.ssh.pkey.clone()),
                    connect_timeout: Duration::from_secs(
                        env.connect_timeout
                            .or(self.ssh.connect_timeout)
                            .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
                    ),
                });
            }
        }
        out
    }
}
