//! Startup configuration.
//!
//! Values come from the process environment (after loading `.env`) layered over an
//! optional flat JSON object named by `CONFIG_FILE`. Each binary builds its config once
//! and passes it down; nothing else reads the environment.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ledger::NewClient;
use crate::messages::{Pricing, PublishTopics};
use crate::worker::WorkerSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("config file `{path}` must be a JSON object of strings: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("`{key}` must be set")]
    Missing { key: &'static str },
    #[error("invalid value `{value}` for `{key}`")]
    Invalid { key: &'static str, value: String },
}

/// Flattened key/value view with environment values taking precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut values = match env.get("CONFIG_FILE").map(|p| p.trim()).filter(|p| !p.is_empty()) {
            Some(path) => read_config_file(path)?,
            None => HashMap::new(),
        };
        values.extend(env.into_iter().filter(|(_, value)| !value.trim().is_empty()));
        Ok(Self { values })
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key)
            .map(str::to_string)
            .ok_or(ConfigError::Missing { key })
    }

    /// Unparseable values fall back to the default with a warning.
    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(%key, value = %raw, "ignoring unparseable config value");
                default
            }),
        }
    }

    fn millis(&self, key: &str, default: u64) -> Duration {
        Duration::from_millis(self.parse(key, default))
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    fn socket_addr(&self, key: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
        let raw = self.string(key, default);
        raw.parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw })
    }
}

fn read_config_file(path: &str) -> Result<HashMap<String, String>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub allow_migration_failure: bool,
}

impl DatabaseConfig {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            url: settings.get("DATABASE_URL").map(str::to_string),
            max_connections: settings.parse("DB_MAX_CONNECTIONS", 5),
            allow_migration_failure: settings.flag("ALLOW_MIGRATION_FAILURE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusConfig {
    Memory { partitions: u32 },
    Kafka { brokers: String },
}

impl BusConfig {
    fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let backend = settings.string("BUS_BACKEND", "memory").to_ascii_lowercase();
        match backend.as_str() {
            "memory" => Ok(BusConfig::Memory {
                partitions: settings.parse("BUS_PARTITIONS", 4),
            }),
            "kafka" => Ok(BusConfig::Kafka {
                brokers: settings.required("KAFKA_BROKERS")?,
            }),
            _ => Err(ConfigError::Invalid {
                key: "BUS_BACKEND",
                value: backend,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub bind_address: SocketAddr,
    pub database: DatabaseConfig,
    /// Demo client created at startup when `SEED_DEMO` is set.
    pub seed: Option<NewClient>,
}

impl LedgerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: settings.socket_addr("LEDGER_BIND_ADDRESS", "0.0.0.0:8081")?,
            database: DatabaseConfig::from_settings(settings),
            seed: demo_client(settings),
        })
    }
}

fn demo_client(settings: &Settings) -> Option<NewClient> {
    settings.flag("SEED_DEMO").then(|| NewClient {
        client_id: settings.string("DEMO_CLIENT_ID", "c1"),
        initial_balance_minor: settings.parse("DEMO_BALANCE", 1000),
        normal_price_minor: settings.parse("DEMO_NORMAL_PRICE", 100),
        priority_price_minor: settings.parse("DEMO_PRIORITY_PRICE", 250),
    })
}

/// How the orchestrator reaches the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerTarget {
    Remote { url: String, timeout: Duration },
    /// In-process ledger over the in-memory store, optionally seeded.
    Embedded { seed: Option<NewClient> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub bind_address: SocketAddr,
    pub database: DatabaseConfig,
    pub ledger: LedgerTarget,
    pub bus: BusConfig,
    pub topics: PublishTopics,
    pub status_topic: String,
    pub status_group: String,
    pub pricing: Pricing,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub refund_retry_interval: Duration,
    /// Simulated workers started per topic when running on the in-memory bus.
    pub embedded_workers: u32,
    pub worker: WorkerConfig,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let bind_address = match settings.get("PORT") {
            Some(port) => {
                let raw = format!("{}:{}", settings.string("BIND_ADDRESS", "0.0.0.0"), port);
                raw.parse().map_err(|_| ConfigError::Invalid {
                    key: "PORT",
                    value: raw,
                })?
            }
            None => settings.socket_addr("ORCHESTRATOR_BIND_ADDRESS", "0.0.0.0:8080")?,
        };

        let ledger = match settings.get("LEDGER_URL") {
            Some(url) => LedgerTarget::Remote {
                url: url.to_string(),
                timeout: settings.millis("LEDGER_TIMEOUT_MS", 2000),
            },
            None => LedgerTarget::Embedded {
                seed: demo_client(settings),
            },
        };

        let pricing = match settings.string("PRICING", "configured").to_ascii_lowercase().as_str() {
            "configured" => Pricing::Configured {
                normal_minor: settings.parse("PRICE_NORMAL", 100),
                priority_minor: settings.parse("PRICE_PRIORITY", 250),
            },
            "client_plan" => Pricing::ClientPlan,
            other => {
                return Err(ConfigError::Invalid {
                    key: "PRICING",
                    value: other.to_string(),
                })
            }
        };
        if let Pricing::Configured {
            normal_minor,
            priority_minor,
        } = pricing
        {
            if normal_minor < 0 || priority_minor < 0 {
                return Err(ConfigError::Invalid {
                    key: "PRICE_NORMAL",
                    value: format!("{normal_minor}/{priority_minor}"),
                });
            }
        }

        Ok(Self {
            bind_address,
            database: DatabaseConfig::from_settings(settings),
            ledger,
            bus: BusConfig::from_settings(settings)?,
            topics: PublishTopics {
                normal: settings.string("TOPIC_NORMAL", "sms.normal"),
                priority: settings.string("TOPIC_PRIORITY", "sms.priority"),
            },
            status_topic: settings.string("TOPIC_STATUS", "sms.status"),
            status_group: settings.string("GROUP_STATUS", "message-manager"),
            pricing,
            queue_capacity: settings.parse("PUBLISH_QUEUE_CAPACITY", 1024),
            enqueue_timeout: settings.millis("ENQUEUE_TIMEOUT_MS", 2000),
            refund_retry_interval: settings.millis("REFUND_RETRY_INTERVAL_MS", 30_000),
            embedded_workers: settings.parse("EMBEDDED_WORKERS", 1),
            worker: WorkerConfig::from_settings(settings),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub operator: String,
    pub worker_name: String,
    pub status_topic: String,
    pub accept_latency: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub fail_percent: u32,
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            operator: settings.string("OPERATOR", "mock"),
            worker_name: settings.string("WORKER_NAME", "w1"),
            status_topic: settings.string("TOPIC_STATUS", "sms.status"),
            accept_latency: settings.millis("ACCEPT_LATENCY_MS", 50),
            min_delay: settings.millis("DELIVERY_MIN_MS", 300),
            max_delay: settings.millis("DELIVERY_MAX_MS", 1500),
            fail_percent: settings.parse("FAIL_RATIO_PCT", 10),
        }
    }

    pub fn settings(&self, worker: String) -> WorkerSettings {
        WorkerSettings {
            operator: self.operator.clone(),
            worker,
            status_topic: self.status_topic.clone(),
            accept_latency: self.accept_latency,
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            fail_percent: self.fail_percent,
        }
    }
}

/// Stand-alone worker process: one topic, one consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcessConfig {
    pub topic: String,
    pub group: String,
    pub brokers: String,
    pub worker: WorkerConfig,
}

impl WorkerProcessConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            topic: settings.required("WORKER_TOPIC")?,
            group: settings.required("WORKER_GROUP")?,
            brokers: settings.required("KAFKA_BROKERS")?,
            worker: WorkerConfig::from_settings(settings),
        })
    }
}
