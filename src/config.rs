//! Node-level configuration: the value a `PipelineNode` is built from,
//! composing a top-level config out of smaller serde-`Deserialize` pieces.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Logging knobs installed by [`PipelineNode::new`](crate::node::PipelineNode::new).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// If set, logs are additionally written to this path (rolling by day).
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Silence the (very chatty) per-PDU association trace the `dimse`
    /// crate emits at `debug` level.
    #[serde(default)]
    pub disable_association_debug_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_path: None,
            disable_association_debug_logging: false,
        }
    }
}

impl LoggingConfig {
    /// Install a `tracing-subscriber` registry matching this configuration:
    /// an `EnvFilter` seeded from `log_level`, stdout always, plus a file
    /// layer when `log_path` is set. Call once, near process start; a second
    /// call is a no-op (the global subscriber can only be installed once).
    pub fn init(&self) {
        use tracing_subscriber::prelude::*;

        let filter = if self.disable_association_debug_logging {
            tracing_subscriber::EnvFilter::new(format!("{},dimse=info", self.log_level))
        } else {
            tracing_subscriber::EnvFilter::new(self.log_level.clone())
        };

        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true));

        if let Some(path) = &self.log_path {
            let Ok(file) = std::fs::File::create(path) else {
                let _ = registry.try_init();
                return;
            };
            let _ = registry
                .with(tracing_subscriber::fmt::layer().with_writer(file).with_ansi(false))
                .try_init();
        } else {
            let _ = registry.try_init();
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which [`crate::output::Output`] adapter [`PipelineNode::new`](crate::node::PipelineNode::new)
/// constructs when the caller doesn't supply one explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputConfig {
    None,
    File { directory: PathBuf },
    Dimse { ae_title: String, host: String, port: u16 },
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig::None
    }
}

/// The full configuration a `PipelineNode` is constructed from: network
/// identity, admission policy, filesystem roots, and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineNodeConfig {
    pub ae_title: String,
    #[serde(default = "default_ip")]
    pub ip: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Calling AE titles allowed to associate. Empty means any is accepted.
    #[serde(default)]
    pub require_calling_aet: Vec<String>,
    /// Root directory under which each input's filesystem backing lives,
    /// `<root>/<PatientID>/<input_name>/`. `None` keeps everything in memory.
    #[serde(default)]
    pub root_data_directory: Option<PathBuf>,
    /// Scratch directory handed to `process` as a per-patient working
    /// directory; created and removed around each dispatch.
    #[serde(default = "default_processing_directory")]
    pub processing_directory: PathBuf,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineNodeConfig {
    pub fn new(ae_title: impl Into<String>) -> Self {
        Self {
            ae_title: ae_title.into(),
            ip: default_ip(),
            port: default_port(),
            require_calling_aet: Vec::new(),
            root_data_directory: None,
            processing_directory: default_processing_directory(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.ae_title.is_empty() || self.ae_title.len() > 16 {
            return Err(crate::error::NodeError::internal(
                "ae_title must be 1-16 characters",
            ));
        }
        if self.port == 0 {
            return Err(crate::error::NodeError::internal("port must be greater than 0"));
        }
        Ok(())
    }
}

fn default_ip() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    dimse::DEFAULT_DIMSE_PORT
}

fn default_processing_directory() -> PathBuf {
    PathBuf::from("./tmp/processing")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_ae_title() {
        let mut config = PipelineNodeConfig::new("VALID_AET");
        config.ae_title = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_port_matches_dimse_default() {
        let config = PipelineNodeConfig::new("VALID_AET");
        assert_eq!(config.port, dimse::DEFAULT_DIMSE_PORT);
    }
}
