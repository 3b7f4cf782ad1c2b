//! Command-line configuration for the engine binary
//!
//! Engine behaviour (capacity, providers, models) lives in the JSON file passed with `-f`;
//! the flags here only control the process around it.
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the control surface will listen.
    #[arg(short = 'p', long, env = "VRAMKEEPER_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The engine configuration file.
    #[arg(short = 'f', long, env = "VRAMKEEPER_CONFIG")]
    pub config: PathBuf,

    /// Whether to keep watching the config file and merge model changes.
    #[arg(short = 'w', long, default_value_t = true)]
    pub watch: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "vramkeeper")]
    pub metrics_prefix: String,

    /// Where to write the warm-start snapshot. Read at startup if present.
    #[arg(long, env = "VRAMKEEPER_SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// Log at debug level for this crate, overriding RUST_LOG.
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "metrics port {} clashes with the control surface port",
                self.metrics_port
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_rejected() {
        let config = Config::parse_from(["vramkeeper", "-f", "/no/such/engine.json"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["vramkeeper", "-f", "engine.json"]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.metrics_port, 9090);
        assert!(config.watch);
        assert!(config.snapshot.is_none());
        assert_eq!(config.metrics_prefix, "vramkeeper");
    }

    #[test]
    fn test_port_clash_rejected() {
        let path = std::env::temp_dir().join(format!("vramkeeper-{}-cli.json", std::process::id()));
        std::fs::write(&path, "{}").unwrap();
        let config = Config::parse_from([
            "vramkeeper",
            "-f",
            path.to_str().unwrap(),
            "--port",
            "9090",
        ]);
        assert!(config.validate().is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
