use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::CliConfig;

/// Default engine data directory.
pub const DEFAULT_RKT_DATA_DIR: &str = "/var/lib/rktlet/data";

/// Default address of the exec streaming server.
pub const DEFAULT_STREAM_SERVER_ADDRESS: &str = "0.0.0.0:10241";

/// Default CRI socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/rktlet.sock";

/// Rktlet process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RktletConfig {
    /// Path to the `rkt` binary
    pub rkt_path: PathBuf,

    /// Path to the `systemd-run` binary
    pub systemd_run_path: PathBuf,

    /// Engine data directory (`rkt --dir`)
    pub rkt_data_dir: PathBuf,

    /// Listen address of the exec streaming server
    pub stream_server_address: String,

    /// CRI gRPC Unix socket
    pub socket_path: PathBuf,

    /// Stage1 image used for sandboxes; empty selects the engine default
    pub stage1_name: String,

    /// Engine insecure options applied to every invocation
    pub insecure_options: Vec<String>,

    /// Pass `--debug` to the engine
    pub debug: bool,

    /// Bounded waits while a sandbox starts
    pub poll: PollConfig,

    /// Image of the internal journal-to-CRI log helper app, if enabled
    pub logging_image: Option<String>,
}

impl Default for RktletConfig {
    fn default() -> Self {
        Self {
            rkt_path: PathBuf::from("rkt"),
            systemd_run_path: PathBuf::from("systemd-run"),
            rkt_data_dir: PathBuf::from(DEFAULT_RKT_DATA_DIR),
            stream_server_address: DEFAULT_STREAM_SERVER_ADDRESS.to_string(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            stage1_name: String::new(),
            insecure_options: vec!["image".to_string(), "ondisk".to_string()],
            debug: false,
            poll: PollConfig::default(),
            logging_image: None,
        }
    }
}

impl RktletConfig {
    /// Global engine flags derived from this configuration.
    pub fn cli_config(&self) -> CliConfig {
        CliConfig::builder()
            .debug(self.debug)
            .dir(self.rkt_data_dir.to_string_lossy())
            .insecure_options(self.insecure_options.iter().cloned())
            .build()
    }
}

/// Interval and attempt budget for polling loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between attempts, in milliseconds
    pub interval_ms: u64,
    /// Maximum number of attempts
    pub attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            attempts: 100,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Upper bound on the time a full poll can take.
    pub fn deadline(&self) -> Duration {
        self.interval() * self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RktletConfig::default();
        assert_eq!(config.rkt_data_dir, PathBuf::from("/var/lib/rktlet/data"));
        assert_eq!(config.stream_server_address, "0.0.0.0:10241");
        assert_eq!(config.insecure_options, vec!["image", "ondisk"]);
        assert!(config.logging_image.is_none());
    }

    #[test]
    fn test_default_poll_is_ten_seconds() {
        let poll = PollConfig::default();
        assert_eq!(poll.interval(), Duration::from_millis(100));
        assert_eq!(poll.deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_cli_config_from_defaults() {
        let flags = RktletConfig::default().cli_config().global_flags();
        assert_eq!(
            flags,
            vec!["--dir=/var/lib/rktlet/data", "--insecure-options=image,ondisk"]
        );
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = RktletConfig {
            logging_image: Some("quay.io/rktlet/journal2cri:0.1".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RktletConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.logging_image, config.logging_image);
        assert_eq!(parsed.poll, config.poll);
    }
}
