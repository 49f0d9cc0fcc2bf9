use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub listen: String,
    /// How long a worker waits for the next message before checking again.
    pub receive_timeout_secs: u64,
    pub gc_interval_secs: u64,
    /// Period of the statistics log line; 0 disables it.
    pub stats_interval_secs: u64,
    /// Outbound PDUs queued per connection before sends fail.
    pub outbound_queue: usize,
    pub max_connections: usize,
}

impl ServerConfig {
    /// Load from `path` if given, else from the default config file if it
    /// exists, else fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Self::config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("server.toml")
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs.max(1))
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("127.0.0.1:{}", ackchat::protocol::DEFAULT_PORT),
            receive_timeout_secs: 1200,
            gc_interval_secs: 30,
            stats_interval_secs: 60,
            outbound_queue: ackchat::connection::DEFAULT_OUTBOUND_QUEUE,
            max_connections: 1000,
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("ackchat")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("ackchat")
    } else {
        PathBuf::from("/tmp/ackchat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "127.0.0.1:50000");
        assert_eq!(config.receive_timeout(), Duration::from_secs(1200));
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen = \"0.0.0.0:6000\"\nstats_interval_secs = 0").unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen, "0.0.0.0:6000");
        assert_eq!(config.stats_interval(), None);
        assert_eq!(config.gc_interval_secs, 30);
        assert_eq!(config.max_connections, 1000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lisen = \"0.0.0.0:6000\"").unwrap();
        assert!(ServerConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
