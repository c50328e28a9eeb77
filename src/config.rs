use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

/// Connection parameters for the storage backend.
///
/// `port` stays textual so service names resolve the same way collection
/// URIs do.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub host: String,
    pub port: String,
    pub user: String,
    pub pass: String,
    /// Extra conninfo parameters appended verbatim.
    pub conninfo_extra: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: "5432".into(),
            user: "oml".into(),
            pass: String::new(),
            conninfo_extra: String::new(),
        }
    }
}

/// Collector configuration, from a TOML file with environment overrides.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    /// Address the collection listener binds to.
    pub listen: String,
    pub backend: BackendConfig,
    /// Transaction window grain in seconds; this is both the flush interval
    /// and the worst-case data loss on a crash.
    pub commit_interval_secs: u64,
    /// When set, sessions are proxied byte-for-byte to this collection URI
    /// instead of being persisted to the backend.
    pub forward: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3003".into(),
            backend: BackendConfig::default(),
            commit_interval_secs: 1,
            forward: None,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("could not read configuration {path:?}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("could not parse configuration {path:?}: {source}"))]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[snafu(display("invalid {var}: {value:?}"))]
    BadEnvValue { var: String, value: String },
}

impl CollectorConfig {
    /// Loads the file named by `OML_CONFIG` (if any), then applies
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("OML_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        toml::from_str(&text).context(ParseSnafu {
            path: path.display().to_string(),
        })
    }

    /// Applies `OML_*` overrides through the given environment lookup.
    pub fn apply_env(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(listen) = env("OML_LISTEN") {
            self.listen = listen;
        }
        if let Some(host) = env("OML_PG_HOST") {
            self.backend.host = host;
        }
        if let Some(port) = env("OML_PG_PORT") {
            self.backend.port = port;
        }
        if let Some(user) = env("OML_PG_USER") {
            self.backend.user = user;
        }
        if let Some(pass) = env("OML_PG_PASS") {
            self.backend.pass = pass;
        }
        if let Some(extra) = env("OML_PG_CONNINFO") {
            self.backend.conninfo_extra = extra;
        }
        if let Some(interval) = env("OML_COMMIT_INTERVAL") {
            self.commit_interval_secs =
                interval.parse().ok().filter(|n| *n > 0).ok_or_else(|| {
                    ConfigError::BadEnvValue {
                        var: "OML_COMMIT_INTERVAL".into(),
                        value: interval.clone(),
                    }
                })?;
        }
        if let Some(forward) = env("OML_FORWARD") {
            self.forward = Some(forward);
        }
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }
}
