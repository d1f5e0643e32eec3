use std::path::Path;

use facet::Facet;

use crate::error::PveError;

#[derive(Debug, Clone, Facet)]
pub struct Config {
    pub cluster: ClusterConfig,
    #[facet(default)]
    pub watch: WatchConfig,
}

/// Where the cluster lives and how to authenticate against it.
///
/// Either `token_id` + `token_secret` or `password` must be set, not both.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ClusterConfig {
    pub host: String,
    #[facet(default = 8006)]
    pub port: u16,
    #[facet(default = "root@pam")]
    pub user: String,
    #[facet(default)]
    pub token_id: String,
    #[facet(default)]
    pub token_secret: String,
    #[facet(default)]
    pub password: String,
    #[facet(default = true)]
    pub verify_tls: bool,
    #[facet(default = 30)]
    pub timeout_s: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8006,
            user: "root@pam".into(),
            token_id: String::new(),
            token_secret: String::new(),
            password: String::new(),
            verify_tls: true,
            timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct WatchConfig {
    /// Upper bound on status polling when a task's log cannot be followed.
    #[facet(default = 300)]
    pub max_wait_s: u64,
    #[facet(default = 1000)]
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_wait_s: 300,
            poll_interval_ms: 1000,
        }
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), PveError> {
    let cluster = &config.cluster;
    if cluster.host.trim().is_empty() {
        return Err(PveError::Validation {
            message: "cluster.host must be set".into(),
        });
    }
    if cluster.port == 0 {
        return Err(PveError::Validation {
            message: "cluster.port must not be 0".into(),
        });
    }

    match cluster.user.split_once('@') {
        Some((name, realm)) if !name.is_empty() && !realm.is_empty() => {}
        _ => {
            return Err(PveError::Validation {
                message: format!(
                    "cluster.user must have the form user@realm (got '{}')",
                    cluster.user
                ),
            });
        }
    }

    let token = !cluster.token_id.is_empty() || !cluster.token_secret.is_empty();
    let password = !cluster.password.is_empty();
    if token && password {
        return Err(PveError::Validation {
            message: "set either token_id/token_secret or password, not both".into(),
        });
    }
    if !token && !password {
        return Err(PveError::Validation {
            message: "no credentials: set token_id and token_secret, or password".into(),
        });
    }
    if token && (cluster.token_id.is_empty() || cluster.token_secret.is_empty()) {
        return Err(PveError::Validation {
            message: "token_id and token_secret must be set together".into(),
        });
    }

    if config.watch.poll_interval_ms < 100 {
        return Err(PveError::Validation {
            message: format!(
                "watch.poll_interval_ms must be at least 100 (got {})",
                config.watch.poll_interval_ms
            ),
        });
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<Config, PveError> {
    let contents = std::fs::read_to_string(path).map_err(|source| PveError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| PveError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config).map_err(|e| match e {
        PveError::Validation { message } => PveError::Validation {
            message: format!("{}: {message}", path.display()),
        },
        other => other,
    })?;

    tracing::debug!(path = %path.display(), host = %config.cluster.host, "loaded config");
    Ok(config)
}
