//! Configuration Loader
//!
//! Environment-aware loading: built-in defaults, then `config/deploy.toml` (or
//! `config/deploy.<environment>.toml` when present), then `DEPLOY__*`
//! environment variables.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::ConfigResult;
use super::DeployConfig;

const ENV_PREFIX: &str = "DEPLOY";

pub struct ConfigManager {
    config: DeployConfig,
    environment: String,
    config_file: Option<PathBuf>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self {
            config: DeployConfig::default(),
            environment: Self::detect_environment(),
            config_file: None,
        }
    }
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        let file = Self::default_config_file(&environment);
        Self::load_from_file_with_env(file.as_deref(), &environment)
    }

    /// Load configuration from a specific file with an explicit environment.
    /// Useful in tests that must not touch global environment variables.
    pub fn load_from_file_with_env(
        path: Option<&Path>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&DeployConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: DeployConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            config = %serde_json::to_string(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string()),
            "Configuration loaded"
        );
        info!(
            environment = environment,
            config_file = ?path,
            max_connections = config.database.max_connections,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_file: path.map(Path::to_path_buf),
        }))
    }

    /// Wrap an already-built configuration
    pub fn from_config(config: DeployConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_file: None,
        }))
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn detect_environment() -> String {
        env::var("DEPLOY_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_file(environment: &str) -> Option<PathBuf> {
        let dir = env::var("DEPLOY_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"));
        [
            dir.join(format!("deploy.{environment}.toml")),
            dir.join("deploy.toml"),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
    }

    /// Mask credentials before configuration is logged
    fn sanitize_config_for_logging(config: &DeployConfig) -> serde_json::Value {
        let mut value = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
        for key in ["url", "read_replica_url"] {
            if let Some(slot) = value.pointer_mut(&format!("/database/{key}")) {
                if let Some(url) = slot.as_str() {
                    *slot = serde_json::Value::String(mask_credentials(url));
                }
            }
        }
        value
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("environment", &self.environment)
            .field("config_file", &self.config_file)
            .finish()
    }
}

fn mask_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pipeline]\nestimate_sample_size = 8\n\n[admission]\nsave_rejected_by_freeze = true\n"
        )
        .unwrap();

        let manager = ConfigManager::load_from_file_with_env(Some(file.path()), "test").unwrap();
        assert_eq!(manager.config().pipeline.estimate_sample_size, 8);
        assert!(manager.config().admission.save_rejected_by_freeze);
        assert_eq!(manager.config().graph_cache.tree_ttl_days, 30);
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[events]\nchannel_capacity = 0\n").unwrap();
        assert!(ConfigManager::load_from_file_with_env(Some(file.path()), "test").is_err());
    }

    #[test]
    fn credentials_are_masked() {
        assert_eq!(
            mask_credentials("postgresql://user:secret@db:5432/deploy"),
            "postgresql://***@db:5432/deploy"
        );
        assert_eq!(mask_credentials("postgresql://db/deploy"), "postgresql://db/deploy");
    }
}
