use super::models::Config;
use config::{ConfigError, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "DAGCARGO_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "dagcargo.toml";
const ENV_PREFIX: &str = "DAGCARGO";
const ENV_SEPARATOR: &str = "__";

/// Path from `DAGCARGO_CONFIG`, falling back to `./dagcargo.toml`
pub fn default_path() -> PathBuf {
    env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration with priority (lowest first):
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if it exists)
/// 3. `.env` file (via dotenvy)
/// 4. Process environment
pub fn load(config_path: &Path) -> Result<Config, ConfigError> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);

    Ok(config)
}

/// Secrets only ever come from the environment
fn load_secrets(config: &mut Config) {
    if let Ok(token) = env::var("CF_API_TOKEN") {
        config.kv.api_token = Some(token);
    }
    if let Ok(password) = env::var("PROM_PUSH_PASSWORD") {
        config.metrics.push_password = Some(password);
    }
}

/// File + environment layers without secrets
pub fn load_from_sources(config_path: &Path) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::debug!(path = %config_path.display(), "Loading configuration file");
        builder = builder.add_source(
            File::from(config_path)
                .format(FileFormat::Toml)
                .required(false),
        );
    } else {
        tracing::debug!(
            path = %config_path.display(),
            "Configuration file not found, using defaults and environment overrides"
        );
    }

    // DAGCARGO__CONTENT_STORE__MAX_WORKERS -> content_store.max_workers
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
