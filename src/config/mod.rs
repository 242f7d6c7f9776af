mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./config.toml",
        "./webmforge.toml",
        "~/.config/webmforge/config.toml",
        "/etc/webmforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    let mut config = Config::default();
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Apply the deployment environment variables on top of file values.
///
/// `PORT`, `HOST`, `MAX_FILE_SIZE` (bytes), `UPLOAD_DIR`, `OUTPUT_DIR`,
/// `TEMP_DIR`.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(port) = env_var("PORT") {
        config.server.port = port
            .parse()
            .with_context(|| format!("Invalid PORT: {port}"))?;
    }
    if let Some(host) = env_var("HOST") {
        config.server.host = host;
    }
    if let Some(size) = env_var("MAX_FILE_SIZE") {
        config.upload.max_file_size = size
            .parse()
            .with_context(|| format!("Invalid MAX_FILE_SIZE: {size}"))?;
    }
    if let Some(dir) = env_var("UPLOAD_DIR") {
        config.storage.input_dir = expand_path(&dir);
    }
    if let Some(dir) = env_var("OUTPUT_DIR") {
        config.storage.output_dir = expand_path(&dir);
    }
    if let Some(dir) = env_var("TEMP_DIR") {
        config.storage.temp_dir = expand_path(&dir);
    }
    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.upload.max_file_size == 0 {
        anyhow::bail!("upload.max_file_size cannot be 0");
    }

    if config.strategies.is_empty() {
        anyhow::bail!("At least one conversion strategy must be configured");
    }
    for (i, strategy) in config.strategies.iter().enumerate() {
        if strategy.name.trim().is_empty() {
            anyhow::bail!("Strategy #{} has no name", i + 1);
        }
        if strategy.args.is_empty() {
            anyhow::bail!("Strategy '{}' has no arguments", strategy.name);
        }
    }

    if config.storage.sweep_interval_secs == 0 {
        anyhow::bail!("storage.sweep_interval_secs cannot be 0");
    }
    if config.storage.download_ttl_secs > config.storage.max_age_secs {
        tracing::warn!(
            "storage.download_ttl_secs ({}) exceeds max_age_secs ({}); downloads will be swept first",
            config.storage.download_ttl_secs,
            config.storage.max_age_secs
        );
    }

    for plan in webmforge_common::Plan::ALL {
        if let Some(limit) = config.limits.plan_limit(plan) {
            if limit > config.upload.max_file_size {
                tracing::warn!(
                    "Plan '{}' limit ({} bytes) exceeds the upload ceiling ({} bytes)",
                    plan,
                    limit,
                    config.upload.max_file_size
                );
            }
        }
    }

    if config.rate_limit_disabled() {
        tracing::warn!("API rate limiting is disabled");
    }

    if config.engine.backend == webmforge_engine::Backend::Sandbox
        && !config.engine.wasm_module.exists()
    {
        tracing::warn!(
            "Sandbox backend selected but module {:?} does not exist",
            config.engine.wasm_module
        );
    }

    Ok(())
}

impl Config {
    fn rate_limit_disabled(&self) -> bool {
        !self.server.rate_limit.enabled || self.server.rate_limit.requests == 0
    }
}
