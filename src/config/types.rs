use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use webmforge_common::{media, Plan};
use webmforge_engine::Backend;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Ordered strategy chain, cheapest first.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            limits: LimitsConfig::default(),
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            strategies: default_strategies(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory of the browser front end, served as a fallback.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,

    /// Include technical failure detail in API responses (development only).
    #[serde(default)]
    pub expose_error_detail: bool,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
            expose_error_detail: false,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Requests allowed per window on `/api`, shared across all clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rate_limit_requests")]
    pub requests: u32,

    #[serde(default = "default_rate_limit_window")]
    pub window_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_rate_limit_requests() -> u32 {
    100
}
fn default_rate_limit_window() -> u64 {
    15 * 60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: default_rate_limit_requests(),
            window_secs: default_rate_limit_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Hard ceiling on any upload, whatever the plan.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_media_type")]
    pub accepted_media_type: String,

    #[serde(default = "default_extension")]
    pub accepted_extension: String,

    /// Require the EBML header magic at the start of the upload.
    #[serde(default = "default_true")]
    pub sniff_content: bool,
}

fn default_max_file_size() -> u64 {
    500 * MB
}
fn default_media_type() -> String {
    media::WEBM_MEDIA_TYPE.to_string()
}
fn default_extension() -> String {
    media::WEBM_EXTENSION.to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            accepted_media_type: default_media_type(),
            accepted_extension: default_extension(),
            sniff_content: true,
        }
    }
}

/// Per-plan input size ceilings. `None` means bounded only by the upload
/// ceiling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub default_plan: Plan,

    #[serde(default = "default_free_limit")]
    pub free: Option<u64>,

    #[serde(default = "default_pro_limit")]
    pub pro: Option<u64>,

    #[serde(default)]
    pub enterprise: Option<u64>,
}

fn default_free_limit() -> Option<u64> {
    Some(50 * MB)
}
fn default_pro_limit() -> Option<u64> {
    Some(500 * MB)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_plan: Plan::Free,
            free: default_free_limit(),
            pro: default_pro_limit(),
            enterprise: None,
        }
    }
}

impl LimitsConfig {
    pub fn plan_limit(&self, plan: Plan) -> Option<u64> {
        match plan {
            Plan::Free => self.free,
            Plan::Pro => self.pro,
            Plan::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Age after which the sweep reclaims any artifact.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Lifetime of a published download.
    #[serde(default = "default_download_ttl")]
    pub download_ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}
fn default_max_age() -> u64 {
    24 * 60 * 60
}
fn default_download_ttl() -> u64 {
    60 * 60
}
fn default_sweep_interval() -> u64 {
    60 * 60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            temp_dir: default_temp_dir(),
            max_age_secs: default_max_age(),
            download_ttl_secs: default_download_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StorageConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn download_ttl(&self) -> Duration {
        Duration::from_secs(self.download_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Custom path to ffmpeg (default: search PATH).
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// WASI build of ffmpeg used by the sandbox backend.
    #[serde(default = "default_wasm_module")]
    pub wasm_module: PathBuf,

    /// Maximum duration of one strategy attempt.
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
}

fn default_wasm_module() -> PathBuf {
    PathBuf::from("./ffmpeg.wasm")
}
fn default_engine_timeout() -> u64 {
    24 * 60 * 60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            ffmpeg_path: None,
            wasm_module: default_wasm_module(),
            timeout_secs: default_engine_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One transcoding attempt: a diagnostic name and ffmpeg arguments placed
/// between the input and the output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub name: String,
    pub args: Vec<String>,
}

impl StrategyConfig {
    fn new(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

pub fn default_strategies() -> Vec<StrategyConfig> {
    vec![
        StrategyConfig::new("stream copy", &["-c", "copy"]),
        StrategyConfig::new(
            "fast re-encode",
            &["-c:v", "libx264", "-preset", "ultrafast", "-c:a", "aac"],
        ),
        StrategyConfig::new(
            "compatibility re-encode",
            &[
                "-c:v", "libx264", "-crf", "23", "-c:a", "aac", "-b:a", "128k", "-movflags",
                "+faststart",
            ],
        ),
    ]
}
