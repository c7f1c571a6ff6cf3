use crate::core::errors::{ConfigError, ConfigResult};
use crate::phases::bbox::BboxPolicy;
use crate::phases::transform::CoordinateScale;
use crate::services::sampler::random::SeedPolicy;
use std::env;
use std::path::PathBuf;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    /// None allows any origin
    pub cors_allowed_origin: Option<String>,
    pub max_upload_mb: usize,
}

/// Canvas configuration
#[derive(Debug, Clone)]
pub struct CanvasConfig {
    /// Side length of the square working canvas in pixels
    pub size: u32,
}

/// Placement geometry configuration
#[derive(Debug, Clone)]
pub struct GeometryConfig {
    pub coordinate_scale: CoordinateScale,
    pub bbox_policy: BboxPolicy,
}

/// Sampler configuration
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub guidance_scale: f32,
    pub default_step_count: u32,
    pub max_step_count: u32,
    pub max_batch_count: usize,
    pub seed: SeedPolicy,
    pub model_dir: PathBuf,
    pub inference_backend: Option<String>,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub canvas: CanvasConfig,
    pub geometry: GeometryConfig,
    pub sampler: SamplerConfig,
}

impl Config {
    pub fn new() -> ConfigResult<Self> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> ConfigResult<Self> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let coordinate_scale = match env::var("COORDINATE_SCALE_FACTOR") {
            Ok(raw) => CoordinateScale::parse(&raw)
                .ok_or(ConfigError::InvalidCoordinateScale(raw))?,
            Err(_) => CoordinateScale::default(),
        };

        let bbox_policy = match env::var("BBOX_POLICY") {
            Ok(raw) => BboxPolicy::parse(&raw).ok_or(ConfigError::InvalidBboxPolicy(raw))?,
            Err(_) => BboxPolicy::default(),
        };

        let seed = match env::var("SAMPLER_SEED") {
            Ok(raw) => SeedPolicy::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidSamplerConfig(format!(
                    "SAMPLER_SEED must be an integer or 'random', got '{}'",
                    raw
                ))
            })?,
            Err(_) => SeedPolicy::default(),
        };

        Ok(Self {
            server: ServerConfig {
                port: parse_env("SERVER_PORT", 8000),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
                cors_allowed_origin: env::var("CORS_ALLOWED_ORIGIN")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty() && s != "*"),
                max_upload_mb: parse_env("MAX_UPLOAD_MB", 50),
            },
            canvas: CanvasConfig {
                size: parse_env("CANVAS_SIZE", 512),
            },
            geometry: GeometryConfig {
                coordinate_scale,
                bbox_policy,
            },
            sampler: SamplerConfig {
                guidance_scale: parse_env("GUIDANCE_SCALE", 5.0),
                default_step_count: parse_env("DEFAULT_STEP_COUNT", 50),
                max_step_count: parse_env("MAX_STEP_COUNT", 1000),
                max_batch_count: parse_env("MAX_BATCH_COUNT", 8),
                seed,
                model_dir: env::var("MODEL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("checkpoints/objectstitch")),
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty()),
            },
        })
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let size = self.canvas.size;
        if !(64..=2048).contains(&size) || size % 8 != 0 {
            return Err(ConfigError::InvalidCanvasSize(size));
        }

        if !(self.sampler.guidance_scale.is_finite() && self.sampler.guidance_scale > 0.0) {
            return Err(ConfigError::InvalidSamplerConfig(format!(
                "guidance_scale must be > 0, got {}",
                self.sampler.guidance_scale
            )));
        }

        // DDIM cannot take more steps than the training schedule has timesteps
        if !(1..=1000).contains(&self.sampler.max_step_count) {
            return Err(ConfigError::InvalidSamplerConfig(format!(
                "max_step_count must be between 1 and 1000, got {}",
                self.sampler.max_step_count
            )));
        }

        if self.sampler.default_step_count == 0
            || self.sampler.default_step_count > self.sampler.max_step_count
        {
            return Err(ConfigError::InvalidSamplerConfig(format!(
                "default_step_count must be between 1 and {}, got {}",
                self.sampler.max_step_count, self.sampler.default_step_count
            )));
        }

        if self.sampler.max_batch_count == 0 {
            return Err(ConfigError::InvalidSamplerConfig(
                "max_batch_count must be > 0".to_string(),
            ));
        }

        if self.server.max_upload_mb == 0 {
            return Err(ConfigError::InvalidServerConfig(
                "max_upload_mb must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn canvas_size(&self) -> u32 {
        self.canvas.size
    }

    pub fn max_batch_count(&self) -> usize {
        self.sampler.max_batch_count
    }

    pub fn guidance_scale(&self) -> f32 {
        self.sampler.guidance_scale
    }
}

impl Default for Config {
    /// Deployed defaults without reading the environment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8000,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
                cors_allowed_origin: None,
                max_upload_mb: 50,
            },
            canvas: CanvasConfig { size: 512 },
            geometry: GeometryConfig {
                coordinate_scale: CoordinateScale::default(),
                bbox_policy: BboxPolicy::default(),
            },
            sampler: SamplerConfig {
                guidance_scale: 5.0,
                default_step_count: 50,
                max_step_count: 1000,
                max_batch_count: 8,
                seed: SeedPolicy::default(),
                model_dir: PathBuf::from("checkpoints/objectstitch"),
                inference_backend: None,
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
