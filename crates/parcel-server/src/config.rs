use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, ensure};

/// Server settings, read from `PARCEL_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base used to build share URLs returned by init/finalize.
    pub public_url: String,
    pub storage_dir: PathBuf,
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub default_time_limit: Duration,
    pub max_time_limit: Duration,
    pub max_downloads: u32,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub max_active_uploads: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3212,
            public_url: "http://localhost:3212".into(),
            storage_dir: "./parcel-storage".into(),
            default_chunk_size: parcel_transfer::DEFAULT_CHUNK_SIZE as u64,
            max_chunk_size: 64 * 1024 * 1024,
            default_time_limit: Duration::from_secs(24 * 3600),
            max_time_limit: Duration::from_secs(7 * 24 * 3600),
            max_downloads: 100,
            sweep_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(3600),
            max_active_uploads: 1000,
        }
    }
}

impl ServerConfig {
    /// Reads the environment on top of the defaults. Call `dotenvy::dotenv()` first.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let host = std::env::var("PARCEL_HOST").unwrap_or(d.host);
        let port: u16 = env_or("PARCEL_PORT", d.port)?;
        let public_url = std::env::var("PARCEL_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port));

        let config = Self {
            host,
            port,
            public_url: public_url.trim_end_matches('/').to_string(),
            storage_dir: std::env::var("PARCEL_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.storage_dir),
            default_chunk_size: env_or("PARCEL_DEFAULT_CHUNK_SIZE", d.default_chunk_size)?,
            max_chunk_size: env_or("PARCEL_MAX_CHUNK_SIZE", d.max_chunk_size)?,
            default_time_limit: secs_or("PARCEL_DEFAULT_TIME_LIMIT_SECS", d.default_time_limit)?,
            max_time_limit: secs_or("PARCEL_MAX_TIME_LIMIT_SECS", d.max_time_limit)?,
            max_downloads: env_or("PARCEL_MAX_DOWNLOADS", d.max_downloads)?,
            sweep_interval: secs_or("PARCEL_SWEEP_INTERVAL_SECS", d.sweep_interval)?,
            stale_after: secs_or("PARCEL_STALE_AFTER_SECS", d.stale_after)?,
            max_active_uploads: env_or("PARCEL_MAX_ACTIVE_UPLOADS", d.max_active_uploads)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("PARCEL_SWEEP_INTERVAL_SECS", self.sweep_interval),
            ("PARCEL_STALE_AFTER_SECS", self.stale_after),
            ("PARCEL_DEFAULT_TIME_LIMIT_SECS", self.default_time_limit),
            ("PARCEL_MAX_TIME_LIMIT_SECS", self.max_time_limit),
        ] {
            ensure!(!value.is_zero(), "{} must be positive", key);
        }
        ensure!(
            self.default_chunk_size > 0 && self.default_chunk_size <= self.max_chunk_size,
            "PARCEL_DEFAULT_CHUNK_SIZE must be within 1..={}",
            self.max_chunk_size
        );
        ensure!(self.max_downloads > 0, "PARCEL_MAX_DOWNLOADS must be positive");
        ensure!(self.max_active_uploads > 0, "PARCEL_MAX_ACTIVE_UPLOADS must be positive");
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) => v.trim().parse().with_context(|| format!("invalid {}: {:?}", key, v)),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}
