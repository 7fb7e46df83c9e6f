use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use chrono::Duration;

use crate::camera::CameraConfig;
use crate::codec::DEFAULT_VALIDITY_DAYS;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub qr_validity: Duration,
    pub camera: CameraConfig,
    pub audit_denied: bool,
    pub seed_demo: bool,
    pub session_ttl: Duration,
    pub admin_hash: Option<String>,
    pub gatekeeper_hash: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("escola"),
            qr_validity: Duration::days(DEFAULT_VALIDITY_DAYS),
            camera: CameraConfig::default(),
            audit_denied: false,
            seed_demo: true,
            session_ttl: Duration::hours(48),
            admin_hash: None,
            gatekeeper_hash: None,
        }
    }
}

impl Config {
    /// Loads `.env` when present, then reads the `ESCOLA_*` variables.
    pub fn from_env() -> anyhow::Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let validity_days: i64 = parse(&lookup, "ESCOLA_QR_VALIDITY_DAYS", DEFAULT_VALIDITY_DAYS)?;
        if validity_days <= 0 {
            return Err(anyhow!("ESCOLA_QR_VALIDITY_DAYS must be positive"));
        }
        let ttl_hours: i64 = parse(&lookup, "ESCOLA_SESSION_TTL_HOURS", 48)?;
        if ttl_hours <= 0 {
            return Err(anyhow!("ESCOLA_SESSION_TTL_HOURS must be positive"));
        }
        let fps: u32 = parse(&lookup, "ESCOLA_CAMERA_FPS", defaults.camera.fps)?;

        Ok(Self {
            data_dir: lookup("ESCOLA_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            qr_validity: Duration::days(validity_days),
            camera: CameraConfig {
                facing_mode: lookup("ESCOLA_CAMERA_FACING").unwrap_or(defaults.camera.facing_mode),
                fps,
                ..defaults.camera
            },
            audit_denied: parse(&lookup, "ESCOLA_AUDIT_DENIED", defaults.audit_denied)?,
            seed_demo: parse(&lookup, "ESCOLA_SEED_DEMO", defaults.seed_demo)?,
            session_ttl: Duration::hours(ttl_hours),
            admin_hash: lookup("ESCOLA_ADMIN_HASH").filter(|v| !v.is_empty()),
            gatekeeper_hash: lookup("ESCOLA_GATEKEEPER_HASH").filter(|v| !v.is_empty()),
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value `{}` for {}", raw, key)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("escola"));
        assert_eq!(config.qr_validity, Duration::days(365));
        assert_eq!(config.camera.facing_mode, "environment");
        assert_eq!(config.camera.fps, 10);
        assert!(!config.audit_denied);
        assert!(config.seed_demo);
        assert_eq!(config.session_ttl, Duration::hours(48));
    }

    #[test]
    fn overrides_are_read() {
        let config = from(&[
            ("ESCOLA_DATA_DIR", "/var/lib/escola"),
            ("ESCOLA_QR_VALIDITY_DAYS", "30"),
            ("ESCOLA_CAMERA_FACING", "user"),
            ("ESCOLA_AUDIT_DENIED", "true"),
            ("ESCOLA_SEED_DEMO", "false"),
        ])
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/escola"));
        assert_eq!(config.qr_validity, Duration::days(30));
        assert_eq!(config.camera.facing_mode, "user");
        assert!(config.audit_denied);
        assert!(!config.seed_demo);
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = from(&[("ESCOLA_CAMERA_FPS", "fast")]).unwrap_err();
        assert!(err.to_string().contains("ESCOLA_CAMERA_FPS"));
        assert!(from(&[("ESCOLA_QR_VALIDITY_DAYS", "0")]).is_err());
    }
}
