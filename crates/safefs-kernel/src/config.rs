//! Kernel configuration – reads/writes `~/.safefs/kernel.toml`.
//!
//! ```toml
//! [safety]
//! motor_linear_range = [-0.5, 0.5]
//! motor_rate_hz = 10.0
//!
//! [safety.policies]
//! rate_limit = false
//!
//! [bounds]
//! archetype = "arm"
//!
//! [authority]
//! order_ttl_s = 600
//! destructive_patterns = ["^/memory/episodic$"]
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.
//! `[bounds]` and `[authority]` are optional; leaving one out means no
//! bounds checker or no work authority is attached to the safety layer.

use std::fs;
use std::path::{Path, PathBuf};

use safefs_types::KernelError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::authority::AuthorityConfig;
use crate::bounds::BoundsConfig;
use crate::safety::SafetyConfig;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<BoundsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<AuthorityConfig>,
}

impl KernelConfig {
    /// Check every section, reporting the first problem as
    /// [`KernelError::Config`].
    pub fn validate(&self) -> Result<(), KernelError> {
        self.safety.validate()?;
        if let Some(bounds) = &self.bounds {
            bounds.clone().resolve().validate()?;
        }
        if let Some(authority) = &self.authority {
            authority.validate()?;
        }
        Ok(())
    }
}

/// Return the path to `~/.safefs/kernel.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".safefs").join("kernel.toml")
}

/// Load from the default location. `Ok(None)` if the file does not exist.
pub fn load() -> Result<Option<KernelConfig>, KernelError> {
    load_from(&config_path())
}

/// Load, apply `SAFEFS_*` overrides and validate.
pub fn load_from(path: &Path) -> Result<Option<KernelConfig>, KernelError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        KernelError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: KernelConfig = toml::from_str(&raw)
        .map_err(|e| KernelError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    debug!(path = %path.display(), "kernel config loaded");
    Ok(Some(cfg))
}

/// Apply `SAFEFS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SAFEFS_MOTOR_RATE_HZ` | `safety.motor_rate_hz` |
/// | `SAFEFS_MAX_VIOLATIONS` | `safety.max_violations_before_lockout` |
/// | `SAFEFS_LOCKOUT_DURATION_S` | `safety.lockout_duration_s` |
/// | `SAFEFS_AUDIT_RING_SIZE` | `safety.audit_ring_size` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut KernelConfig) {
    apply_overrides_with(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides_with(cfg: &mut KernelConfig, lookup: impl Fn(&str) -> Option<String>) {
    let safety = &mut cfg.safety;
    if let Some(v) = lookup("SAFEFS_MOTOR_RATE_HZ")
        && let Ok(hz) = v.trim().parse::<f64>()
    {
        safety.motor_rate_hz = hz;
    }
    if let Some(v) = lookup("SAFEFS_MAX_VIOLATIONS")
        && let Ok(n) = v.trim().parse::<u32>()
    {
        safety.max_violations_before_lockout = n;
    }
    if let Some(v) = lookup("SAFEFS_LOCKOUT_DURATION_S")
        && let Ok(s) = v.trim().parse::<f64>()
    {
        safety.lockout_duration_s = s;
    }
    if let Some(v) = lookup("SAFEFS_AUDIT_RING_SIZE")
        && let Ok(n) = v.trim().parse::<usize>()
    {
        safety.audit_ring_size = n;
    }
}

/// Save to the default location, creating `~/.safefs/` if necessary.
pub fn save(cfg: &KernelConfig) -> Result<(), KernelError> {
    save_to(cfg, &config_path())
}

/// Save as pretty TOML. On Unix the directory is `0700` and the file `0600`.
pub fn save_to(cfg: &KernelConfig, path: &Path) -> Result<(), KernelError> {
    let io_err = |what: &str, e: std::io::Error| {
        KernelError::Config(format!("failed to {what} {}: {e}", path.display()))
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("create directory for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("restrict directory of", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| KernelError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err("write", e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| io_err("write", e))?;
    Ok(())
}
