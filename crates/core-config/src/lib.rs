//! Daemon configuration.
//!
//! Three layers, lowest precedence first: built-in defaults, an
//! optional `knd.toml` (working directory first, then the platform
//! config location), then `KND_*` environment variables. The TOML file
//! is tolerant; a parse error falls back to defaults with a warning,
//! since an operator fixing a config file should not take the daemon
//! down. Environment variables are strict: they come from the
//! supervisor, and a typo there should fail startup loudly.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 14308;
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(7);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_millis(750);
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ServerSection {
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PersistSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Minimum seconds between saves.
    #[serde(default)]
    pub interval_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SweepSection {
    #[serde(default)]
    pub xskip: Option<u16>,
    #[serde(default)]
    pub yskip: Option<u16>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub persist: PersistSection,
    #[serde(default)]
    pub sweep: SweepSection,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub save_dir: PathBuf,
    pub save_interval: Duration,
    pub init_timeout: Duration,
    pub run_timeout: Duration,
    pub xskip: u16,
    pub yskip: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            save_dir: PathBuf::from("."),
            save_interval: DEFAULT_SAVE_INTERVAL,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            xskip: 2,
            yskip: 2,
        }
    }
}

/// Best-effort config path: working directory first, then the platform
/// config directory.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("knd.toml");
    if local.exists() {
        return local;
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".config").join("knd").join("knd.toml");
    }
    PathBuf::from("knd.toml")
}

/// Load the layered configuration from disk and process environment.
pub fn load(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);
    let file = match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str::<ConfigFile>(&content) {
            Ok(file) => {
                info!(target: "config", path = %path.display(), "config_file_loaded");
                file
            }
            Err(e) => {
                warn!(target: "config", path = %path.display(), error = %e, "config_parse_failed_using_defaults");
                ConfigFile::default()
            }
        },
        Err(_) => ConfigFile::default(),
    };
    from_sources(file, &|key| std::env::var(key).ok())
}

/// Merge a parsed file with an environment lookup. Split out from
/// [`load`] so tests can supply both sides.
pub fn from_sources(file: ConfigFile, env: &dyn Fn(&str) -> Option<String>) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(port) = file.server.port {
        cfg.port = port;
    }
    if let Some(dir) = file.persist.dir {
        cfg.save_dir = dir;
    }
    if let Some(secs) = file.persist.interval_secs {
        cfg.save_interval = seconds("persist.interval_secs", secs)?;
    }
    if let Some(x) = file.sweep.xskip {
        cfg.xskip = x.clamp(1, 64);
    }
    if let Some(y) = file.sweep.yskip {
        cfg.yskip = y.clamp(1, 64);
    }

    if let Some(raw) = env("KND_PORT") {
        cfg.port = raw
            .trim()
            .parse()
            .with_context(|| format!("KND_PORT {raw:?} is not a port number"))?;
    }
    if let Some(raw) = env("KND_SAVEDIR") {
        cfg.save_dir = PathBuf::from(raw);
    }
    if let Some(raw) = env("KND_INITTIMEOUT") {
        cfg.init_timeout = env_seconds("KND_INITTIMEOUT", &raw)?;
    }
    if let Some(raw) = env("KND_RUNTIMEOUT") {
        cfg.run_timeout = env_seconds("KND_RUNTIMEOUT", &raw)?;
    }

    Ok(cfg)
}

fn seconds(what: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("{what} must be a positive number of seconds, got {secs}");
    }
    Ok(Duration::from_secs_f64(secs))
}

fn env_seconds(var: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{var} {raw:?} is not a number of seconds"))?;
    seconds(var, secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = from_sources(ConfigFile::default(), &no_env).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.port, 14308);
        assert_eq!(cfg.init_timeout, Duration::from_secs(7));
        assert_eq!(cfg.run_timeout, Duration::from_millis(750));
    }

    #[test]
    fn file_values_override_defaults() {
        let file: ConfigFile = toml::from_str(
            "[server]\nport = 9000\n[persist]\ndir = \"/tmp/knd\"\ninterval_secs = 2.5\n[sweep]\nxskip = 4\n",
        )
        .unwrap();
        let cfg = from_sources(file, &no_env).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.save_dir, PathBuf::from("/tmp/knd"));
        assert_eq!(cfg.save_interval, Duration::from_secs_f64(2.5));
        assert_eq!(cfg.xskip, 4);
        assert_eq!(cfg.yskip, 2);
    }

    #[test]
    fn env_overrides_file() {
        let file: ConfigFile = toml::from_str("[server]\nport = 9000\n").unwrap();
        let env = |key: &str| match key {
            "KND_PORT" => Some("15000".to_string()),
            "KND_SAVEDIR" => Some("/var/lib/knd".to_string()),
            "KND_INITTIMEOUT" => Some("2.5".to_string()),
            "KND_RUNTIMEOUT" => Some("0.25".to_string()),
            _ => None,
        };
        let cfg = from_sources(file, &env).unwrap();
        assert_eq!(cfg.port, 15000);
        assert_eq!(cfg.save_dir, PathBuf::from("/var/lib/knd"));
        assert_eq!(cfg.init_timeout, Duration::from_secs_f64(2.5));
        assert_eq!(cfg.run_timeout, Duration::from_secs_f64(0.25));
    }

    #[test]
    fn malformed_env_fails_loudly() {
        let env = |key: &str| (key == "KND_RUNTIMEOUT").then(|| "soon".to_string());
        assert!(from_sources(ConfigFile::default(), &env).is_err());
        let env = |key: &str| (key == "KND_INITTIMEOUT").then(|| "-3".to_string());
        assert!(from_sources(ConfigFile::default(), &env).is_err());
        let env = |key: &str| (key == "KND_PORT").then(|| "lots".to_string());
        assert!(from_sources(ConfigFile::default(), &env).is_err());
    }

    #[test]
    fn unknown_toml_keys_are_ignored() {
        let file: ConfigFile =
            toml::from_str("[server]\nport = 1\nfuture_knob = true\n[brand_new]\nx = 1\n").unwrap();
        let cfg = from_sources(file, &no_env).unwrap();
        assert_eq!(cfg.port, 1);
    }

    #[test]
    fn sweep_strides_clamp_to_sane_bounds() {
        let file: ConfigFile = toml::from_str("[sweep]\nxskip = 0\nyskip = 999\n").unwrap();
        let cfg = from_sources(file, &no_env).unwrap();
        assert_eq!(cfg.xskip, 1);
        assert_eq!(cfg.yskip, 64);
    }
}
