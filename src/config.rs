// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration and persistence.
//!
//! Daemon settings and fan assignments live in TOML (default
//! `/etc/fanwatch/config.toml`). Curves and notification rules are kept in
//! their own JSON files so an external editor can produce them:
//!
//! ```json
//! { "cpu": { "points": [[30.0, 20.0], [70.0, 60.0]], "xlabel": "Cpu Temp (°C)", "ylabel": "Fan Speed (%)" } }
//! { "notifications": [ { "id": 0, "message": "CPU hot", "type": "warning", "component": "cpu_temp", "threshold": 80.0 } ] }
//! ```

use crate::curve::{Curve, CurvePoint, CurveRegistry};
use crate::fan::FanMode;
use crate::hwmon::HWMON_ROOT;
use crate::notify::{DEFAULT_HYSTERESIS_FRACTION, NotificationRule, RuleRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fanwatch/config.toml";

/// Default daemon socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/fanwatch.sock";

/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Default per-channel I/O timeout in milliseconds.
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 1000;

pub const DEFAULT_CURVES_PATH: &str = "/etc/fanwatch/curves.json";
pub const DEFAULT_RULES_PATH: &str = "/etc/fanwatch/notifications.json";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Per-fan assignments, keyed by fan id (e.g. "hwmon3/pwm1").
    #[serde(default)]
    pub fans: HashMap<String, FanMode>,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Control loop period, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Path for the Unix domain socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Whether to restore fans to their original control mode on exit.
    #[serde(default = "default_true")]
    pub restore_on_exit: bool,

    /// Release deadband for notification rules, as a fraction of the threshold.
    #[serde(default = "default_hysteresis")]
    pub hysteresis_fraction: f64,

    /// Upper bound for a single channel's I/O within a tick.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Root of the hwmon tree.
    #[serde(default = "default_hwmon_root")]
    pub hwmon_root: PathBuf,

    #[serde(default = "default_curves_path")]
    pub curves_path: PathBuf,

    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,

    /// Also deliver events through `notify-send`.
    #[serde(default)]
    pub desktop_notifications: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            restore_on_exit: true,
            hysteresis_fraction: DEFAULT_HYSTERESIS_FRACTION,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            hwmon_root: default_hwmon_root(),
            curves_path: default_curves_path(),
            rules_path: default_rules_path(),
            desktop_notifications: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Load / Save: daemon config
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file doesn't exist.
pub fn load_config(path: &Path) -> io::Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse config: {e}"),
        )
    })?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to a TOML file, creating parent directories if needed.
pub fn save_config(path: &Path, config: &Config) -> io::Result<()> {
    let contents = toml::to_string_pretty(config).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize config: {e}"),
        )
    })?;

    write_file(path, &contents)?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Load / Save: curves
// ---------------------------------------------------------------------------

/// On-disk shape of a curve; the name is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CurveRecord {
    #[serde(alias = "data")]
    points: Vec<CurvePoint>,
    #[serde(default)]
    xlabel: String,
    #[serde(default)]
    ylabel: String,
}

pub fn try_load_curves(path: &Path) -> io::Result<CurveRegistry> {
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(CurveRegistry::new());
    }
    let records: BTreeMap<String, CurveRecord> =
        serde_json::from_str(&contents).map_err(invalid_data)?;
    Ok(records
        .into_iter()
        .map(|(name, r)| Curve::new(name, r.points, r.xlabel, r.ylabel))
        .collect())
}

/// Load curves, falling back to an empty registry on any error.
pub fn load_curves(path: &Path) -> CurveRegistry {
    match try_load_curves(path) {
        Ok(reg) => {
            log::info!("Loaded {} curve(s) from {}", reg.len(), path.display());
            reg
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("No curves file at {}", path.display());
            CurveRegistry::new()
        }
        Err(e) => {
            log::warn!("Could not load curves from {}: {e}; starting empty", path.display());
            CurveRegistry::new()
        }
    }
}

pub fn save_curves(path: &Path, curves: &CurveRegistry) -> io::Result<()> {
    let records: BTreeMap<&str, CurveRecord> = curves
        .iter()
        .map(|c| {
            (
                c.name(),
                CurveRecord {
                    points: c.points().to_vec(),
                    xlabel: c.xlabel().to_string(),
                    ylabel: c.ylabel().to_string(),
                },
            )
        })
        .collect();
    let contents = serde_json::to_string_pretty(&records).map_err(invalid_data)?;
    write_file(path, &contents)?;
    log::info!("Saved {} curve(s) to {}", curves.len(), path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Load / Save: notification rules
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RulesFile {
    notifications: Vec<NotificationRule>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RulesOnDisk {
    Wrapped(RulesFile),
    Bare(Vec<NotificationRule>),
}

pub fn try_load_rules(path: &Path) -> io::Result<RuleRegistry> {
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(RuleRegistry::new());
    }
    let rules = match serde_json::from_str(&contents).map_err(invalid_data)? {
        RulesOnDisk::Wrapped(f) => f.notifications,
        RulesOnDisk::Bare(v) => v,
    };
    Ok(RuleRegistry::from_rules(rules))
}

/// Load rules with latches reset, falling back to an empty registry on any error.
pub fn load_rules(path: &Path) -> RuleRegistry {
    match try_load_rules(path) {
        Ok(reg) => {
            log::info!("Loaded {} notification rule(s) from {}", reg.len(), path.display());
            reg
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::info!("No notification rules file at {}", path.display());
            RuleRegistry::new()
        }
        Err(e) => {
            log::warn!("Could not load rules from {}: {e}; starting empty", path.display());
            RuleRegistry::new()
        }
    }
}

pub fn save_rules(path: &Path, rules: &RuleRegistry) -> io::Result<()> {
    let file = RulesFile {
        notifications: rules.rules().to_vec(),
    };
    let contents = serde_json::to_string_pretty(&file).map_err(invalid_data)?;
    write_file(path, &contents)?;
    log::info!("Saved {} notification rule(s) to {}", rules.len(), path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_file(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, contents)
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_true() -> bool {
    true
}

fn default_hysteresis() -> f64 {
    DEFAULT_HYSTERESIS_FRACTION
}

fn default_io_timeout() -> u64 {
    DEFAULT_IO_TIMEOUT_MS
}

fn default_hwmon_root() -> PathBuf {
    PathBuf::from(HWMON_ROOT)
}

fn default_curves_path() -> PathBuf {
    PathBuf::from(DEFAULT_CURVES_PATH)
}

fn default_rules_path() -> PathBuf {
    PathBuf::from(DEFAULT_RULES_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use crate::notify::Latch;
    use tempfile::TempDir;

    fn sample_curves() -> CurveRegistry {
        [
            Curve::new(
                "cpu",
                vec![CurvePoint::new(30.0, 20.0), CurvePoint::new(70.0, 60.0)],
                "Cpu Temp (°C)",
                "Fan Speed (%)",
            ),
            Curve::new(
                "ram",
                vec![CurvePoint::new(50.0, 30.0)],
                "Ram Usage (%)",
                "Fan Speed (%)",
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_curves_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("curves.json");
        let curves = sample_curves();
        save_curves(&path, &curves).unwrap();
        let first = fs::read_to_string(&path).unwrap();

        let loaded = try_load_curves(&path).unwrap();
        assert_eq!(loaded, curves);

        save_curves(&path, &loaded).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_legacy_data_key_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("graphs.json");
        fs::write(
            &path,
            r#"{"quiet": {"data": [[60, 50], [20, 10]], "xlabel": "Cpu Temp (°C)", "ylabel": "Fan Speed (%)"}}"#,
        )
        .unwrap();
        let reg = load_curves(&path);
        let quiet = reg.get("quiet").unwrap();
        assert_eq!(quiet.points()[0], CurvePoint::new(20.0, 10.0));
        assert_eq!(quiet.evaluate(40.0), 30.0);
    }

    #[test]
    fn test_rules_round_trip_resets_latch() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notifications.json");
        let mut rules = RuleRegistry::new();
        rules.add("CPU hot", Severity::Warning, "cpu_temp", 80.0).unwrap();
        rules.add("RAM full", Severity::Critical, "ram_usage", 95.0).unwrap();
        let snap: crate::stats::StatSnapshot = [("cpu_temp", 90.0)].into_iter().collect();
        crate::notify::NotificationEngine::default().evaluate(&mut rules, &snap);
        assert_eq!(rules.rules()[0].latch, Latch::Above);

        save_rules(&path, &rules).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        let loaded = try_load_rules(&path).unwrap();

        rules.reset_latches();
        assert_eq!(loaded, rules);
        save_rules(&path, &loaded).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_bare_rule_list_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notifications.json");
        fs::write(
            &path,
            r#"[{"id": 4, "message": "hot", "type": "Critical", "component": "gpu_temp", "threshold": 90}]"#,
        )
        .unwrap();
        let rules = load_rules(&path);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.get(4).map(|r| r.severity), Some(Severity::Critical));
    }

    #[test]
    fn test_corrupt_or_missing_files_fall_back_to_empty() {
        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(load_curves(&bad).is_empty());
        assert!(load_rules(&bad).is_empty());
        assert!(load_curves(&tmp.path().join("missing.json")).is_empty());
        assert!(load_rules(&tmp.path().join("missing.json")).is_empty());
    }

    #[test]
    fn test_config_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("etc/config.toml");
        let mut cfg = Config::default();
        cfg.daemon.poll_interval_ms = 1000;
        cfg.fans.insert(
            "hwmon3/pwm1".to_string(),
            FanMode::Graph {
                curve_name: "cpu".to_string(),
                stat_key: "cpu_temp".to_string(),
            },
        );
        cfg.fans
            .insert("hwmon3/pwm2".to_string(), FanMode::Manual { percent: 40.0 });
        cfg.fans.insert("hwmon3/pwm3".to_string(), FanMode::Auto);

        save_config(&path, &cfg).unwrap();
        assert_eq!(load_config(&path).unwrap(), cfg);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [daemon]
            poll_interval_ms = 1500

            [fans."hwmon1/pwm2"]
            mode = "manual"
            percent = 35.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.daemon.poll_interval_ms, 1500);
        assert_eq!(cfg.daemon.hysteresis_fraction, DEFAULT_HYSTERESIS_FRACTION);
        assert_eq!(cfg.daemon.socket_path, DEFAULT_SOCKET_PATH);
        assert_eq!(
            cfg.fans.get("hwmon1/pwm2"),
            Some(&FanMode::Manual { percent: 35.0 })
        );
    }

    #[test]
    fn test_missing_config_is_default() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(&tmp.path().join("none.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
