// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! hwmon sysfs discovery and control.
//!
//! Scans an hwmon tree (normally `/sys/class/hwmon/`) for PWM outputs and
//! temperature inputs, and exposes each PWM output through the [`PwmChannel`]
//! trait.
//!
//! Tachometers are paired with PWM outputs by ordinal only (`pwmN` with
//! `fanN_input`). Drivers do not promise that both attributes belong to the
//! same physical fan, so RPM readings are best-effort.

use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default hwmon root.
pub const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Full-scale raw PWM value.
pub const PWM_RAW_MAX: u8 = 255;

/// Enable values tried, in order, to hand a channel back to firmware.
const HARDWARE_ENABLE_VALUES: [u8; 3] = [2, 3, 5];

/// Enable value for software (manual) control.
const SOFTWARE_ENABLE_VALUE: u8 = 1;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Who drives the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnableMode {
    /// Firmware/BIOS automatic control.
    Hardware,
    /// Duty cycle is written by this process.
    Software,
}

/// Inclusive raw duty range a channel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutyRange {
    pub min: u8,
    pub max: u8,
}

impl Default for DutyRange {
    fn default() -> Self {
        Self {
            min: 0,
            max: PWM_RAW_MAX,
        }
    }
}

impl DutyRange {
    /// Convert a percentage to a raw value inside this range.
    pub fn to_raw(self, percent: f64) -> u8 {
        let raw = (percent / 100.0 * PWM_RAW_MAX as f64).round();
        raw.clamp(self.min as f64, self.max as f64) as u8
    }
}

/// Convert a raw duty to percent, rounded to one decimal.
pub fn raw_to_percent(raw: u8) -> f64 {
    (raw as f64 / PWM_RAW_MAX as f64 * 1000.0).round() / 10.0
}

/// Static description of a discovered PWM output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelInfo {
    /// Unique identifier, e.g. "hwmon3/pwm1"
    pub id: String,
    /// Name of the parent hwmon chip
    pub chip: String,
    /// Channel ordinal (the N in `pwmN`)
    pub index: u32,
    /// Human-readable label if available
    pub label: Option<String>,
    /// Whether the duty attribute passed a write-access check
    pub writable: bool,
    /// Whether a `pwmN_enable` attribute exists
    pub has_enable: bool,
    /// Whether a tachometer was paired by ordinal
    pub has_tach: bool,
    /// Raw range writes are clamped to
    pub range: DutyRange,
}

/// Live readings for a fan channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelStatus {
    pub id: String,
    pub label: Option<String>,
    pub chip: String,
    /// Current duty in percent
    pub duty: Option<f64>,
    /// Current raw enable value: 0=off, 1=manual, 2+=automatic variants
    pub enable: Option<u8>,
    /// Current fan speed in RPM (best-effort pairing)
    pub rpm: Option<u32>,
    pub writable: bool,
}

/// Capability interface of a controllable fan output.
pub trait PwmChannel: Send + Sync {
    fn info(&self) -> &ChannelInfo;

    fn id(&self) -> &str {
        &self.info().id
    }

    /// Current duty in percent.
    fn read_duty(&self) -> Option<f64>;

    /// Current RPM. `None` when no tachometer is paired or the reading is
    /// zero or invalid; a stopped fan is not a fault.
    fn read_rpm(&self) -> Option<u32>;

    /// Raw enable attribute value.
    fn read_enable(&self) -> Option<u8>;

    /// Write a duty cycle given in percent.
    fn write_duty(&self, percent: f64) -> Result<()>;

    /// Hand the channel to firmware or take it for software control.
    /// Returns `Ok(false)` when the channel has no enable attribute.
    fn set_enable_mode(&self, mode: EnableMode) -> Result<bool>;

    /// Put the enable attribute back to the value seen at discovery.
    fn restore_original_enable(&self) -> Result<bool> {
        self.set_enable_mode(EnableMode::Hardware)
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus {
            duty: self.read_duty(),
            enable: self.read_enable(),
            rpm: self.read_rpm(),
            ..ChannelStatus::unread(self.info())
        }
    }
}

impl ChannelStatus {
    /// Identity only, with no readings.
    pub fn unread(info: &ChannelInfo) -> Self {
        Self {
            id: info.id.clone(),
            label: info.label.clone(),
            chip: info.chip.clone(),
            duty: None,
            enable: None,
            rpm: None,
            writable: info.writable,
        }
    }
}

/// A PWM output backed by sysfs attribute files.
#[derive(Debug, Clone)]
pub struct SysfsPwmChannel {
    info: ChannelInfo,
    pwm_path: PathBuf,
    enable_path: Option<PathBuf>,
    rpm_path: Option<PathBuf>,
    original_enable: Option<u8>,
}

impl SysfsPwmChannel {
    /// Open a single `pwmN` entry inside a chip directory.
    pub fn open(hwmon_dir: &Path, index: u32) -> Option<Self> {
        let pwm_path = hwmon_dir.join(format!("pwm{index}"));
        if !pwm_path.is_file() {
            return None;
        }
        let basename = hwmon_dir.file_name()?.to_string_lossy().to_string();
        let chip = read_trimmed(&hwmon_dir.join("name")).unwrap_or_default();

        let enable_path = Some(hwmon_dir.join(format!("pwm{index}_enable"))).filter(|p| p.exists());
        let rpm_path = Some(hwmon_dir.join(format!("fan{index}_input"))).filter(|p| p.exists());
        let label = read_trimmed(&hwmon_dir.join(format!("pwm{index}_label")))
            .or_else(|| read_trimmed(&hwmon_dir.join(format!("fan{index}_label"))));

        let max = read_parsed::<u8>(&hwmon_dir.join(format!("pwm{index}_max")))
            .filter(|&m| m > 0)
            .unwrap_or(PWM_RAW_MAX);
        let min = read_parsed::<u8>(&hwmon_dir.join(format!("pwm{index}_min")))
            .filter(|&m| m <= max)
            .unwrap_or(0);

        let original_enable = enable_path.as_deref().and_then(read_parsed::<u8>);

        Some(Self {
            info: ChannelInfo {
                id: format!("{basename}/pwm{index}"),
                chip,
                index,
                label,
                writable: is_writable(&pwm_path),
                has_enable: enable_path.is_some(),
                has_tach: rpm_path.is_some(),
                range: DutyRange { min, max },
            },
            pwm_path,
            enable_path,
            rpm_path,
            original_enable,
        })
    }

    pub fn pwm_path(&self) -> &Path {
        &self.pwm_path
    }

    fn write_enable(&self, path: &Path, value: u8) -> Result<()> {
        write_existing(path, &value.to_string())
    }
}

impl PwmChannel for SysfsPwmChannel {
    fn info(&self) -> &ChannelInfo {
        &self.info
    }

    fn read_duty(&self) -> Option<f64> {
        read_parsed::<u8>(&self.pwm_path).map(raw_to_percent)
    }

    fn read_rpm(&self) -> Option<u32> {
        let path = self.rpm_path.as_ref()?;
        read_parsed::<u32>(path).filter(|&rpm| rpm > 0)
    }

    fn read_enable(&self) -> Option<u8> {
        self.enable_path.as_deref().and_then(read_parsed::<u8>)
    }

    fn write_duty(&self, percent: f64) -> Result<()> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(ControlError::InvalidRange(percent));
        }
        if !self.info.writable {
            return Err(ControlError::PermissionDenied(format!(
                "{} is not writable",
                self.pwm_path.display()
            )));
        }
        let raw = self.info.range.to_raw(percent);
        write_existing(&self.pwm_path, &raw.to_string())?;
        log::debug!("{}: duty {percent:.1}% (raw {raw})", self.info.id);
        Ok(())
    }

    fn set_enable_mode(&self, mode: EnableMode) -> Result<bool> {
        let Some(path) = &self.enable_path else {
            return Ok(false);
        };
        if !path.exists() {
            return Err(ControlError::HardwareGone(path.display().to_string()));
        }

        match mode {
            EnableMode::Software => {
                self.write_enable(path, SOFTWARE_ENABLE_VALUE)?;
                Ok(true)
            }
            EnableMode::Hardware => {
                let value =
                    first_accepted(&HARDWARE_ENABLE_VALUES, |v| self.write_enable(path, v))?;
                log::debug!("{}: automatic control (enable={value})", self.info.id);
                Ok(true)
            }
        }
    }

    fn restore_original_enable(&self) -> Result<bool> {
        match (&self.enable_path, self.original_enable) {
            // Restoring "manual" would strand the fan at whatever duty we left.
            (Some(path), Some(value)) if value != SOFTWARE_ENABLE_VALUE => {
                self.write_enable(path, value)?;
                Ok(true)
            }
            _ => self.set_enable_mode(EnableMode::Hardware),
        }
    }
}

/// Write to an attribute that must already exist. A plain create-or-truncate
/// write would recreate a vanished attribute on a regular filesystem.
fn write_existing(path: &Path, value: &str) -> Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .and_then(|mut f| io::Write::write_all(&mut f, value.as_bytes()))
        .map_err(|e| ControlError::from_hw_io(path, &e))
}

/// Try `values` in order until `write` accepts one. A vanished device stops
/// the search at once; other rejections move on to the next value.
fn first_accepted(values: &[u8], mut write: impl FnMut(u8) -> Result<()>) -> Result<u8> {
    let mut last_err = None;
    for &value in values {
        match write(value) {
            Ok(()) => return Ok(value),
            Err(e @ ControlError::HardwareGone(_)) => return Err(e),
            Err(e) => {
                log::debug!("enable={value} rejected: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ControlError::Io("no enable value to try".to_string())))
}

/// A discovered temperature sensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TempSensor {
    /// Unique identifier, e.g. "hwmon3/temp1"
    pub id: String,
    /// Human-readable label if available
    pub label: Option<String>,
    /// Absolute path to the `tempN_input` file (millidegrees C)
    pub input_path: PathBuf,
    /// Name of the parent hwmon chip
    pub chip: String,
}

impl TempSensor {
    /// Current temperature in degrees Celsius.
    pub fn read_celsius(&self) -> Option<f64> {
        read_parsed::<i64>(&self.input_path).map(|millic| millic as f64 / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Scan an hwmon root and return every PWM output found, sorted by id.
///
/// A missing root yields an empty list, not an error.
pub fn discover_channels(root: &Path) -> io::Result<Vec<SysfsPwmChannel>> {
    let mut channels = Vec::new();

    for hwmon_dir in chip_dirs(root)? {
        for index in attribute_indices(&hwmon_dir, "pwm", "")? {
            if let Some(ch) = SysfsPwmChannel::open(&hwmon_dir, index) {
                channels.push(ch);
            }
        }
    }

    channels.sort_by(|a, b| natural_key(&a.info.id).cmp(&natural_key(&b.info.id)));
    Ok(channels)
}

/// Scan an hwmon root and return all temperature sensors, sorted by id.
pub fn discover_temp_sensors(root: &Path) -> io::Result<Vec<TempSensor>> {
    let mut sensors = Vec::new();

    for hwmon_dir in chip_dirs(root)? {
        let chip = read_trimmed(&hwmon_dir.join("name")).unwrap_or_default();
        let basename = hwmon_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        for n in attribute_indices(&hwmon_dir, "temp", "_input")? {
            sensors.push(TempSensor {
                id: format!("{basename}/temp{n}"),
                label: read_trimmed(&hwmon_dir.join(format!("temp{n}_label"))),
                input_path: hwmon_dir.join(format!("temp{n}_input")),
                chip: chip.clone(),
            });
        }
    }

    sensors.sort_by(|a, b| natural_key(&a.id).cmp(&natural_key(&b.id)));
    Ok(sensors)
}

/// Build a map of sensor id -> current temp.
pub fn read_temp_map(sensors: &[TempSensor]) -> HashMap<String, f64> {
    sensors
        .iter()
        .filter_map(|s| s.read_celsius().map(|t| (s.id.clone(), t)))
        .collect()
}

/// Hand every channel back to its original (or automatic) control mode.
pub fn restore_all<C: AsRef<dyn PwmChannel>>(channels: &[C]) {
    for ch in channels {
        let ch = ch.as_ref();
        if let Err(e) = ch.restore_original_enable() {
            log::warn!("Failed to restore automatic control for {}: {e}", ch.id());
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn chip_dirs(root: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut dirs = Vec::new();
    for entry in entries {
        // hwmonN entries are symlinks into /sys/devices; follow them.
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

/// Collect N for every `<prefix>N<suffix>` file in a chip directory.
fn attribute_indices(dir: &Path, prefix: &str, suffix: &str) -> io::Result<Vec<u32>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        let Some(digits) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = digits.parse::<u32>() {
                indices.push(n);
            }
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Sort key so "hwmon10" orders after "hwmon2".
fn natural_key(id: &str) -> Vec<(String, u64)> {
    let mut key = Vec::new();
    let mut text = String::new();
    let mut num = String::new();
    for c in id.chars() {
        if c.is_ascii_digit() {
            num.push(c);
        } else {
            if !num.is_empty() {
                key.push((std::mem::take(&mut text), num.parse().unwrap_or(u64::MAX)));
                num.clear();
            }
            text.push(c);
        }
    }
    key.push((text, num.parse().unwrap_or(0)));
    key
}

/// Check write access without writing anything.
fn is_writable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
}

pub(crate) fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

pub(crate) fn read_parsed<T: std::str::FromStr>(path: &Path) -> Option<T> {
    read_trimmed(path).and_then(|s| s.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, value: &str) {
        fs::write(dir.join(name), value).unwrap();
    }

    fn chip(root: &Path, dir: &str, name: &str) -> PathBuf {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        write(&path, "name", &format!("{name}\n"));
        path
    }

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let nct = chip(tmp.path(), "hwmon2", "nct6798");
        write(&nct, "pwm1", "128\n");
        write(&nct, "pwm1_enable", "2\n");
        write(&nct, "fan1_input", "1200\n");
        write(&nct, "fan1_label", "CPU Fan\n");
        write(&nct, "pwm3", "0\n");
        write(&nct, "fan3_input", "0\n");
        write(&nct, "temp1_input", "45500\n");
        write(&nct, "temp1_label", "SYSTIN\n");

        let k10 = chip(tmp.path(), "hwmon10", "k10temp");
        write(&k10, "temp1_input", "61250\n");
        tmp
    }

    #[test]
    fn test_discovery_pairs_by_ordinal() {
        let tmp = sample_tree();
        let channels = discover_channels(tmp.path()).unwrap();
        let ids: Vec<&str> = channels.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["hwmon2/pwm1", "hwmon2/pwm3"]);

        let fan1 = &channels[0];
        assert_eq!(fan1.info().chip, "nct6798");
        assert_eq!(fan1.info().label.as_deref(), Some("CPU Fan"));
        assert!(fan1.info().has_enable);
        assert_eq!(fan1.read_rpm(), Some(1200));
        assert_eq!(fan1.read_duty(), Some(50.2));

        let fan3 = &channels[1];
        assert!(!fan3.info().has_enable);
        assert!(fan3.info().has_tach);
        // A stopped fan reports no RPM rather than an error.
        assert_eq!(fan3.read_rpm(), None);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let channels = discover_channels(&tmp.path().join("nope")).unwrap();
        assert!(channels.is_empty());
    }

    #[test]
    fn test_discover_temp_sensors() {
        let tmp = sample_tree();
        let sensors = discover_temp_sensors(tmp.path()).unwrap();
        let ids: Vec<&str> = sensors.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["hwmon2/temp1", "hwmon10/temp1"]);
        let map = read_temp_map(&sensors);
        assert_eq!(map.get("hwmon10/temp1"), Some(&61.25));
    }

    #[test]
    fn test_write_duty_converts_and_clamps() {
        let tmp = sample_tree();
        let dir = tmp.path().join("hwmon2");
        write(&dir, "pwm1_max", "200\n");
        let ch = SysfsPwmChannel::open(&dir, 1).unwrap();
        if !ch.info().writable {
            return;
        }
        ch.write_duty(50.0).unwrap();
        assert_eq!(read_trimmed(&dir.join("pwm1")).as_deref(), Some("128"));
        ch.write_duty(100.0).unwrap();
        assert_eq!(read_trimmed(&dir.join("pwm1")).as_deref(), Some("200"));
    }

    #[test]
    fn test_write_duty_rejects_out_of_range() {
        let tmp = sample_tree();
        let ch = SysfsPwmChannel::open(&tmp.path().join("hwmon2"), 1).unwrap();
        assert!(matches!(ch.write_duty(120.0), Err(ControlError::InvalidRange(_))));
        assert!(matches!(ch.write_duty(f64::NAN), Err(ControlError::InvalidRange(_))));
    }

    #[test]
    fn test_write_to_vanished_channel_is_hardware_gone() {
        let tmp = sample_tree();
        let dir = tmp.path().join("hwmon2");
        let ch = SysfsPwmChannel::open(&dir, 1).unwrap();
        if !ch.info().writable {
            return;
        }
        fs::remove_file(dir.join("pwm1")).unwrap();
        assert!(matches!(ch.write_duty(40.0), Err(ControlError::HardwareGone(_))));
        assert!(!dir.join("pwm1").exists());
    }

    #[test]
    fn test_enable_modes() {
        let tmp = sample_tree();
        let dir = tmp.path().join("hwmon2");
        let ch = SysfsPwmChannel::open(&dir, 1).unwrap();
        assert_eq!(ch.set_enable_mode(EnableMode::Software), Ok(true));
        assert_eq!(ch.read_enable(), Some(1));
        assert_eq!(ch.set_enable_mode(EnableMode::Hardware), Ok(true));
        assert_eq!(ch.read_enable(), Some(2));

        ch.set_enable_mode(EnableMode::Software).unwrap();
        assert_eq!(ch.restore_original_enable(), Ok(true));
        assert_eq!(ch.read_enable(), Some(2));
    }

    #[test]
    fn test_auto_enable_falls_through_rejected_values() {
        let mut tried = Vec::new();
        let accepted = first_accepted(&HARDWARE_ENABLE_VALUES, |v| {
            tried.push(v);
            match v {
                2 => Err(ControlError::Io("EINVAL".into())),
                3 => Err(ControlError::PermissionDenied("EPERM".into())),
                _ => Ok(()),
            }
        });
        assert_eq!(accepted, Ok(5));
        assert_eq!(tried, vec![2, 3, 5]);

        let mut tried = Vec::new();
        let all_rejected = first_accepted(&HARDWARE_ENABLE_VALUES, |v| {
            tried.push(v);
            Err(ControlError::Io(format!("{v} rejected")))
        });
        assert_eq!(all_rejected, Err(ControlError::Io("5 rejected".into())));
        assert_eq!(tried, vec![2, 3, 5]);
    }

    #[test]
    fn test_auto_enable_stops_when_device_is_gone() {
        let mut tried = Vec::new();
        let result = first_accepted(&HARDWARE_ENABLE_VALUES, |v| {
            tried.push(v);
            Err(ControlError::HardwareGone("pwm1_enable".into()))
        });
        assert!(matches!(result, Err(ControlError::HardwareGone(_))));
        assert_eq!(tried, vec![2]);

        let tmp = sample_tree();
        let dir = tmp.path().join("hwmon2");
        let ch = SysfsPwmChannel::open(&dir, 1).unwrap();
        fs::remove_file(dir.join("pwm1_enable")).unwrap();
        assert!(matches!(
            ch.set_enable_mode(EnableMode::Hardware),
            Err(ControlError::HardwareGone(_))
        ));
        assert!(!dir.join("pwm1_enable").exists());
        assert!(matches!(
            ch.write_enable(&dir.join("pwm1_enable"), 2),
            Err(ControlError::HardwareGone(_))
        ));
        assert!(!dir.join("pwm1_enable").exists());
    }

    #[test]
    fn test_enable_mode_without_attribute_is_noop() {
        let tmp = sample_tree();
        let ch = SysfsPwmChannel::open(&tmp.path().join("hwmon2"), 3).unwrap();
        assert_eq!(ch.set_enable_mode(EnableMode::Hardware), Ok(false));
        assert_eq!(ch.set_enable_mode(EnableMode::Software), Ok(false));
    }

    #[test]
    fn test_duty_range_to_raw() {
        let range = DutyRange::default();
        assert_eq!(range.to_raw(0.0), 0);
        assert_eq!(range.to_raw(100.0), 255);
        assert_eq!(range.to_raw(40.0), 102);
        let narrow = DutyRange { min: 60, max: 200 };
        assert_eq!(narrow.to_raw(0.0), 60);
        assert_eq!(narrow.to_raw(100.0), 200);
    }
}
