// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Stat sources: named scalar readings consumed by curves and alert rules.
//!
//! Units are implied by the key (`*_temp` in °C, `*_power` in W, `*_usage`
//! in %). Nothing downstream interprets them.

use crate::hwmon::{self, TempSensor};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::{Components, System};

/// Aggregate stat keys filled by [`SystemStatSource`] when the hardware
/// exposes them. Other [`StatSource`] implementations may offer more.
pub const STAT_KEYS: [&str; 6] = [
    "cpu_temp",
    "cpu_power",
    "cpu_usage",
    "gpu_temp",
    "ram_usage",
    "ram_temp",
];

/// Supplies readings by key.
pub trait StatSource: Send + Sync {
    /// Current value for `key`, or `None` when unavailable this tick.
    fn get(&self, key: &str) -> Option<f64>;

    /// Take a fresh sample. Called once per control tick before any `get`.
    fn refresh(&self) {}

    /// Keys this source can currently answer.
    fn keys(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Values sampled for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatSnapshot {
    values: HashMap<String, f64>,
}

impl StatSnapshot {
    /// Read every requested key from a source. Missing keys are left out.
    pub fn sample<'a>(source: &dyn StatSource, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let wanted: BTreeSet<&str> = keys.into_iter().collect();
        let values = wanted
            .into_iter()
            .filter_map(|k| {
                let v = source.get(k).filter(|v| v.is_finite());
                if v.is_none() {
                    log::debug!("stat '{k}' unavailable this tick");
                }
                v.map(|v| (k.to_string(), v))
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for StatSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// A source with externally set values.
#[derive(Debug, Default)]
pub struct FixedStatSource {
    values: Mutex<HashMap<String, f64>>,
}

impl FixedStatSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: f64) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
    }

    pub fn clear(&self, key: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
    }
}

impl StatSource for FixedStatSource {
    fn get(&self, key: &str) -> Option<f64> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).copied()
    }

    fn keys(&self) -> Vec<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

// ---------------------------------------------------------------------------
// System source
// ---------------------------------------------------------------------------

const RAPL_ENERGY: &str = "/sys/class/powercap/intel-rapl:0/energy_uj";
const RAPL_MAX_RANGE: &str = "/sys/class/powercap/intel-rapl:0/max_energy_range_uj";

/// Readings from `sysinfo` plus raw hwmon temperature inputs.
///
/// Besides the aggregate keys in [`STAT_KEYS`], every hwmon temperature input
/// is available under its sensor id (e.g. `hwmon3/temp1`).
pub struct SystemStatSource {
    inner: Mutex<SystemSampler>,
}

struct SystemSampler {
    sys: System,
    components: Components,
    sensors: Vec<TempSensor>,
    rapl: Option<RaplCounter>,
    values: HashMap<String, f64>,
}

struct RaplCounter {
    path: PathBuf,
    wrap: u64,
    last: Option<(u64, Instant)>,
}

impl RaplCounter {
    fn open() -> Option<Self> {
        let path = PathBuf::from(RAPL_ENERGY);
        if !path.exists() {
            return None;
        }
        let wrap = hwmon::read_parsed::<u64>(Path::new(RAPL_MAX_RANGE)).unwrap_or(1 << 32);
        Some(Self {
            path,
            wrap,
            last: None,
        })
    }

    /// Average package power in watts since the previous sample.
    fn sample(&mut self) -> Option<f64> {
        let now = Instant::now();
        let energy = hwmon::read_parsed::<u64>(&self.path)?;
        let prev = self.last.replace((energy, now));
        let (prev_energy, prev_at) = prev?;
        let secs = now.duration_since(prev_at).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let delta = if energy >= prev_energy {
            energy - prev_energy
        } else {
            energy + self.wrap - prev_energy
        };
        Some(delta as f64 / 1e6 / secs)
    }
}

impl SystemStatSource {
    pub fn new(hwmon_root: &Path) -> Self {
        let sensors = hwmon::discover_temp_sensors(hwmon_root).unwrap_or_else(|e| {
            log::warn!("Failed to discover temp sensors: {e}");
            Vec::new()
        });
        log::info!("Discovered {} temp sensor(s)", sensors.len());

        Self {
            inner: Mutex::new(SystemSampler {
                sys: System::new(),
                components: Components::new_with_refreshed_list(),
                sensors,
                rapl: RaplCounter::open(),
                values: HashMap::new(),
            }),
        }
    }
}

impl SystemSampler {
    fn refresh(&mut self) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.components.refresh();

        let mut values = hwmon::read_temp_map(&self.sensors);

        values.insert("cpu_usage".to_string(), self.sys.global_cpu_usage() as f64);
        let total = self.sys.total_memory();
        if total > 0 {
            let pct = self.sys.used_memory() as f64 / total as f64 * 100.0;
            values.insert("ram_usage".to_string(), pct);
        }

        if let Some(t) = average(self.component_temps(is_cpu_label)) {
            values.insert("cpu_temp".to_string(), t);
        }
        if let Some(t) = self.component_temps(is_gpu_label).into_iter().next() {
            values.insert("gpu_temp".to_string(), t);
        }
        let dimm: Vec<f64> = self
            .sensors
            .iter()
            .filter(|s| is_dimm_chip(&s.chip))
            .filter_map(|s| values.get(&s.id).copied())
            .collect();
        if let Some(t) = average(dimm) {
            values.insert("ram_temp".to_string(), t);
        }
        if let Some(w) = self.rapl.as_mut().and_then(RaplCounter::sample) {
            values.insert("cpu_power".to_string(), w);
        }

        self.values = values;
    }

    fn component_temps(&self, pred: fn(&str) -> bool) -> Vec<f64> {
        self.components
            .list()
            .iter()
            .filter(|c| pred(&c.label().to_lowercase()))
            .map(|c| c.temperature() as f64)
            .filter(|t| t.is_finite() && *t > 0.0)
            .collect()
    }
}

impl StatSource for SystemStatSource {
    fn get(&self, key: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.values.get(key).copied()
    }

    fn refresh(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.refresh();
    }

    fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = inner.values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn is_cpu_label(label: &str) -> bool {
    ["coretemp", "package", "core", "tctl", "tdie", "cpu"]
        .iter()
        .any(|k| label.contains(k))
}

fn is_gpu_label(label: &str) -> bool {
    ["gpu", "nvidia", "amdgpu", "radeon", "edge"]
        .iter()
        .any(|k| label.contains(k))
}

fn is_dimm_chip(chip: &str) -> bool {
    let chip = chip.to_lowercase();
    chip.contains("spd5118") || chip.contains("jc42") || chip.contains("dimm")
}

fn average(values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
