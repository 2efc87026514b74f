// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Shared daemon state and the periodic control loop.
//!
//! [`SharedState`] is handed to both the command handlers and the
//! [`ControlLoop`]. Every mutable entity sits behind its own lock: one per
//! fan controller, one for the curve registry, one for the rule registry.
//! The loop is the only code path that writes PWM attributes or evaluates
//! rule latches; commands only record intent, which the next tick applies.

use crate::config::{self, Config, DaemonConfig};
use crate::curve::{Curve, CurveRegistry, DEFAULT_DUTY_PERCENT};
use crate::error::{ControlError, Result};
use crate::event::{Event, EventSink, Severity};
use crate::fan::{self, FanController, FanMode, TickOutcome, TickPlan};
use crate::hwmon::{self, ChannelStatus, PwmChannel};
use crate::notify::{NotificationEngine, NotificationRule, RuleRegistry};
use crate::stats::{STAT_KEYS, StatSnapshot, StatSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{RwLock, watch};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::{self, Duration, MissedTickBehavior};

const NO_CHANNELS: &str = "no controllable PWM channels found; monitoring only";

// ---------------------------------------------------------------------------
// Status reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanReport {
    pub channel: ChannelStatus,
    /// `None` for read-only channels, which are monitored but never driven.
    pub mode: Option<FanMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    pub fans: Vec<FanReport>,
    /// Readings from the most recent tick.
    pub stats: BTreeMap<String, f64>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Where `save`/`reload` read and write.
#[derive(Debug, Clone)]
pub struct Store {
    pub config_path: PathBuf,
    pub daemon: DaemonConfig,
}

/// A write job that outlived `io_timeout`. Committed once it finishes.
struct LateWrite {
    plan: TickPlan,
    job: JoinHandle<TickOutcome>,
}

struct FanSlot {
    channel: Arc<dyn PwmChannel>,
    controller: RwLock<FanController>,
    late: Mutex<Option<LateWrite>>,
}

impl FanSlot {
    fn late(&self) -> MutexGuard<'_, Option<LateWrite>> {
        self.late.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct SharedState {
    fans: Vec<Arc<FanSlot>>,
    monitored: Vec<Arc<dyn PwmChannel>>,
    curves: RwLock<CurveRegistry>,
    rules: RwLock<RuleRegistry>,
    last_stats: RwLock<StatSnapshot>,
    store: Option<Store>,
    /// Bound on the sysfs reads behind `status`.
    io_timeout: Duration,
}

impl SharedState {
    /// One controller is created per writable channel. Read-only channels
    /// are kept for status reporting only.
    pub fn new(
        channels: Vec<Arc<dyn PwmChannel>>,
        curves: CurveRegistry,
        rules: RuleRegistry,
    ) -> Self {
        let (writable, monitored): (Vec<_>, Vec<_>) =
            channels.into_iter().partition(|c| c.info().writable);

        for ch in &monitored {
            log::info!("{} is not writable; monitoring only", ch.id());
        }
        if writable.is_empty() {
            log::warn!("No controllable PWM channels found; running in monitor-only mode");
        } else {
            log::info!("Controlling {} PWM channel(s)", writable.len());
        }

        let fans = writable
            .into_iter()
            .map(|channel| {
                Arc::new(FanSlot {
                    controller: RwLock::new(FanController::new(channel.id())),
                    channel,
                    late: Mutex::new(None),
                })
            })
            .collect();

        Self {
            fans,
            monitored,
            curves: RwLock::new(curves),
            rules: RwLock::new(rules),
            last_stats: RwLock::new(StatSnapshot::default()),
            store: None,
            io_timeout: Duration::from_millis(config::DEFAULT_IO_TIMEOUT_MS),
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Ids of the channels under software control.
    pub fn fan_ids(&self) -> Vec<String> {
        self.fans.iter().map(|s| s.channel.id().to_string()).collect()
    }

    fn slot(&self, fan_id: &str) -> Result<&FanSlot> {
        if let Some(slot) = self.fans.iter().find(|s| s.channel.id() == fan_id) {
            return Ok(slot);
        }
        if self.monitored.iter().any(|c| c.id() == fan_id) {
            return Err(ControlError::PermissionDenied(format!(
                "{fan_id} is not writable"
            )));
        }
        Err(ControlError::UnknownFan(fan_id.to_string()))
    }

    // -- fans ---------------------------------------------------------------

    /// Record a new mode for a fan. Hardware is touched on the next tick.
    pub async fn set_mode(&self, fan_id: &str, mode: FanMode) -> Result<()> {
        let slot = self.slot(fan_id)?;
        // Held until the mode is stored so a concurrent delete cannot orphan it.
        let curves = self.curves.read().await;
        if let Some(name) = mode.curve_name() {
            if !curves.contains(name) {
                return Err(ControlError::UnknownCurve(name.to_string()));
            }
        }
        slot.controller.write().await.set_mode(mode)
    }

    pub async fn mode(&self, fan_id: &str) -> Result<FanMode> {
        let slot = self.slot(fan_id)?;
        Ok(slot.controller.read().await.mode().clone())
    }

    pub async fn modes(&self) -> Vec<(String, FanMode)> {
        let mut modes = Vec::with_capacity(self.fans.len());
        for slot in &self.fans {
            let ctl = slot.controller.read().await;
            modes.push((ctl.fan_id().to_string(), ctl.mode().clone()));
        }
        modes
    }

    /// Apply assignments loaded from the config file. Bad entries are
    /// logged and skipped.
    pub async fn apply_assignments(&self, fans: &HashMap<String, FanMode>) {
        let mut ids: Vec<&String> = fans.keys().collect();
        ids.sort();
        for fan_id in ids {
            if let Err(e) = self.set_mode(fan_id, fans[fan_id].clone()).await {
                log::warn!("Config entry for {fan_id} not applied: {e}");
            }
        }
    }

    // -- curves -------------------------------------------------------------

    pub async fn list_curves(&self) -> Vec<Curve> {
        self.curves.read().await.iter().cloned().collect()
    }

    pub async fn upsert_curve(&self, curve: Curve) -> Result<()> {
        curve.validate().map_err(ControlError::Parse)?;
        let name = curve.name().to_string();
        if self.curves.write().await.upsert(curve).is_some() {
            log::info!("Curve '{name}' updated");
        } else {
            log::info!("Curve '{name}' created");
        }
        Ok(())
    }

    /// Delete a curve. Fails with [`ControlError::CurveInUse`] while a fan
    /// references it, unless `force` is set, in which case those fans are
    /// switched to Manual at the default duty. Returns the reassigned fans.
    pub async fn delete_curve(&self, name: &str, force: bool) -> Result<Vec<String>> {
        let mut curves = self.curves.write().await;
        if !curves.contains(name) {
            return Err(ControlError::UnknownCurve(name.to_string()));
        }

        let mut users = Vec::new();
        for slot in &self.fans {
            if slot.controller.read().await.mode().curve_name() == Some(name) {
                users.push(slot);
            }
        }

        if !users.is_empty() && !force {
            return Err(ControlError::CurveInUse {
                name: name.to_string(),
                fans: users.iter().map(|s| s.channel.id().to_string()).collect(),
            });
        }

        let mut reassigned = Vec::with_capacity(users.len());
        for slot in users {
            slot.controller.write().await.set_mode(FanMode::Manual {
                percent: DEFAULT_DUTY_PERCENT,
            })?;
            reassigned.push(slot.channel.id().to_string());
        }
        curves.remove(name)?;
        log::info!("Curve '{name}' deleted");
        Ok(reassigned)
    }

    // -- rules --------------------------------------------------------------

    pub async fn list_rules(&self) -> Vec<NotificationRule> {
        self.rules.read().await.rules().to_vec()
    }

    pub async fn add_rule(
        &self,
        message: String,
        severity: Severity,
        component: String,
        threshold: f64,
    ) -> Result<u64> {
        let id = self
            .rules
            .write()
            .await
            .add(message, severity, component, threshold)?;
        log::info!("Notification rule {id} added");
        Ok(id)
    }

    pub async fn delete_rule(&self, id: u64) -> Result<()> {
        self.rules.write().await.remove(id)?;
        log::info!("Notification rule {id} deleted");
        Ok(())
    }

    // -- status -------------------------------------------------------------

    pub async fn status(&self) -> StatusReport {
        let mut entries: Vec<(Arc<dyn PwmChannel>, Option<FanMode>)> = Vec::new();
        for slot in &self.fans {
            let mode = slot.controller.read().await.mode().clone();
            entries.push((slot.channel.clone(), Some(mode)));
        }
        entries.extend(self.monitored.iter().map(|c| (c.clone(), None)));

        // Reads run side by side; a channel that misses the deadline is
        // reported without readings.
        let jobs: Vec<_> = entries
            .into_iter()
            .map(|(channel, mode)| {
                let reader = channel.clone();
                (channel, mode, task::spawn_blocking(move || reader.status()))
            })
            .collect();
        let deadline = time::Instant::now() + self.io_timeout;
        let mut fans = Vec::with_capacity(jobs.len());
        let mut warnings = Vec::new();
        for (channel, mode, job) in jobs {
            let status = match time::timeout_at(deadline, job).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    log::error!("{}: status read failed: {e}", channel.id());
                    ChannelStatus::unread(channel.info())
                }
                Err(_) => {
                    log::warn!("{}: status read timed out", channel.id());
                    warnings.push(format!("{}: readings timed out", channel.id()));
                    ChannelStatus::unread(channel.info())
                }
            };
            fans.push(FanReport {
                channel: status,
                mode,
            });
        }

        let stats = self
            .last_stats
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        if self.fans.is_empty() {
            warnings.push(NO_CHANNELS.to_string());
        }

        StatusReport {
            fans,
            stats,
            warnings,
        }
    }

    // -- persistence --------------------------------------------------------

    fn store(&self) -> Result<&Store> {
        self.store
            .as_ref()
            .ok_or_else(|| ControlError::Io("no storage location configured".to_string()))
    }

    /// Write the config (with current fan modes), curves and rules to disk.
    pub async fn save(&self) -> Result<()> {
        let store = self.store()?.clone();
        let config = Config {
            daemon: store.daemon.clone(),
            fans: self.modes().await.into_iter().collect(),
        };
        let curves = self.curves.read().await.clone();
        let rules = self.rules.read().await.clone();

        task::spawn_blocking(move || -> io::Result<()> {
            config::save_config(&store.config_path, &config)?;
            config::save_curves(&store.daemon.curves_path, &curves)?;
            config::save_rules(&store.daemon.rules_path, &rules)
        })
        .await
        .map_err(|e| ControlError::Io(e.to_string()))??;
        Ok(())
    }

    /// Re-read curves, rules and fan assignments. Nothing is replaced if any
    /// file fails to parse. Fans left on a curve that no longer exists are
    /// switched to Manual at the default duty. Daemon settings take effect on
    /// restart.
    pub async fn reload(&self) -> Result<()> {
        let store = self.store()?.clone();
        let (cfg, curves, rules) = task::spawn_blocking(move || -> io::Result<_> {
            let cfg = config::load_config(&store.config_path)?;
            let curves = or_empty(config::try_load_curves(&store.daemon.curves_path))?;
            let rules = or_empty(config::try_load_rules(&store.daemon.rules_path))?;
            Ok((cfg, curves, rules))
        })
        .await
        .map_err(|e| ControlError::Io(e.to_string()))??;

        {
            let mut registry = self.curves.write().await;
            for slot in &self.fans {
                let mut ctl = slot.controller.write().await;
                let orphaned = ctl.mode().curve_name().is_some_and(|n| !curves.contains(n));
                if orphaned {
                    log::warn!(
                        "{}: curve {:?} is gone after reload; switching to manual",
                        slot.channel.id(),
                        ctl.mode().curve_name().unwrap_or_default()
                    );
                    ctl.set_mode(FanMode::Manual {
                        percent: DEFAULT_DUTY_PERCENT,
                    })?;
                }
            }
            *registry = curves;
        }
        self.rules.write().await.replace(rules);
        self.apply_assignments(&cfg.fans).await;
        log::info!("Configuration reloaded");
        Ok(())
    }

    /// Hand every controlled channel back to its original enable mode.
    pub async fn restore_all(&self) {
        let channels: Vec<Arc<dyn PwmChannel>> =
            self.fans.iter().map(|s| s.channel.clone()).collect();
        let count = channels.len();
        match task::spawn_blocking(move || hwmon::restore_all(&channels)).await {
            Ok(()) => log::info!("Restored {count} fan(s) to their original control mode"),
            Err(e) => log::error!("Restore task failed: {e}"),
        }
    }

    /// Stat keys the next tick should sample.
    async fn wanted_stats(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = STAT_KEYS.iter().map(|k| k.to_string()).collect();
        for slot in &self.fans {
            if let Some(key) = slot.controller.read().await.mode().stat_key() {
                keys.insert(key.to_string());
            }
        }
        keys.extend(self.rules.read().await.stat_keys().map(String::from));
        keys.into_iter().collect()
    }
}

fn or_empty<T: Default>(loaded: io::Result<T>) -> io::Result<T> {
    match loaded {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

pub struct ControlLoop {
    state: Arc<SharedState>,
    stats: Arc<dyn StatSource>,
    sink: Arc<dyn EventSink>,
    engine: NotificationEngine,
    io_timeout: Duration,
}

impl ControlLoop {
    pub fn new(
        state: Arc<SharedState>,
        stats: Arc<dyn StatSource>,
        sink: Arc<dyn EventSink>,
        engine: NotificationEngine,
        io_timeout: Duration,
    ) -> Self {
        Self {
            state,
            stats,
            sink,
            engine,
            io_timeout,
        }
    }

    /// Run one tick: sample stats, drive every fan, evaluate rules and
    /// deliver the resulting events. Returns what was delivered.
    pub async fn tick(&self) -> Vec<Event> {
        let keys = self.state.wanted_stats().await;
        let source = self.stats.clone();
        let snapshot = task::spawn_blocking(move || {
            source.refresh();
            StatSnapshot::sample(&*source, keys.iter().map(String::as_str))
        })
        .await
        .unwrap_or_else(|e| {
            log::error!("Stat sampling failed: {e}");
            StatSnapshot::default()
        });

        let snapshot = Arc::new(snapshot);
        let curves = Arc::new(self.state.curves.read().await.clone());

        let mut jobs = JoinSet::new();
        for slot in &self.state.fans {
            jobs.spawn(drive_fan(
                slot.clone(),
                snapshot.clone(),
                curves.clone(),
                self.io_timeout,
            ));
        }

        let mut events = Vec::new();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => log::error!("Fan task failed: {e}"),
            }
        }

        let alerts = self
            .engine
            .evaluate(&mut *self.state.rules.write().await, &snapshot);
        events.extend(alerts.into_iter().map(Event::Alert));

        *self.state.last_stats.write().await =
            Arc::try_unwrap(snapshot).unwrap_or_else(|shared| (*shared).clone());

        for event in &events {
            self.sink.deliver(event);
        }
        events
    }

    /// Tick every `period` until `shutdown` flips. A tick already in flight
    /// when shutdown is requested runs to completion.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Control loop started ({}ms period)", period.as_millis());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        log::info!("Control loop stopped");
    }
}

/// Plan, execute and commit one fan's tick. Only the execute step runs
/// without a lock, on the blocking pool, bounded by `io_timeout`. A job that
/// overruns keeps the channel busy and is committed on a later tick.
async fn drive_fan(
    slot: Arc<FanSlot>,
    stats: Arc<StatSnapshot>,
    curves: Arc<CurveRegistry>,
    io_timeout: Duration,
) -> Option<Event> {
    let id = slot.channel.id().to_string();

    let late = {
        let mut late = slot.late();
        match late.take() {
            Some(pending) if !pending.job.is_finished() => {
                *late = Some(pending);
                log::warn!("{id}: previous write still pending, skipping this tick");
                return None;
            }
            finished => finished,
        }
    };
    if let Some(LateWrite { plan, job }) = late {
        match job.await {
            Ok(outcome) => {
                let event = slot.controller.write().await.commit(&plan, &outcome);
                if event.is_some() {
                    return event;
                }
            }
            Err(e) => log::error!("{id}: I/O task failed: {e}"),
        }
    }

    let plan = slot.controller.read().await.plan(&stats, &curves);
    if plan.is_idle() {
        return None;
    }

    let channel = slot.channel.clone();
    let job_plan = plan.clone();
    let mut job = task::spawn_blocking(move || fan::execute(channel.as_ref(), &job_plan));

    let outcome = match time::timeout(io_timeout, &mut job).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            log::error!("{id}: I/O task failed: {e}");
            return None;
        }
        Err(_) => {
            log::warn!("{id}: I/O timed out after {io_timeout:?}, skipping this tick");
            *slot.late() = Some(LateWrite { plan, job });
            return None;
        }
    };

    slot.controller.write().await.commit(&plan, &outcome)
}
