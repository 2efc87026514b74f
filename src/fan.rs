// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Per-fan control state machine.
//!
//! A [`FanController`] records the requested [`FanMode`] and what has already
//! been pushed to hardware. Each control tick is split in three so that no
//! lock needs to be held across sysfs I/O:
//!
//! 1. [`FanController::plan`] decides which writes are owed (pure);
//! 2. [`execute`] performs them against a [`PwmChannel`];
//! 3. [`FanController::commit`] folds the outcome back, switching to
//!    [`FanMode::Auto`] if a write failed.

use crate::curve::CurveRegistry;
use crate::error::{ControlError, Result};
use crate::event::Event;
use crate::hwmon::{EnableMode, PwmChannel};
use crate::stats::StatSnapshot;
use serde::{Deserialize, Serialize};

/// How a fan is driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum FanMode {
    /// Firmware/BIOS control.
    Auto,
    /// Fixed duty cycle in percent.
    Manual { percent: f64 },
    /// Duty taken from a curve evaluated against a stat.
    Graph { curve_name: String, stat_key: String },
}

impl FanMode {
    fn same_variant(&self, other: &FanMode) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// The curve this mode depends on, if any.
    pub fn curve_name(&self) -> Option<&str> {
        match self {
            FanMode::Graph { curve_name, .. } => Some(curve_name),
            _ => None,
        }
    }

    /// The stat this mode depends on, if any.
    pub fn stat_key(&self) -> Option<&str> {
        match self {
            FanMode::Graph { stat_key, .. } => Some(stat_key),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            FanMode::Manual { percent } if !(0.0..=100.0).contains(percent) => {
                Err(ControlError::InvalidRange(*percent))
            }
            _ => Ok(()),
        }
    }
}

/// Hardware work owed for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickPlan {
    pub generation: u64,
    pub enable: Option<EnableMode>,
    pub duty: Option<f64>,
}

impl TickPlan {
    pub fn is_idle(&self) -> bool {
        self.enable.is_none() && self.duty.is_none()
    }
}

/// What happened when a plan was executed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickOutcome {
    pub enable: Option<Result<bool>>,
    pub duty: Option<Result<()>>,
    /// Emergency hand-back attempted after a failure.
    pub released: Option<Result<bool>>,
}

impl TickOutcome {
    fn failure(&self) -> Option<&ControlError> {
        let enable_failed = match &self.enable {
            Some(Err(e)) => Some(e),
            _ => None,
        };
        let duty_failed = match &self.duty {
            Some(Err(e)) => Some(e),
            _ => None,
        };
        enable_failed.or(duty_failed)
    }
}

#[derive(Debug, Clone)]
pub struct FanController {
    fan_id: String,
    mode: FanMode,
    /// Bumped on every mode change; commits for older plans are dropped.
    generation: u64,
    /// Enable mode matches `mode`.
    enable_synced: bool,
    /// Last duty successfully written while in the current variant.
    last_duty: Option<f64>,
}

impl FanController {
    /// A new controller starts in Auto and leaves the hardware untouched.
    pub fn new(fan_id: impl Into<String>) -> Self {
        Self {
            fan_id: fan_id.into(),
            mode: FanMode::Auto,
            generation: 0,
            enable_synced: true,
            last_duty: None,
        }
    }

    pub fn fan_id(&self) -> &str {
        &self.fan_id
    }

    pub fn mode(&self) -> &FanMode {
        &self.mode
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Request a mode. Entering a different mode re-syncs the enable
    /// attribute on the next tick; changing parameters within the same mode
    /// does not.
    pub fn set_mode(&mut self, mode: FanMode) -> Result<()> {
        mode.validate()?;
        if mode == self.mode {
            return Ok(());
        }
        if !mode.same_variant(&self.mode) {
            self.enable_synced = false;
            self.last_duty = None;
        }
        log::info!("{}: mode {:?} -> {:?}", self.fan_id, self.mode, mode);
        self.mode = mode;
        self.generation += 1;
        Ok(())
    }

    /// Decide what this tick owes the hardware.
    pub fn plan(&self, stats: &StatSnapshot, curves: &CurveRegistry) -> TickPlan {
        let want = |mode| (!self.enable_synced).then_some(mode);

        let (enable, duty) = match &self.mode {
            FanMode::Auto => (want(EnableMode::Hardware), None),
            FanMode::Manual { percent } => {
                let duty = (self.last_duty != Some(*percent)).then_some(*percent);
                (want(EnableMode::Software), duty)
            }
            FanMode::Graph {
                curve_name,
                stat_key,
            } => {
                let duty = match (curves.get(curve_name), stats.get(stat_key)) {
                    (None, _) => {
                        log::warn!("{}: curve '{curve_name}' not found, skipping", self.fan_id);
                        None
                    }
                    (Some(_), None) => {
                        log::debug!(
                            "{}: {}",
                            self.fan_id,
                            ControlError::StatUnavailable(stat_key.clone())
                        );
                        None
                    }
                    (Some(curve), Some(value)) => Some(curve.evaluate(value)),
                };
                (want(EnableMode::Software), duty)
            }
        };

        TickPlan {
            generation: self.generation,
            enable,
            duty,
        }
    }

    /// Apply the result of [`execute`]. Returns a fallback event when the fan
    /// was forced back to Auto.
    pub fn commit(&mut self, plan: &TickPlan, outcome: &TickOutcome) -> Option<Event> {
        if plan.generation != self.generation {
            log::debug!("{}: dropping outcome of a superseded plan", self.fan_id);
            if outcome.released.is_some() && !matches!(self.mode, FanMode::Auto) {
                // The stale plan handed the channel back; take it again.
                self.enable_synced = false;
            }
            return None;
        }

        if let Some(err) = outcome.failure() {
            if matches!(self.mode, FanMode::Auto) {
                // Releasing to firmware is best-effort; never retry in a loop.
                log::warn!("{}: could not restore automatic control: {err}", self.fan_id);
                self.enable_synced = true;
                return None;
            }
            log::warn!("{}: {err}; falling back to automatic control", self.fan_id);
            let event = Event::fan_fallback(&self.fan_id, err);
            self.mode = FanMode::Auto;
            self.generation += 1;
            self.last_duty = None;
            // A successful emergency release already synced the enable mode.
            self.enable_synced = matches!(outcome.released, Some(Ok(_)));
            if let Some(Err(e)) = &outcome.released {
                log::warn!("{}: release after failure also failed: {e}", self.fan_id);
                self.enable_synced = true;
            }
            return Some(event);
        }

        if plan.enable.is_some() {
            self.enable_synced = true;
        }
        if let (Some(duty), Some(Ok(()))) = (plan.duty, &outcome.duty) {
            self.last_duty = Some(duty);
        }
        None
    }

    /// Plan, execute and commit in one go. For callers that own the
    /// controller exclusively.
    pub fn tick(
        &mut self,
        channel: &dyn PwmChannel,
        stats: &StatSnapshot,
        curves: &CurveRegistry,
    ) -> Option<Event> {
        let plan = self.plan(stats, curves);
        if plan.is_idle() {
            return None;
        }
        let outcome = execute(channel, &plan);
        self.commit(&plan, &outcome)
    }
}

/// Perform a plan's hardware writes. On any failure while taking software
/// control the channel is immediately handed back to firmware.
pub fn execute(channel: &dyn PwmChannel, plan: &TickPlan) -> TickOutcome {
    let mut outcome = TickOutcome::default();

    if let Some(mode) = plan.enable {
        let result = channel.set_enable_mode(mode);
        let failed = result.is_err();
        outcome.enable = Some(result);
        if failed {
            if mode == EnableMode::Software {
                outcome.released = Some(channel.set_enable_mode(EnableMode::Hardware));
            }
            return outcome;
        }
    }

    if let Some(duty) = plan.duty {
        if !channel.info().writable {
            outcome.duty = Some(Err(ControlError::PermissionDenied(format!(
                "{} is not writable",
                channel.id()
            ))));
        } else {
            outcome.duty = Some(channel.write_duty(duty));
        }
        if matches!(outcome.duty, Some(Err(_))) {
            outcome.released = Some(channel.set_enable_mode(EnableMode::Hardware));
        }
    }

    outcome
}


#[cfg(test)]
mod tests {
    use super::testing::{Call, FakeChannel};
    use super::*;
    use crate::curve::{Curve, CurvePoint};

    fn linear_curves() -> CurveRegistry {
        [Curve::new(
            "linear",
            vec![CurvePoint::new(0.0, 0.0), CurvePoint::new(100.0, 100.0)],
            "Cpu Temp (°C)",
            "Fan Speed (%)",
        )]
        .into_iter()
        .collect()
    }

    fn snap(value: f64) -> StatSnapshot {
        [("cpu_temp", value)].into_iter().collect()
    }

    fn graph() -> FanMode {
        FanMode::Graph {
            curve_name: "linear".to_string(),
            stat_key: "cpu_temp".to_string(),
        }
    }

    #[test]
    fn test_new_controller_leaves_hardware_alone() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        let mut fan = FanController::new("hwmon1/pwm1");
        assert!(fan.tick(&ch, &snap(50.0), &linear_curves()).is_none());
        assert!(ch.calls().is_empty());
    }

    #[test]
    fn test_graph_writes_every_tick() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        let curves = linear_curves();
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(graph()).unwrap();

        for v in [20.0, 40.0, 60.0, 60.0] {
            assert!(fan.tick(&ch, &snap(v), &curves).is_none());
        }
        assert_eq!(ch.duties(), vec![20.0, 40.0, 60.0, 60.0]);
        let enables = ch
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Enable(_)))
            .count();
        assert_eq!(enables, 1);
        assert_eq!(ch.calls()[0], Call::Enable(EnableMode::Software));
    }

    #[test]
    fn test_manual_writes_once_until_target_changes() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        let curves = CurveRegistry::new();
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(FanMode::Manual { percent: 40.0 }).unwrap();
        for _ in 0..3 {
            fan.tick(&ch, &StatSnapshot::default(), &curves);
        }
        fan.set_mode(FanMode::Manual { percent: 70.0 }).unwrap();
        fan.tick(&ch, &StatSnapshot::default(), &curves);
        fan.tick(&ch, &StatSnapshot::default(), &curves);

        assert_eq!(
            ch.calls(),
            vec![
                Call::Enable(EnableMode::Software),
                Call::Duty(40.0),
                Call::Duty(70.0),
            ]
        );
    }

    #[test]
    fn test_auto_releases_to_hardware_once() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        let curves = CurveRegistry::new();
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(FanMode::Manual { percent: 40.0 }).unwrap();
        fan.tick(&ch, &StatSnapshot::default(), &curves);
        fan.set_mode(FanMode::Auto).unwrap();
        fan.tick(&ch, &StatSnapshot::default(), &curves);
        fan.tick(&ch, &StatSnapshot::default(), &curves);

        assert_eq!(
            ch.calls(),
            vec![
                Call::Enable(EnableMode::Software),
                Call::Duty(40.0),
                Call::Enable(EnableMode::Hardware),
            ]
        );
    }

    #[test]
    fn test_graph_parameter_change_does_not_churn_enable() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        let mut curves = linear_curves();
        curves.upsert(Curve::new(
            "flat",
            vec![CurvePoint::new(0.0, 35.0)],
            "Gpu Temp (°C)",
            "Fan Speed (%)",
        ));
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(graph()).unwrap();
        fan.tick(&ch, &snap(50.0), &curves);

        fan.set_mode(FanMode::Graph {
            curve_name: "flat".to_string(),
            stat_key: "cpu_temp".to_string(),
        })
        .unwrap();
        // Takes effect on the next tick, not on the mode change itself.
        assert_eq!(ch.duties(), vec![50.0]);
        fan.tick(&ch, &snap(50.0), &curves);

        assert_eq!(ch.duties(), vec![50.0, 35.0]);
        assert_eq!(
            ch.calls()
                .iter()
                .filter(|c| matches!(c, Call::Enable(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_write_failure_falls_back_once() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        let curves = linear_curves();
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(graph()).unwrap();
        fan.tick(&ch, &snap(30.0), &curves);

        ch.fail_writes(ControlError::HardwareGone("hwmon1/pwm1".into()));
        let mut events = Vec::new();
        for v in [40.0, 50.0, 60.0] {
            events.extend(fan.tick(&ch, &snap(v), &curves));
        }

        assert_eq!(fan.mode(), &FanMode::Auto);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::FanFallback { fan_id, .. } if fan_id == "hwmon1/pwm1"));
        // Released immediately, and not again on later ticks.
        let hardware = ch
            .calls()
            .iter()
            .filter(|c| **c == Call::Enable(EnableMode::Hardware))
            .count();
        assert_eq!(hardware, 1);
    }

    #[test]
    fn test_enable_failure_falls_back() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        ch.fail_software_enable(ControlError::PermissionDenied("pwm1_enable".into()));
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(FanMode::Manual { percent: 60.0 }).unwrap();
        let ev = fan.tick(&ch, &StatSnapshot::default(), &CurveRegistry::new());
        assert!(ev.is_some());
        assert_eq!(fan.mode(), &FanMode::Auto);
        assert!(ch.duties().is_empty());
    }

    #[test]
    fn test_read_only_channel_never_written() {
        let ch = FakeChannel::read_only("hwmon1/pwm1");
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(FanMode::Manual { percent: 60.0 }).unwrap();
        let ev = fan.tick(&ch, &StatSnapshot::default(), &CurveRegistry::new());
        assert!(ev.is_some());
        assert!(ch.duties().is_empty());
    }

    #[test]
    fn test_missing_stat_skips_write() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(graph()).unwrap();
        let ev = fan.tick(&ch, &StatSnapshot::default(), &linear_curves());
        assert!(ev.is_none());
        assert!(ch.duties().is_empty());
        assert_eq!(fan.mode(), &graph());
    }

    #[test]
    fn test_stale_commit_is_ignored() {
        let ch = FakeChannel::new("hwmon1/pwm1");
        ch.fail_writes(ControlError::HardwareGone("gone".into()));
        let mut fan = FanController::new("hwmon1/pwm1");
        fan.set_mode(FanMode::Manual { percent: 60.0 }).unwrap();

        let plan = fan.plan(&StatSnapshot::default(), &CurveRegistry::new());
        let outcome = execute(&ch, &plan);
        // The user switched modes while the write was in flight.
        fan.set_mode(FanMode::Manual { percent: 80.0 }).unwrap();
        assert!(fan.commit(&plan, &outcome).is_none());
        assert_eq!(fan.mode(), &FanMode::Manual { percent: 80.0 });
    }

    #[test]
    fn test_invalid_manual_target_rejected() {
        let mut fan = FanController::new("hwmon1/pwm1");
        assert!(matches!(
            fan.set_mode(FanMode::Manual { percent: 120.0 }),
            Err(ControlError::InvalidRange(_))
        ));
        assert_eq!(fan.mode(), &FanMode::Auto);
    }
}
