// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Threshold alerts with hysteresis.
//!
//! Each rule carries a latch. The latch trips (and an alert is emitted) when
//! the watched value reaches the threshold, and re-arms silently only once
//! the value falls below a damped release point:
//!
//! ```text
//!  value
//!    │        ┌── trigger: value >= threshold        (alert)
//!    ├────────┼──────────────────────────────
//!    │        │   stays Above in the deadband
//!    ├────────┼──────────────────────────────
//!    │        └── release: value < threshold - max(|threshold| * h, 0.5)   (silent)
//! ```

use crate::error::{ControlError, Result};
use crate::event::{Alert, Severity};
use crate::stats::StatSnapshot;
use serde::{Deserialize, Serialize};

/// Default release deadband as a fraction of the threshold.
pub const DEFAULT_HYSTERESIS_FRACTION: f64 = 0.10;

/// Smallest release deadband, in the stat's own unit. Keeps thresholds at or
/// near zero from re-firing on every crossing.
pub const MIN_RELEASE_DEADBAND: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Latch {
    #[default]
    Below,
    Above,
}

/// A user-defined alert rule. The latch is runtime-only and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: u64,
    pub message: String,
    #[serde(rename = "type")]
    pub severity: Severity,
    /// Stat key watched by this rule
    pub component: String,
    pub threshold: f64,
    #[serde(skip)]
    pub latch: Latch,
}

impl NotificationRule {
    pub fn new(
        id: u64,
        message: impl Into<String>,
        severity: Severity,
        component: impl Into<String>,
        threshold: f64,
    ) -> Self {
        Self {
            id,
            message: message.into(),
            severity,
            component: component.into(),
            threshold,
            latch: Latch::Below,
        }
    }

    /// Value below which an Above latch re-arms.
    pub fn release_point(&self, hysteresis: f64) -> f64 {
        let deadband = (self.threshold.abs() * hysteresis).max(MIN_RELEASE_DEADBAND);
        self.threshold - deadband
    }

    /// Feed one reading. Returns an alert only on a Below -> Above transition.
    /// A missing reading leaves the latch untouched.
    pub fn evaluate(&mut self, value: Option<f64>, hysteresis: f64) -> Option<Alert> {
        let value = value.filter(|v| !v.is_nan())?;
        match self.latch {
            Latch::Below if value >= self.threshold => {
                self.latch = Latch::Above;
                Some(Alert {
                    rule_id: self.id,
                    severity: self.severity,
                    message: self.message.clone(),
                    stat_key: self.component.clone(),
                    value,
                    threshold: self.threshold,
                })
            }
            Latch::Above if value < self.release_point(hysteresis) => {
                self.latch = Latch::Below;
                log::debug!(
                    "rule {} re-armed ({} = {value:.1})",
                    self.id,
                    self.component
                );
                None
            }
            _ => None,
        }
    }
}

/// Owns the rules and assigns ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleRegistry {
    rules: Vec<NotificationRule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from loaded rules. Duplicate ids keep the first occurrence.
    /// Latches start Below.
    pub fn from_rules(rules: Vec<NotificationRule>) -> Self {
        let mut reg = Self::new();
        for mut rule in rules {
            if reg.get(rule.id).is_some() {
                log::warn!("Dropping notification rule with duplicate id {}", rule.id);
                continue;
            }
            rule.latch = Latch::Below;
            reg.rules.push(rule);
        }
        reg
    }

    /// `None` once a rule holds `u64::MAX`.
    fn next_id(&self) -> Option<u64> {
        match self.rules.iter().map(|r| r.id).max() {
            Some(max) => max.checked_add(1),
            None => Some(0),
        }
    }

    /// Create a rule and return its id.
    pub fn add(
        &mut self,
        message: impl Into<String>,
        severity: Severity,
        component: impl Into<String>,
        threshold: f64,
    ) -> Result<u64> {
        if !threshold.is_finite() {
            return Err(ControlError::Parse(format!(
                "threshold {threshold} is not a finite number"
            )));
        }
        let id = self
            .next_id()
            .ok_or_else(|| ControlError::Parse("rule id space exhausted".to_string()))?;
        self.rules
            .push(NotificationRule::new(id, message, severity, component, threshold));
        Ok(id)
    }

    pub fn remove(&mut self, id: u64) -> Result<NotificationRule> {
        let idx = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(ControlError::UnknownRule(id))?;
        Ok(self.rules.remove(idx))
    }

    pub fn get(&self, id: u64) -> Option<&NotificationRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationRule> {
        self.rules.iter()
    }

    pub fn rules(&self) -> &[NotificationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Stat keys any rule watches.
    pub fn stat_keys(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.component.as_str())
    }

    pub fn reset_latches(&mut self) {
        for rule in &mut self.rules {
            rule.latch = Latch::Below;
        }
    }

    /// Replace definitions while keeping the latch of rules that survive
    /// unchanged, so an edit elsewhere does not re-fire an active alert.
    pub fn replace(&mut self, other: RuleRegistry) {
        let old = std::mem::replace(&mut self.rules, other.rules);
        for rule in &mut self.rules {
            if let Some(prev) = old.iter().find(|p| {
                p.id == rule.id && p.component == rule.component && p.threshold == rule.threshold
            }) {
                rule.latch = prev.latch;
            }
        }
    }
}

/// Evaluates every rule against a tick's readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotificationEngine {
    hysteresis: f64,
}

impl Default for NotificationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_HYSTERESIS_FRACTION)
    }
}

impl NotificationEngine {
    /// `hysteresis` is clamped to `[0, 1]`.
    pub fn new(hysteresis: f64) -> Self {
        let hysteresis = if hysteresis.is_finite() {
            hysteresis.clamp(0.0, 1.0)
        } else {
            DEFAULT_HYSTERESIS_FRACTION
        };
        Self { hysteresis }
    }

    pub fn hysteresis(&self) -> f64 {
        self.hysteresis
    }

    pub fn evaluate(&self, rules: &mut RuleRegistry, stats: &StatSnapshot) -> Vec<Alert> {
        rules
            .rules
            .iter_mut()
            .filter_map(|rule| {
                let value = stats.get(&rule.component);
                rule.evaluate(value, self.hysteresis)
            })
            .collect()
    }
}
