// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan curve definitions and interpolation.
//!
//! A curve maps an arbitrary monitored value (temperature, power, usage) to a
//! fan duty cycle in percent. Points are linearly interpolated between the
//! defined inputs and held flat outside of them.

use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Duty returned by a curve with no points. Never silently stop a fan.
pub const DEFAULT_DUTY_PERCENT: f64 = 50.0;

/// Default output axis label.
pub const DEFAULT_YLABEL: &str = "Fan Speed (%)";

/// A single control point. Stored on disk as a `[x, y]` pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct CurvePoint {
    /// Monitored value
    pub x: f64,
    /// Duty cycle in percent
    pub y: f64,
}

impl CurvePoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for CurvePoint {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<CurvePoint> for [f64; 2] {
    fn from(p: CurvePoint) -> Self {
        [p.x, p.y]
    }
}

/// A named curve with points kept sorted by ascending `x`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawCurve")]
pub struct Curve {
    name: String,
    points: Vec<CurvePoint>,
    xlabel: String,
    ylabel: String,
}

#[derive(Deserialize)]
struct RawCurve {
    name: String,
    #[serde(default)]
    points: Vec<CurvePoint>,
    #[serde(default)]
    xlabel: String,
    #[serde(default)]
    ylabel: String,
}

impl From<RawCurve> for Curve {
    fn from(raw: RawCurve) -> Self {
        Curve::new(raw.name, raw.points, raw.xlabel, raw.ylabel)
    }
}

impl Curve {
    /// Create a curve. Points are sorted by `x`; when two points share an
    /// `x`, the one given later wins.
    pub fn new(
        name: impl Into<String>,
        points: Vec<CurvePoint>,
        xlabel: impl Into<String>,
        ylabel: impl Into<String>,
    ) -> Self {
        let mut curve = Self {
            name: name.into(),
            points: Vec::with_capacity(points.len()),
            xlabel: xlabel.into(),
            ylabel: ylabel.into(),
        };
        for p in points {
            curve.insert_point(p);
        }
        curve
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn xlabel(&self) -> &str {
        &self.xlabel
    }

    pub fn ylabel(&self) -> &str {
        &self.ylabel
    }

    /// Insert a point, overwriting any existing point with the same `x`.
    pub fn insert_point(&mut self, point: CurvePoint) {
        let idx = self.points.partition_point(|p| p.x.total_cmp(&point.x).is_lt());
        match self.points.get_mut(idx) {
            Some(existing) if existing.x == point.x => *existing = point,
            _ => self.points.insert(idx, point),
        }
    }

    /// Remove the point at `x`, if any.
    pub fn remove_point(&mut self, x: f64) -> Option<CurvePoint> {
        let idx = self.points.iter().position(|p| p.x == x)?;
        Some(self.points.remove(idx))
    }

    /// Evaluate the curve at `x`, returning a duty cycle in `[0, 100]`.
    ///
    /// - No points: [`DEFAULT_DUTY_PERCENT`]
    /// - At or below the first point: the first point's output
    /// - At or above the last point: the last point's output
    /// - Between two points: linear interpolation
    pub fn evaluate(&self, x: f64) -> f64 {
        let (Some(first), Some(last)) = (self.points.first(), self.points.last()) else {
            return DEFAULT_DUTY_PERCENT;
        };

        let y = if x.is_nan() || x <= first.x {
            first.y
        } else if x >= last.x {
            last.y
        } else {
            // first.x < x < last.x, so 1 <= hi < len
            let hi = self.points.partition_point(|p| p.x < x);
            let (p0, p1) = (self.points[hi - 1], self.points[hi]);
            if p1.x == x {
                p1.y
            } else if p1.x == p0.x {
                p0.y
            } else {
                p0.y + (p1.y - p0.y) * (x - p0.x) / (p1.x - p0.x)
            }
        };

        y.clamp(0.0, 100.0)
    }

    /// Like [`Curve::evaluate`] but reports the degenerate case instead of
    /// substituting the default.
    pub fn try_evaluate(&self, x: f64) -> Result<f64> {
        if self.points.is_empty() {
            return Err(ControlError::CurveDegenerate(self.name.clone()));
        }
        Ok(self.evaluate(x))
    }

    /// Validate an edited curve before it is stored.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Curve name must not be empty".to_string());
        }
        if self.points.is_empty() {
            return Err("Curve must have at least 1 point".to_string());
        }
        if let Some(i) = self
            .points
            .iter()
            .position(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(format!("Point {i} is not a finite number"));
        }
        Ok(())
    }
}

/// Human-readable input axis label for a stat key, e.g. `cpu_temp` ->
/// `Cpu Temp (°C)`.
pub fn axis_label(stat_key: &str) -> String {
    let unit = if stat_key.contains("temp") {
        "°C"
    } else if stat_key.contains("usage") {
        "%"
    } else {
        "W"
    };
    let title: Vec<String> = stat_key
        .split(['_', '/'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    format!("{} ({unit})", title.join(" "))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed collection of curves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurveRegistry {
    curves: BTreeMap<String, Curve>,
}

impl CurveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Curve> {
        self.curves.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.curves.contains_key(name)
    }

    /// Insert or replace a curve, returning the previous definition.
    pub fn upsert(&mut self, curve: Curve) -> Option<Curve> {
        self.curves.insert(curve.name.clone(), curve)
    }

    /// Remove a curve. Reference checks against fans are the caller's job.
    pub fn remove(&mut self, name: &str) -> Result<Curve> {
        self.curves
            .remove(name)
            .ok_or_else(|| ControlError::UnknownCurve(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.curves.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Curve> {
        self.curves.values()
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }
}

impl FromIterator<Curve> for CurveRegistry {
    fn from_iter<I: IntoIterator<Item = Curve>>(iter: I) -> Self {
        let mut reg = CurveRegistry::new();
        for c in iter {
            reg.upsert(c);
        }
        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(points: &[(f64, f64)]) -> Curve {
        Curve::new(
            "test",
            points.iter().map(|&(x, y)| CurvePoint::new(x, y)).collect(),
            "Cpu Temp (°C)",
            DEFAULT_YLABEL,
        )
    }

    #[test]
    fn test_midpoint_and_boundaries() {
        let c = curve(&[(30.0, 20.0), (70.0, 60.0)]);
        assert_eq!(c.evaluate(50.0), 40.0);
        assert_eq!(c.evaluate(30.0), 20.0);
        assert_eq!(c.evaluate(70.0), 60.0);
    }

    #[test]
    fn test_flat_extrapolation() {
        let c = curve(&[(30.0, 20.0), (50.0, 35.0), (70.0, 60.0)]);
        for x in [-40.0, 0.0, 29.9, 30.0] {
            assert_eq!(c.evaluate(x), 20.0);
        }
        for x in [70.0, 70.1, 150.0, f64::INFINITY] {
            assert_eq!(c.evaluate(x), 60.0);
        }
    }

    #[test]
    fn test_points_sorted_on_construction() {
        let c = curve(&[(70.0, 60.0), (30.0, 20.0), (50.0, 50.0)]);
        let xs: Vec<f64> = c.points().iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![30.0, 50.0, 70.0]);
        assert_eq!(c.evaluate(40.0), 35.0);
    }

    #[test]
    fn test_empty_curve_returns_default() {
        let c = curve(&[]);
        assert_eq!(c.evaluate(80.0), DEFAULT_DUTY_PERCENT);
        assert!(matches!(
            c.try_evaluate(80.0),
            Err(ControlError::CurveDegenerate(_))
        ));
    }

    #[test]
    fn test_single_point_is_flat() {
        let c = curve(&[(50.0, 42.0)]);
        assert_eq!(c.evaluate(0.0), 42.0);
        assert_eq!(c.evaluate(100.0), 42.0);
    }

    #[test]
    fn test_duplicate_x_later_point_wins() {
        let c = curve(&[(0.0, 0.0), (50.0, 30.0), (50.0, 70.0), (100.0, 100.0)]);
        assert_eq!(c.points().len(), 3);
        assert_eq!(c.evaluate(50.0), 70.0);
        assert_eq!(c.evaluate(25.0), 35.0);
    }

    #[test]
    fn test_insert_point_overwrites() {
        let mut c = curve(&[(0.0, 0.0), (100.0, 100.0)]);
        c.insert_point(CurvePoint::new(100.0, 80.0));
        c.insert_point(CurvePoint::new(50.0, 20.0));
        assert_eq!(c.points().len(), 3);
        assert_eq!(c.evaluate(100.0), 80.0);
        assert_eq!(c.remove_point(50.0), Some(CurvePoint::new(50.0, 20.0)));
        assert_eq!(c.evaluate(50.0), 40.0);
    }

    #[test]
    fn test_output_clamped_at_evaluation_not_storage() {
        let c = curve(&[(0.0, -20.0), (100.0, 140.0)]);
        assert_eq!(c.points()[0].y, -20.0);
        assert_eq!(c.evaluate(0.0), 0.0);
        assert_eq!(c.evaluate(100.0), 100.0);
        assert_eq!(c.evaluate(50.0), 60.0);
    }

    #[test]
    fn test_nan_input_uses_first_point() {
        let c = curve(&[(30.0, 20.0), (70.0, 60.0)]);
        assert_eq!(c.evaluate(f64::NAN), 20.0);
    }

    #[test]
    fn test_validation() {
        assert!(curve(&[]).validate().is_err());
        assert!(curve(&[(f64::NAN, 1.0)]).validate().is_err());
        assert!(curve(&[(10.0, 1.0)]).validate().is_ok());
    }

    #[test]
    fn test_point_serializes_as_pair() {
        let json = serde_json::to_string(&CurvePoint::new(30.0, 20.5)).unwrap();
        assert_eq!(json, "[30.0,20.5]");
    }

    #[test]
    fn test_axis_label() {
        assert_eq!(axis_label("cpu_temp"), "Cpu Temp (°C)");
        assert_eq!(axis_label("ram_usage"), "Ram Usage (%)");
        assert_eq!(axis_label("gpu_power"), "Gpu Power (W)");
    }

    #[test]
    fn test_registry_upsert_and_remove() {
        let mut reg = CurveRegistry::new();
        assert!(reg.upsert(curve(&[(0.0, 0.0)])).is_none());
        assert!(reg.upsert(curve(&[(0.0, 10.0)])).is_some());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("test").map(|c| c.evaluate(5.0)), Some(10.0));
        assert!(reg.remove("test").is_ok());
        assert!(matches!(
            reg.remove("test"),
            Err(ControlError::UnknownCurve(_))
        ));
    }
}
