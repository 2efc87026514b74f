// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanwatch: hardware sensor monitor and PWM fan controller.
//!
//! A single control loop samples system stats, drives each writable hwmon
//! PWM channel in Auto, Manual or Graph (curve) mode, and raises
//! hysteresis-latched threshold alerts. Fans that fail a write are handed
//! back to firmware control.

pub mod config;
pub mod control;
pub mod curve;
pub mod error;
pub mod event;
pub mod fan;
pub mod hwmon;
pub mod notify;
pub mod protocol;
pub mod stats;
