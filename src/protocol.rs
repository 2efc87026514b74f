// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Client-daemon protocol over Unix domain sockets.
//!
//! Messages are newline-delimited JSON. The client sends a [`Request`]
//! and the daemon replies with a [`Response`].

use crate::control::StatusReport;
use crate::curve::{Curve, CurvePoint};
use crate::event::Severity;
use crate::notify::NotificationRule;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Requests (client -> daemon)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Request current status of all fans and the latest readings.
    #[serde(rename = "get_status")]
    GetStatus,

    /// Hand a fan back to firmware control.
    #[serde(rename = "set_auto")]
    SetAuto { fan_id: String },

    /// Drive a fan at a fixed duty cycle.
    #[serde(rename = "set_manual")]
    SetManual { fan_id: String, percent: f64 },

    /// Drive a fan from a curve evaluated against a stat.
    #[serde(rename = "set_graph")]
    SetGraph {
        fan_id: String,
        curve_name: String,
        stat_key: String,
    },

    #[serde(rename = "list_curves")]
    ListCurves,

    /// Create or update a curve.
    #[serde(rename = "upsert_curve")]
    UpsertCurve {
        name: String,
        points: Vec<CurvePoint>,
        #[serde(default)]
        xlabel: Option<String>,
        #[serde(default)]
        ylabel: Option<String>,
    },

    /// Delete a curve. With `force`, fans using it drop to Manual.
    #[serde(rename = "delete_curve")]
    DeleteCurve {
        name: String,
        #[serde(default)]
        force: bool,
    },

    #[serde(rename = "list_rules")]
    ListRules,

    #[serde(rename = "add_rule")]
    AddRule {
        message: String,
        severity: Severity,
        component: String,
        threshold: f64,
    },

    #[serde(rename = "delete_rule")]
    DeleteRule { id: u64 },

    /// Save config, curves and rules to disk.
    #[serde(rename = "save_config")]
    SaveConfig,

    /// Reload config, curves and rules from disk.
    #[serde(rename = "reload_config")]
    ReloadConfig,
}

// ---------------------------------------------------------------------------
// Responses (daemon -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    #[serde(rename = "status")]
    Status(StatusReport),

    #[serde(rename = "curves")]
    Curves { curves: Vec<Curve> },

    #[serde(rename = "rules")]
    Rules { rules: Vec<NotificationRule> },

    #[serde(rename = "rule_added")]
    RuleAdded { id: u64 },

    /// Operation succeeded.
    #[serde(rename = "ok")]
    Ok { message: String },

    /// Operation failed.
    #[serde(rename = "error")]
    Error { message: String },
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response::Ok {
            message: message.into(),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Encode a message as a newline-delimited JSON string.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut s = serde_json::to_string(msg)?;
    s.push('\n');
    Ok(s)
}

/// Decode a message from a JSON string (newline-trimmed).
pub fn decode<'a, T: Deserialize<'a>>(s: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(s.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req: Request =
            decode(r#"{"type":"set_manual","fan_id":"hwmon3/pwm1","percent":45.5}"#).unwrap();
        assert_eq!(
            req,
            Request::SetManual {
                fan_id: "hwmon3/pwm1".into(),
                percent: 45.5
            }
        );

        let line = encode(&Request::GetStatus).unwrap();
        assert_eq!(line, "{\"type\":\"get_status\"}\n");
    }

    #[test]
    fn test_optional_fields_default() {
        let req: Request = decode(r#"{"type":"delete_curve","name":"cpu"}"#).unwrap();
        assert_eq!(
            req,
            Request::DeleteCurve {
                name: "cpu".into(),
                force: false
            }
        );

        let req: Request =
            decode(r#"{"type":"upsert_curve","name":"cpu","points":[[30,20],[70,60]]}"#).unwrap();
        let Request::UpsertCurve {
            points,
            xlabel,
            ylabel,
            ..
        } = req
        else {
            panic!("wrong variant");
        };
        assert_eq!(points.len(), 2);
        assert!(xlabel.is_none() && ylabel.is_none());
    }

    #[test]
    fn test_status_response_is_tagged() {
        let json = serde_json::to_value(Response::Status(StatusReport::default())).unwrap();
        assert_eq!(json["type"], "status");
        assert!(json["fans"].as_array().is_some_and(|f| f.is_empty()));

        let back: Response = decode(&encode(&Response::RuleAdded { id: 3 }).unwrap()).unwrap();
        assert_eq!(back, Response::RuleAdded { id: 3 });
    }

    #[test]
    fn test_unknown_request_rejected() {
        assert!(decode::<Request>(r#"{"type":"subscribe"}"#).is_err());
        assert!(decode::<Request>("not json").is_err());
    }
}
