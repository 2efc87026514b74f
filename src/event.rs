// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Events raised by the control loop and the sinks that deliver them.

use crate::error::ControlError;
use nix::unistd::{Uid, User};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

/// Parent of per-user runtime directories.
pub const RUN_USER_DIR: &str = "/run/user";

/// Lowest uid treated as a desktop login when scanning for a session.
const FIRST_LOGIN_UID: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "Info")]
    Info,
    #[serde(alias = "Warning")]
    Warning,
    #[serde(alias = "Error")]
    Error,
    #[serde(alias = "Critical")]
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

impl Severity {
    fn log_level(self) -> log::Level {
        match self {
            Severity::Info => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error | Severity::Critical => log::Level::Error,
        }
    }
}

/// A threshold crossing. Emitted once per excursion above the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: u64,
    pub severity: Severity,
    pub message: String,
    pub stat_key: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Alert(Alert),
    /// A fan lost software control and was handed back to firmware.
    FanFallback { fan_id: String, reason: String },
}

impl Event {
    pub fn fan_fallback(fan_id: &str, reason: &ControlError) -> Self {
        Event::FanFallback {
            fan_id: fan_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Event::Alert(a) => a.severity,
            Event::FanFallback { .. } => Severity::Warning,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Event::Alert(a) => format!(
                "{} ({} = {:.1}, threshold {})",
                a.message, a.stat_key, a.value, a.threshold
            ),
            Event::FanFallback { fan_id, reason } => {
                format!("{fan_id} returned to automatic control: {reason}")
            }
        }
    }
}

/// Delivers events somewhere. Implementations must not block for long; they
/// run on the control loop.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &Event);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn deliver(&self, event: &Event) {
        log::log!(event.severity().log_level(), "{}", event.summary());
    }
}

// ---------------------------------------------------------------------------
// Desktop notifications
// ---------------------------------------------------------------------------

/// The desktop session that should see notifications when the daemon runs
/// as root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub uid: u32,
    pub gid: u32,
    /// `XDG_RUNTIME_DIR` of the session; holds the `bus` socket.
    pub runtime_dir: PathBuf,
}

impl SessionTarget {
    /// Find the session of the user who started the daemon through sudo, or
    /// else the first logged-in desktop user. `None` when not running as
    /// root, since the inherited environment already points at a session.
    pub fn detect() -> Option<Self> {
        if !Uid::effective().is_root() {
            return None;
        }
        Self::resolve(Path::new(RUN_USER_DIR), |key| std::env::var(key).ok())
    }

    fn resolve(run_root: &Path, env: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let uid = env("SUDO_UID")
            .and_then(|v| v.parse().ok())
            .or_else(|| {
                let name = env("SUDO_USER")?;
                let user = User::from_name(&name).ok().flatten()?;
                Some(user.uid.as_raw())
            })
            .or_else(|| first_login_uid(run_root))?;

        let gid = env("SUDO_GID")
            .and_then(|v| v.parse().ok())
            .or_else(|| {
                let user = User::from_uid(Uid::from_raw(uid)).ok().flatten()?;
                Some(user.gid.as_raw())
            })
            .unwrap_or(uid);

        let runtime_dir = run_root.join(uid.to_string());
        if !runtime_dir.join("bus").exists() {
            log::debug!("No session bus for uid {uid} under {}", run_root.display());
            return None;
        }
        Some(Self {
            uid,
            gid,
            runtime_dir,
        })
    }

    pub fn bus_address(&self) -> String {
        format!("unix:path={}", self.runtime_dir.join("bus").display())
    }
}

/// Lowest uid at or above [`FIRST_LOGIN_UID`] with a session bus.
fn first_login_uid(run_root: &Path) -> Option<u32> {
    fs::read_dir(run_root)
        .ok()?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&uid| uid >= FIRST_LOGIN_UID)
        .filter(|uid| run_root.join(uid.to_string()).join("bus").exists())
        .min()
}

/// Spawn a command and wait for it on a detached thread, so the child is
/// reaped without blocking the caller.
fn spawn_reaped(cmd: &mut Command) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    let mut child = cmd.spawn()?;
    thread::Builder::new()
        .name("notify-reaper".to_string())
        .spawn(move || child.wait())
}

/// Spawns `notify-send` for desktop notifications.
#[derive(Debug, Clone)]
pub struct NotifySendSink {
    app_name: String,
    session: Option<SessionTarget>,
}

impl NotifySendSink {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            session: None,
        }
    }

    /// Deliver into another user's session, running `notify-send` as them.
    pub fn with_session(mut self, session: Option<SessionTarget>) -> Self {
        self.session = session;
        self
    }

    fn args(&self, event: &Event) -> Vec<String> {
        let severity = event.severity();
        let (urgency, icon, timeout_ms) = match severity {
            Severity::Info => ("normal", "dialog-information", 5000),
            Severity::Warning => ("normal", "dialog-warning", 8000),
            Severity::Error => ("critical", "dialog-error", 10000),
            Severity::Critical => ("critical", "dialog-error", 0),
        };
        let title = match severity {
            Severity::Critical => format!("⚠️ {}", self.app_name),
            _ => self.app_name.clone(),
        };
        let body = match event {
            Event::Alert(a) => a.message.clone(),
            other => other.summary(),
        };
        vec![
            format!("--app-name={}", self.app_name),
            format!("--urgency={urgency}"),
            format!("--icon={icon}"),
            format!("--expire-time={timeout_ms}"),
            title,
            body,
        ]
    }

    fn command(&self, event: &Event) -> Command {
        let mut cmd = Command::new("notify-send");
        cmd.args(self.args(event))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(session) = &self.session {
            cmd.env("DBUS_SESSION_BUS_ADDRESS", session.bus_address())
                .env("XDG_RUNTIME_DIR", &session.runtime_dir)
                .uid(session.uid)
                .gid(session.gid);
        }
        cmd
    }
}

impl EventSink for NotifySendSink {
    fn deliver(&self, event: &Event) {
        if let Err(e) = spawn_reaped(&mut self.command(event)) {
            log::warn!("notify-send failed: {e}");
        }
    }
}

/// Fans an event out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for MultiSink {
    fn deliver(&self, event: &Event) {
        for sink in &self.sinks {
            sink.deliver(event);
        }
    }
}

/// Keeps delivered events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything delivered so far.
    pub fn drain(&self) -> Vec<Event> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }
}

impl EventSink for MemorySink {
    fn deliver(&self, event: &Event) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event.clone());
    }
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn deliver(&self, event: &Event) {
        (**self).deliver(event);
    }
}
