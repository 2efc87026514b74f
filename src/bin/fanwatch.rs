// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanwatch: command-line client for the fanwatch daemon.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use fanwatch::config;
use fanwatch::control::StatusReport;
use fanwatch::curve::{CurvePoint, axis_label};
use fanwatch::event::Severity;
use fanwatch::fan::FanMode;
use fanwatch::protocol::{self, Request, Response};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fanwatch", about = "Control the fanwatch daemon")]
struct Cli {
    /// Path to the daemon socket.
    #[arg(short, long, default_value = config::DEFAULT_SOCKET_PATH)]
    socket: String,

    /// Print raw JSON responses.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show fans, modes and the latest readings.
    Status,
    /// Return a fan to firmware control.
    Auto { fan_id: String },
    /// Drive a fan at a fixed duty cycle.
    Manual { fan_id: String, percent: f64 },
    /// Drive a fan from a curve.
    Graph {
        fan_id: String,
        curve: String,
        /// Stat feeding the curve, e.g. cpu_temp or hwmon3/temp1.
        stat: String,
    },
    /// Manage curves.
    #[command(subcommand)]
    Curve(CurveCommand),
    /// Manage notification rules.
    #[command(subcommand)]
    Rule(RuleCommand),
    /// Persist config, curves and rules.
    Save,
    /// Reload config, curves and rules from disk.
    Reload,
}

#[derive(Subcommand, Debug)]
enum CurveCommand {
    List,
    /// Create or replace a curve from `x:y` points.
    Set {
        name: String,
        /// Points as `x:y`, e.g. 30:20 70:60.
        #[arg(required = true, value_parser = parse_point)]
        points: Vec<CurvePoint>,
        /// Stat the curve is meant for; only used for the axis label.
        #[arg(long)]
        stat: Option<String>,
    },
    Delete {
        name: String,
        /// Switch fans using the curve to manual instead of refusing.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum RuleCommand {
    List,
    Add {
        /// Stat to watch.
        component: String,
        #[arg(allow_hyphen_values = true)]
        threshold: f64,
        message: String,
        #[arg(long, default_value = "warning")]
        severity: Severity,
    },
    Delete { id: u64 },
}

fn parse_point(s: &str) -> Result<CurvePoint, String> {
    let (x, y) = s
        .split_once(':')
        .ok_or_else(|| format!("expected x:y, got '{s}'"))?;
    let x: f64 = x.trim().parse().map_err(|e| format!("bad x in '{s}': {e}"))?;
    let y: f64 = y.trim().parse().map_err(|e| format!("bad y in '{s}': {e}"))?;
    Ok(CurvePoint::new(x, y))
}

impl Command {
    fn into_request(self) -> Request {
        match self {
            Command::Status => Request::GetStatus,
            Command::Auto { fan_id } => Request::SetAuto { fan_id },
            Command::Manual { fan_id, percent } => Request::SetManual { fan_id, percent },
            Command::Graph {
                fan_id,
                curve,
                stat,
            } => Request::SetGraph {
                fan_id,
                curve_name: curve,
                stat_key: stat,
            },
            Command::Curve(CurveCommand::List) => Request::ListCurves,
            Command::Curve(CurveCommand::Set { name, points, stat }) => Request::UpsertCurve {
                name,
                points,
                xlabel: stat.as_deref().map(axis_label),
                ylabel: None,
            },
            Command::Curve(CurveCommand::Delete { name, force }) => {
                Request::DeleteCurve { name, force }
            }
            Command::Rule(RuleCommand::List) => Request::ListRules,
            Command::Rule(RuleCommand::Add {
                component,
                threshold,
                message,
                severity,
            }) => Request::AddRule {
                message,
                severity,
                component,
                threshold,
            },
            Command::Rule(RuleCommand::Delete { id }) => Request::DeleteRule { id },
            Command::Save => Request::SaveConfig,
            Command::Reload => Request::ReloadConfig,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    fn connect(path: &str) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    fn send_request(&mut self, req: &Request) -> io::Result<Response> {
        let encoded = protocol::encode(req).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
        })?;
        self.stream.write_all(encoded.as_bytes())?;
        self.stream.flush()?;

        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        protocol::decode(&line).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let mut conn = Connection::connect(&cli.socket).with_context(|| {
        format!(
            "Could not connect to {}. Is fanwatch-daemon running?",
            cli.socket
        )
    })?;

    let response = conn.send_request(&cli.command.into_request())?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        if let Response::Error { .. } = response {
            std::process::exit(1);
        }
        return Ok(());
    }

    match response {
        Response::Status(report) => print_status(&report),
        Response::Curves { curves } => {
            if curves.is_empty() {
                println!("No curves defined");
            }
            for c in curves {
                let points: Vec<String> = c
                    .points()
                    .iter()
                    .map(|p| format!("{}:{}", p.x, p.y))
                    .collect();
                println!("{:<16} {:<20} {}", c.name(), c.xlabel(), points.join(" "));
            }
        }
        Response::Rules { rules } => {
            if rules.is_empty() {
                println!("No notification rules defined");
            }
            for r in rules {
                println!(
                    "{:>3}  {:<8} {} >= {}  {}",
                    r.id, r.severity, r.component, r.threshold, r.message
                );
            }
        }
        Response::RuleAdded { id } => println!("Added rule {id}"),
        Response::Ok { message } => println!("{message}"),
        Response::Error { message } => bail!("{message}"),
    }
    Ok(())
}

fn describe_mode(mode: Option<&FanMode>) -> String {
    match mode {
        None => "read-only".to_string(),
        Some(FanMode::Auto) => "auto".to_string(),
        Some(FanMode::Manual { percent }) => format!("manual {percent:.0}%"),
        Some(FanMode::Graph {
            curve_name,
            stat_key,
        }) => format!("graph {curve_name} <- {stat_key}"),
    }
}

fn print_status(report: &StatusReport) {
    for w in &report.warnings {
        println!("warning: {w}");
    }
    for fan in &report.fans {
        let ch = &fan.channel;
        let name = ch.label.as_deref().unwrap_or(&ch.id);
        let duty = ch
            .duty
            .map(|d| format!("{d:.0}%"))
            .unwrap_or_else(|| "-".to_string());
        let rpm = ch
            .rpm
            .map(|r| format!("{r} RPM"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:<20} {:>5} {:>10}  {}",
            ch.id,
            name,
            duty,
            rpm,
            describe_mode(fan.mode.as_ref())
        );
    }
    if !report.stats.is_empty() {
        println!();
    }
    for (key, value) in &report.stats {
        println!("{key:<20} {value:>8.1}");
    }
}
