// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fanwatch-daemon: system service that owns hwmon writes, runs the control
//! loop, raises alerts, and accepts commands over a Unix domain socket.

use clap::Parser;
use fanwatch::config::{self, Config};
use fanwatch::control::{ControlLoop, SharedState, Store};
use fanwatch::curve::{Curve, DEFAULT_YLABEL};
use fanwatch::event::{EventSink, LogSink, MultiSink, NotifySendSink, SessionTarget};
use fanwatch::fan::FanMode;
use fanwatch::hwmon::{self, PwmChannel};
use fanwatch::notify::NotificationEngine;
use fanwatch::protocol::{self, Request, Response};
use fanwatch::stats::SystemStatSource;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fanwatch-daemon", about = "Sensor monitor and fan control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Override the socket path.
    #[arg(short, long)]
    socket: Option<String>,

    /// Override the control loop period in milliseconds.
    #[arg(short, long)]
    interval: Option<u64>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));
    let cfg = config::load_config(&config_path).unwrap_or_else(|e| {
        log::warn!("Could not load config: {e}, using defaults");
        Config::default()
    });

    if !nix::unistd::Uid::effective().is_root() {
        log::warn!("Not running as root; PWM channels will likely be read-only");
    }

    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(|| cfg.daemon.socket_path.clone());
    let poll_interval = cli.interval.unwrap_or(cfg.daemon.poll_interval_ms).max(100);

    // Discover hardware
    let channels: Vec<Arc<dyn PwmChannel>> = hwmon::discover_channels(&cfg.daemon.hwmon_root)
        .unwrap_or_else(|e| {
            log::error!("Failed to discover PWM channels: {e}");
            Vec::new()
        })
        .into_iter()
        .map(|c| Arc::new(c) as Arc<dyn PwmChannel>)
        .collect();
    log::info!("Discovered {} PWM channel(s)", channels.len());

    let curves = config::load_curves(&cfg.daemon.curves_path);
    let rules = config::load_rules(&cfg.daemon.rules_path);

    let io_timeout = Duration::from_millis(cfg.daemon.io_timeout_ms);
    let state = Arc::new(
        SharedState::new(channels, curves, rules)
            .with_store(Store {
                config_path: config_path.clone(),
                daemon: cfg.daemon.clone(),
            })
            .with_io_timeout(io_timeout),
    );
    state.apply_assignments(&cfg.fans).await;

    let mut sinks = MultiSink::new().with(LogSink);
    if cfg.daemon.desktop_notifications {
        let session = SessionTarget::detect();
        if let Some(target) = &session {
            log::info!("Desktop notifications go to the session of uid {}", target.uid);
        }
        sinks = sinks.with(NotifySendSink::new("fanwatch").with_session(session));
    }
    let sink: Arc<dyn EventSink> = Arc::new(sinks);
    let stats = Arc::new(SystemStatSource::new(&cfg.daemon.hwmon_root));

    let control = ControlLoop::new(
        state.clone(),
        stats,
        sink,
        NotificationEngine::new(cfg.daemon.hysteresis_fraction),
        io_timeout,
    );

    // Clean up old socket file
    let _ = std::fs::remove_file(&socket_path);
    if let Some(parent) = Path::new(&socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;

    // Make socket accessible to non-root users
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o666);
        std::fs::set_permissions(&socket_path, perms)?;
    }

    log::info!("Listening on {socket_path}");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Signal handler
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        log::info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    // Control loop
    let loop_shutdown = shutdown_rx.clone();
    let control_task = tokio::spawn(async move {
        control
            .run(Duration::from_millis(poll_interval), loop_shutdown)
            .await;
    });

    // Accept client connections
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tokio::spawn(handle_client(stream, state.clone()));
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                log::info!("Daemon shutting down");
                break;
            }
        }
    }

    // Let the in-flight tick finish before touching the hardware again.
    if let Err(e) = control_task.await {
        log::error!("Control loop task failed: {e}");
    }
    if cfg.daemon.restore_on_exit {
        state.restore_all().await;
    }

    // Cleanup socket
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

// ---------------------------------------------------------------------------
// Client connection handler
// ---------------------------------------------------------------------------

async fn handle_client(stream: UnixStream, state: Arc<SharedState>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match protocol::decode::<Request>(&line) {
            Ok(req) => process_request(req, &state).await,
            Err(e) => Response::error(format!("Invalid request: {e}")),
        };

        let encoded = match protocol::encode(&response) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Failed to encode response: {e}");
                continue;
            }
        };

        if writer.write_all(encoded.as_bytes()).await.is_err() {
            break; // Client disconnected
        }
    }
}

async fn process_request(req: Request, state: &SharedState) -> Response {
    match req {
        Request::GetStatus => Response::Status(state.status().await),

        Request::SetAuto { fan_id } => match state.set_mode(&fan_id, FanMode::Auto).await {
            Ok(()) => Response::ok(format!("{fan_id} returned to automatic control")),
            Err(e) => Response::error(e),
        },

        Request::SetManual { fan_id, percent } => {
            match state.set_mode(&fan_id, FanMode::Manual { percent }).await {
                Ok(()) => Response::ok(format!("Set {fan_id} to manual {percent:.1}%")),
                Err(e) => Response::error(e),
            }
        }

        Request::SetGraph {
            fan_id,
            curve_name,
            stat_key,
        } => {
            let mode = FanMode::Graph {
                curve_name: curve_name.clone(),
                stat_key: stat_key.clone(),
            };
            match state.set_mode(&fan_id, mode).await {
                Ok(()) => Response::ok(format!(
                    "Assigned curve '{curve_name}' on {stat_key} to {fan_id}"
                )),
                Err(e) => Response::error(e),
            }
        }

        Request::ListCurves => Response::Curves {
            curves: state.list_curves().await,
        },

        Request::UpsertCurve {
            name,
            points,
            xlabel,
            ylabel,
        } => {
            let curve = Curve::new(
                name.clone(),
                points,
                xlabel.unwrap_or_default(),
                ylabel.unwrap_or_else(|| DEFAULT_YLABEL.to_string()),
            );
            match state.upsert_curve(curve).await {
                Ok(()) => Response::ok(format!("Curve '{name}' saved")),
                Err(e) => Response::error(e),
            }
        }

        Request::DeleteCurve { name, force } => match state.delete_curve(&name, force).await {
            Ok(moved) if moved.is_empty() => Response::ok(format!("Deleted curve '{name}'")),
            Ok(moved) => Response::ok(format!(
                "Deleted curve '{name}'; {} switched to manual",
                moved.join(", ")
            )),
            Err(e) => Response::error(e),
        },

        Request::ListRules => Response::Rules {
            rules: state.list_rules().await,
        },

        Request::AddRule {
            message,
            severity,
            component,
            threshold,
        } => match state.add_rule(message, severity, component, threshold).await {
            Ok(id) => Response::RuleAdded { id },
            Err(e) => Response::error(e),
        },

        Request::DeleteRule { id } => match state.delete_rule(id).await {
            Ok(()) => Response::ok(format!("Deleted rule {id}")),
            Err(e) => Response::error(e),
        },

        Request::SaveConfig => match state.save().await {
            Ok(()) => Response::ok("Configuration saved"),
            Err(e) => Response::error(format!("Failed to save: {e}")),
        },

        Request::ReloadConfig => match state.reload().await {
            Ok(()) => Response::ok("Configuration reloaded"),
            Err(e) => Response::error(format!("Failed to reload: {e}")),
        },
    }
}
