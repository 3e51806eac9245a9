use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use swarm_fc::diagnostics::{diagnose, DiagnosticsReport};
use swarm_fc::{LinkConfig, Session};
use swarm_mission::manual::{self, ManualStep};
use swarm_mission::{doctor as mission_doctor, FlightController, ManualConfig, MissionConfig, MissionOutcome};

#[derive(Debug, Parser)]
#[command(name = "swarm", version, about = "FireSwarm - vehicle command & telemetry controller")]
struct Cli {
    #[arg(long)]
    config: String,

    /// Overrides link.endpoint, e.g. udp:0.0.0.0:14550
    #[arg(long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Connect, watch the traffic for a while and print what arrived.
    Diagnose {
        #[arg(long, default_value_t = 5)]
        window_s: u64,
        /// Also try to arm (and disarm again right away).
        #[arg(long)]
        arm_probe: bool,
    },
    /// Arm, take off, cruise, land, disarm.
    Fly {
        #[arg(long)]
        alt: Option<f32>,
    },
    /// Arm and fly a stick script ([manual] section or a preset).
    Manual {
        #[arg(long)]
        preset: Option<String>,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    link: LinkConfig,
    #[serde(default)]
    mission: MissionConfig,
    manual: Option<ManualConfig>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = load_config(&cli.config)?;
    if let Some(endpoint) = cli.endpoint {
        cfg.link.endpoint = endpoint;
    }

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Diagnose { window_s, arm_probe } => {
            diagnose_cmd(&cfg, Duration::from_secs(window_s), arm_probe).await?
        }
        Command::Fly { alt } => fly(&cfg, alt).await?,
        Command::Manual { preset } => manual_cmd(&cfg, preset).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    let endpoint = mission_doctor::check_link(&cfg.link)?;
    info!("doctor: endpoint {} ({})", endpoint, endpoint.mavlink_url());
    mission_doctor::check_mission(&cfg.mission)?;
    if let Some(m) = &cfg.manual {
        mission_doctor::check_script(&m.script()?)?;
    }
    info!("doctor: OK");
    Ok(())
}

async fn diagnose_cmd(cfg: &Config, window: Duration, arm_probe: bool) -> Result<()> {
    mission_doctor::check_link(&cfg.link)?;
    let session = Session::start(&cfg.link)
        .await
        .with_context(|| format!("connect {}", cfg.link.endpoint))?;

    let report = tokio::select! {
        r = diagnose(&session, window, arm_probe) => Some(r),
        _ = tokio::signal::ctrl_c() => None,
    };
    session.shutdown().await;

    let report = report.context("interrupted")?;
    print_report(&report);
    anyhow::ensure!(report.traffic.heartbeats > 0, "no vehicle heartbeat during the window");
    Ok(())
}

fn print_report(r: &DiagnosticsReport) {
    println!("target: sys={} comp={}", r.target.0, r.target.1);
    println!("link: {:?}", r.status);
    println!(
        "window {:?}: heartbeat={} attitude={} position={} rc={} battery={}",
        r.window, r.traffic.heartbeats, r.traffic.attitude, r.traffic.position, r.traffic.rc_channels, r.traffic.battery
    );
    if let Some(hb) = &r.last_heartbeat {
        println!(
            "last heartbeat: armed={} status={} custom_mode={} age={:?}",
            hb.is_armed(),
            hb.system_status,
            hb.custom_mode,
            hb.age()
        );
    }
    for sample in [&r.last_attitude, &r.last_position, &r.last_rc, &r.last_battery].into_iter().flatten() {
        println!("last {:?}: {:?}", sample.kind(), sample);
    }
    if !r.attitude_flowing() {
        println!("note: no ATTITUDE traffic; is the simulator running?");
    }
    if let Some(probe) = &r.arm_probe {
        println!("arm probe: {:?}", probe);
    }
}

async fn connect(cfg: &Config) -> Result<FlightController> {
    mission_doctor::check_link(&cfg.link)?;
    mission_doctor::check_mission(&cfg.mission)?;
    FlightController::start(&cfg.link, cfg.mission.clone())
        .await
        .with_context(|| format!("connect {}", cfg.link.endpoint))
}

async fn fly(cfg: &Config, alt: Option<f32>) -> Result<()> {
    let alt = alt.unwrap_or_else(|| cfg.mission.altitude_m());
    let mut ctl = connect(cfg).await?;

    let finished = tokio::select! {
        out = ctl.run_standard_mission(alt) => Some(out),
        _ = tokio::signal::ctrl_c() => None,
    };
    report(close(ctl, finished).await)
}

async fn manual_cmd(cfg: &Config, preset: Option<String>) -> Result<()> {
    let script: Vec<ManualStep> = match preset {
        Some(name) => manual::preset(&name)
            .with_context(|| format!("unknown preset {:?} (have {:?})", name, manual::PRESETS))?,
        None => cfg.manual.clone().unwrap_or_default().script()?,
    };
    mission_doctor::check_script(&script)?;
    let mut ctl = connect(cfg).await?;

    let finished = tokio::select! {
        out = ctl.run_manual_sequence(&script) => Some(out),
        _ = tokio::signal::ctrl_c() => None,
    };
    report(close(ctl, finished).await)
}

async fn close(ctl: FlightController, finished: Option<MissionOutcome>) -> MissionOutcome {
    match finished {
        Some(outcome) => {
            ctl.shutdown().await;
            outcome
        }
        None => {
            warn!("interrupted, releasing control");
            ctl.abort().await
        }
    }
}

fn report(outcome: MissionOutcome) -> Result<()> {
    println!("outcome: {}", outcome);
    for t in &outcome.transitions {
        println!("  {} {:?} -> {:?}", t.at_unix_ms, t.from, t.to);
    }
    if !outcome.succeeded() {
        anyhow::bail!("mission ended in {:?}", outcome.phase);
    }
    Ok(())
}
