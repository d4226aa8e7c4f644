mod cli;
mod error_fmt;
mod rt;
mod run;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use balancer_config::{BackendKind, Config};
use balancer_core::{BalanceCfg, BalanceError, SafetyState, StageId};
use clap::Parser;
use eyre::WrapErr;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::run::RunSummary;

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    let cfg = load_config(&cli.config);
    if let Err(e) = init_tracing(&cli, cfg.as_ref().ok()) {
        eprintln!("Warning: logging setup failed: {e}");
    }

    let result = cfg.and_then(|cfg| dispatch(&cli, &cfg));
    if let Err(err) = result {
        tracing::error!(error = %err, "command failed");
        if *JSON_MODE.get().unwrap_or(&false) {
            println!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}

fn config_error(msg: String) -> eyre::Report {
    eyre::Report::new(BalanceError::Config(msg))
}

/// Read, parse and validate the config file.
fn load_config(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("cannot read {}: {e}", path.display())))?;
    let cfg = balancer_config::load_toml(&text)
        .map_err(|e| config_error(format!("{}: {}", path.display(), e.message())))?;
    cfg.validate().map_err(|e| config_error(e.to_string()))?;
    Ok(cfg)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console layer on stderr (pretty or JSON) plus an optional JSON file
/// layer from `[logging]`. Level: RUST_LOG, then --log-level, then
/// `logging.level`, then `info`.
fn init_tracing(cli: &Cli, cfg: Option<&Config>) -> eyre::Result<()> {
    let logging = cfg.map(|c| &c.logging);
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.and_then(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .wrap_err_with(|| format!("invalid log level '{level}'"))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    if cli.json {
        layers.push(console.json().boxed());
    } else {
        layers.push(console.boxed());
    }

    if let Some(file) = logging.and_then(|l| l.file.as_deref()) {
        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("logging.file '{file}' has no file name"))?;
        let rotation = logging.and_then(|l| l.rotation.as_deref()).unwrap_or("never");
        let appender = match rotation {
            "hourly" => tracing_appender::rolling::hourly(dir, name),
            "daily" => tracing_appender::rolling::daily(dir, name),
            "never" => tracing_appender::rolling::never(dir, name),
            other => eyre::bail!("logging.rotation must be never, hourly or daily, got '{other}'"),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .wrap_err("installing tracing subscriber")
}

fn backend_kind(cli: &Cli, cfg: &Config) -> BackendKind {
    cli.backend.map_or(cfg.backend.kind, Into::into)
}

fn dispatch(cli: &Cli, cfg: &Config) -> eyre::Result<()> {
    match &cli.cmd {
        Commands::Run(args) => {
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
                tracing::warn!(error = %e, "failed to install Ctrl-C handler");
            }
            let summary = run::run_balance(cfg, backend_kind(cli, cfg), args, shutdown)?;
            if args.stats {
                run::print_stats(&summary);
            }
            report_run(cli.json, &summary);
            Ok(())
        }
        Commands::CheckConfig => {
            let runtime = BalanceCfg::try_from(cfg)?;
            report_config(cli.json, &runtime, backend_kind(cli, cfg));
            Ok(())
        }
        Commands::SelfCheck => {
            let r = run::self_check(cfg, backend_kind(cli, cfg))?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "self_check": "ok",
                        "tilt_deg": r.tilt,
                        "pitch_rate_dps": r.pitch_rate,
                        "yaw_rate_dps": r.yaw_rate,
                        "positions": r.positions,
                        "currents": r.currents,
                    })
                );
            } else {
                println!(
                    "self-check OK: tilt {:+.2} deg, pitch rate {:+.2} deg/s, yaw rate {:+.2} deg/s, positions {:?}, currents {:?}",
                    r.tilt, r.pitch_rate, r.yaw_rate, r.positions, r.currents
                );
            }
            Ok(())
        }
    }
}

fn state_name(s: SafetyState) -> &'static str {
    match s {
        SafetyState::Running => "running",
        SafetyState::Tripped => "tripped",
    }
}

fn report_run(json: bool, s: &RunSummary) {
    let st = &s.stats;
    if json {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        println!(
            "{}",
            serde_json::json!({
                "timestamp": timestamp,
                "duration_ms": s.duration.as_millis() as u64,
                "ticks": st.ticks,
                "period_us": s.period.as_micros() as u64,
                "avg_tick_us": st.avg().as_micros() as u64,
                "max_tick_us": st.max.as_micros() as u64,
                "overruns": st.overruns,
                "sustained_overrun": st.sustained,
                "trips": s.trips,
                "final_state": state_name(s.state),
            })
        );
    } else {
        println!(
            "run complete: {} ticks in {:.1} s, {} overruns, {} safety trips, final state {}",
            st.ticks,
            s.duration.as_secs_f32(),
            st.overruns,
            s.trips,
            state_name(s.state)
        );
    }
}

fn report_config(json: bool, c: &BalanceCfg, kind: BackendKind) {
    let backend = match kind {
        BackendKind::Sim => "sim",
        BackendKind::Hardware => "hardware",
    };
    let stages: Vec<_> = StageId::ALL
        .into_iter()
        .map(|id| {
            let s = c.stages.get(id);
            (id, s.enabled, s.divider)
        })
        .collect();
    if json {
        let stages: serde_json::Map<_, _> = stages
            .iter()
            .map(|(id, enabled, divider)| {
                (
                    id.name().to_string(),
                    serde_json::json!({ "enabled": enabled, "divider": divider }),
                )
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "config": "ok",
                "rate_hz": c.loop_.rate_hz,
                "backend": backend,
                "stages": stages,
            })
        );
        return;
    }
    println!(
        "config OK: {} Hz ({} us period), backend {backend}",
        c.loop_.rate_hz,
        balancer_core::util::period_us(c.loop_.rate_hz)
    );
    for (id, enabled, divider) in stages {
        println!(
            "  {:<9} {:<8} every {divider} tick(s)",
            id.name(),
            if enabled { "enabled" } else { "disabled" }
        );
    }
}
