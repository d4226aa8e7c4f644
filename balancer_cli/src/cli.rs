//! CLI argument definitions and shared statics.

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "balancer", version, about = "Two-wheeled balance controller")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/balancer.toml")]
    pub config: PathBuf,

    /// Log as JSON lines and print results as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); RUST_LOG wins
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Override `[backend] kind` from the config
    #[arg(long, value_enum, global = true)]
    pub backend: Option<BackendArg>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum BackendArg {
    /// Physics simulation of the robot
    Sim,
    /// Raspberry Pi IMU, motor drivers, encoders and current ADCs
    Hardware,
}

impl From<BackendArg> for balancer_config::BackendKind {
    fn from(b: BackendArg) -> Self {
        match b {
            BackendArg::Sim => balancer_config::BackendKind::Sim,
            BackendArg::Hardware => balancer_config::BackendKind::Hardware,
        }
    }
}

/// Memory locking mode for real-time operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RtLock {
    /// Do not lock memory
    None,
    /// Lock currently resident pages
    Current,
    /// Lock current and future pages
    All,
}

impl RtLock {
    #[inline]
    pub fn os_default() -> Self {
        if cfg!(target_os = "linux") {
            RtLock::Current
        } else {
            RtLock::None
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct RtArgs {
    /// Enable real-time mode for the control thread (SCHED_FIFO, affinity, mlockall)
    #[arg(
        long,
        action = ArgAction::SetTrue,
        long_help = "Enable real-time mode on supported OSes.\n\nLinux: locks memory, raises the control thread to SCHED_FIFO and pins it to one CPU. Each step is best effort: a failure is logged as a warning and the loop runs anyway. SCHED_FIFO needs CAP_SYS_NICE (or root); memory locking needs CAP_IPC_LOCK or a large enough 'ulimit -l'.\n\nOther OSes: only memory locking is attempted."
    )]
    pub rt: bool,
    /// SCHED_FIFO priority (Linux; clamped to the system range, default max)
    #[arg(long, value_name = "PRIO")]
    pub rt_prio: Option<i32>,
    /// Memory locking mode for --rt: none, current, or all
    #[arg(long, value_enum, value_name = "MODE")]
    pub rt_lock: Option<RtLock>,
    /// CPU index for the control thread (Linux; default 0)
    #[arg(long, value_name = "CPU")]
    pub rt_cpu: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Stop after this many milliseconds (default: until Ctrl-C)
    #[arg(long, value_name = "MS")]
    pub duration_ms: Option<u64>,
    /// Print tick timing statistics on exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub stats: bool,
    /// Read operator commands from stdin while running
    #[arg(long, action = ArgAction::SetTrue)]
    pub console: bool,
    #[command(flatten)]
    pub rt: RtArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Balance until Ctrl-C or --duration-ms
    Run(RunArgs),
    /// Load and validate the config, then print the effective loop layout
    CheckConfig,
    /// Open the backend, read every sensor once and stop the motors
    SelfCheck,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "balancer",
            "--backend",
            "sim",
            "run",
            "--duration-ms",
            "250",
            "--rt",
            "--rt-lock",
            "all",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(BackendArg::Sim));
        let Commands::Run(args) = cli.cmd else {
            panic!("expected run");
        };
        assert_eq!(args.duration_ms, Some(250));
        assert!(args.rt.rt);
        assert_eq!(args.rt.rt_lock, Some(RtLock::All));
        assert!(!args.console);
    }
}
