//! Console command grammar.
//!
//! One line is one command. The line is split on whitespace and handed to a
//! clap parser, so `help` and `<command> --help` work as in any clap CLI.

use balancer_core::{Movement, StageId};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "console",
    no_binary_name = true,
    disable_version_flag = true,
    help_template = "{subcommands}"
)]
struct Line {
    #[command(subcommand)]
    cmd: ConsoleCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Replace the three gains of one stage
    Gains {
        /// velocity | tilt | torque | yaw
        stage: StageId,
        kp: f32,
        ki: f32,
        kd: f32,
    },
    /// Set a stage setpoint (tilt: absolute target angle in degrees)
    Setpoint {
        stage: StageId,
        #[arg(allow_negative_numbers = true)]
        value: f32,
    },
    /// Offset the tilt target from neutral, in degrees
    Offset {
        #[arg(allow_negative_numbers = true)]
        degrees: f32,
    },
    /// Movement preset: forward | backward | rotate_left | rotate_right | stop
    #[command(alias = "m")]
    Move { movement: Movement },
    /// Print the latest telemetry snapshot
    #[command(alias = "s")]
    Show,
    /// Leave the console; the control loop keeps running
    #[command(alias = "exit")]
    Quit,
}

impl ConsoleCommand {
    /// Parse one console line. `Ok(None)` for a blank line or a comment.
    ///
    /// The error carries clap's rendered message (usage or help text).
    pub fn parse_line(line: &str) -> Result<Option<Self>, clap::Error> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        Line::try_parse_from(line.split_whitespace()).map(|l| Some(l.cmd))
    }
}
