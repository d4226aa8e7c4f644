//! Line-oriented operator console over any reader/writer pair.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use balancer_core::{OperatorHandle, PidGains, StageId};
use eyre::WrapErr;

use crate::command::ConsoleCommand;
use crate::render::render;

/// What the console did with one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing to print (blank line).
    Idle,
    Reply(String),
    Quit,
}

pub struct Console {
    handle: OperatorHandle,
}

impl Console {
    pub fn new(handle: OperatorHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &OperatorHandle {
        &self.handle
    }

    /// Parse and execute one line. Rejected updates come back as a reply,
    /// not an error; the loop keeps its previous values.
    pub fn execute_line(&self, line: &str) -> Outcome {
        match ConsoleCommand::parse_line(line) {
            Ok(None) => Outcome::Idle,
            Ok(Some(cmd)) => self.execute(&cmd),
            Err(e) => Outcome::Reply(e.render().to_string().trim_end().to_string()),
        }
    }

    pub fn execute(&self, cmd: &ConsoleCommand) -> Outcome {
        let h = &self.handle;
        let sent = match *cmd {
            ConsoleCommand::Gains { stage, kp, ki, kd } => h
                .set_gains(stage, PidGains::new(kp, ki, kd))
                .map(|()| format!("{stage} gains queued: kp {kp} ki {ki} kd {kd}")),
            ConsoleCommand::Setpoint { stage, value } => h
                .set_setpoint(stage, value)
                .map(|()| setpoint_reply(stage, value)),
            ConsoleCommand::Offset { degrees } => h
                .set_target_offset(degrees)
                .map(|()| format!("target offset queued: {degrees:+.2} deg")),
            ConsoleCommand::Move { movement } => h
                .movement(movement)
                .map(|()| format!("movement queued: {movement:?}")),
            ConsoleCommand::Show => return Outcome::Reply(render(&h.telemetry())),
            ConsoleCommand::Quit => return Outcome::Quit,
        };
        match sent {
            Ok(msg) => Outcome::Reply(msg),
            Err(e) => Outcome::Reply(format!("rejected: {e}")),
        }
    }

    /// Read lines until EOF, `quit`, or `shutdown` is set.
    pub fn run(
        &self,
        input: impl BufRead,
        mut output: impl Write,
        shutdown: &AtomicBool,
    ) -> eyre::Result<()> {
        tracing::info!("operator console ready");
        write!(output, "> ").wrap_err("console write")?;
        output.flush().wrap_err("console flush")?;
        for line in input.lines() {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let line = line.wrap_err("console read")?;
            match self.execute_line(&line) {
                Outcome::Idle => {}
                Outcome::Reply(text) => writeln!(output, "{text}").wrap_err("console write")?,
                Outcome::Quit => break,
            }
            write!(output, "> ").wrap_err("console write")?;
            output.flush().wrap_err("console flush")?;
        }
        tracing::info!("operator console closed");
        Ok(())
    }
}

fn setpoint_reply(stage: StageId, value: f32) -> String {
    match stage {
        StageId::Tilt => format!("tilt target queued: {value:+.2} deg"),
        other => format!("{other} setpoint queued: {value}"),
    }
}
