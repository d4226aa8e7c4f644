#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss
)]
//! Operator console for the balance controller.
//!
//! Text commands become `OperatorHandle` calls; `show` renders the latest
//! telemetry snapshot. Nothing here touches the control thread directly.

pub mod command;
pub mod console;
pub mod render;

pub use command::ConsoleCommand;
pub use console::{Console, Outcome};
pub use render::{render, status_line};
