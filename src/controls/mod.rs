//! Switch definitions and the command runner behind them.

pub mod executor;
pub mod switch;

pub use executor::{Executor, ExecutorError, QueryReport, ShellExecutor};
pub use switch::SwitchConfig;
