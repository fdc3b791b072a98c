//! Switch-synchronization engine
//!
//! Tracks what the broker has been told about every switch and keeps it in
//! line with what the switch commands report:
//!
//! 1. [`session`] - connect, announce availability, (re)subscribe, refresh
//! 2. [`switch_actor`] - per-switch command handling, polling and
//!    publish-if-changed
//!
//! # Architecture
//!
//! ```text
//!                 ┌──► SwitchActor(porch) ──┐
//! Session ────────┼──► SwitchActor(fan)   ──┼──► Broker
//! (refresh_all)   └──► SwitchActor(...)   ──┘
//!                          ▲
//!          inbound set-commands (per-switch handlers)
//! ```

pub mod error;
pub mod session;
pub mod switch_actor;

pub use error::EngineError;
pub use session::{generate_client_id, Connected, Ready, Session};
pub use switch_actor::{SwitchHandle, SwitchRuntime};
