//! sbxterm - remote sandbox terminal client
//!
//! Connects a local terminal (or any [`surface::TerminalSurface`]) to a
//! remote sandbox through a WebSocket terminal proxy, reconnects on early
//! failures, and escalates to a blocking overlay with fallback actions when
//! connecting keeps failing.

pub mod broker;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod escalation;
pub mod identity;
pub mod launcher;
pub mod protocol;
pub mod registry;
pub mod shell;
pub mod surface;
pub mod terminal;
