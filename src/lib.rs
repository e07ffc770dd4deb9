//! Portable - sandboxed sessions for desktop applications
//!
//! This crate provides:
//! - Policy assembly: filesystem, device, display and bus rules compiled
//!   into one sandbox command
//! - The host-side session launcher and its teardown
//! - The in-sandbox helper that tracks the session's processes
//! - The control channel connecting the two

pub mod bus;
pub mod cli;
pub mod config;
pub mod context;
pub mod control;
pub mod devices;
pub mod error;
pub mod paths;
pub mod policy;
pub mod session;
pub mod supervisor;

pub use config::Config;
pub use context::SessionContext;
