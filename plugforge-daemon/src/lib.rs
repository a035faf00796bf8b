//! plugforge daemon library
//!
//! This module exports the internal components of the daemon for testing purposes.

pub mod config;
pub mod daemon;

pub use config::Config;
pub use daemon::{init_logging, Daemon};
