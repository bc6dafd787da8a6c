//! habitsync - offline-first sync engine
//!
//! Queues habit, journal and check-in operations while offline, submits them
//! in priority-ordered batches when connectivity returns, classifies failures
//! and recovers from them, and keeps conflicting changes for resolution.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod recovery;
pub mod storage;
pub mod sync;
pub mod transport;

pub use cli::args::{Cli, Commands, OutputFormat};
pub use engine::SyncEngine;
pub use error::SyncError;
