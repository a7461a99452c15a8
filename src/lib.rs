// ABOUTME: Library crate for the MOT-feed warehouse synchronizer
// ABOUTME: Exposes the sync engine components; the CLI binary wires them together

pub mod auth;
pub mod config;
pub mod feed;
pub mod normalize;
pub mod period;
pub mod runner;
pub mod warehouse;

pub use config::SyncConfig;
pub use runner::{RunHandle, RunMode, RunState, RunStats, SyncRunner};
