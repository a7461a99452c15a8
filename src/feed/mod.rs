// ABOUTME: Remote feed access: manifest models, HTTP client, dedup-aware puller
// ABOUTME: Exports FeedClient, DataPuller and the manifest data structures

pub mod client;
pub mod models;
pub mod puller;

pub use client::{FeedClient, TransferError};
pub use models::{Manifest, ManifestEntry};
pub use puller::{expand_archives, DataPuller};
