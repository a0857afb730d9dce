// Kilat v0.2.0 - Memory-Mapped Perfect-Hash Key-Value Store
// Standard probing → offline MPHF optimization on one on-disk layout

pub mod db;
pub mod error;
pub mod hasher;
pub mod journal;
pub mod mphf;
pub mod store;
pub mod types;

// Re-export main types
pub use db::KilatDB;
pub use error::{KilatError, Result};
pub use journal::{JournalStats, KeyJournal};
pub use mphf::{Mphf, MphfConfig, MphfStats};
pub use store::SlotStore;
pub use types::{HashMode, MphfKind, Stats};
