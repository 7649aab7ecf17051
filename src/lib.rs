// Core modules
pub mod accumulation;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod models;
pub mod persistence;
pub mod reconcile;
pub mod store;
pub mod synthetic;

// Re-export commonly used types
pub use accumulation::{detect_streak, StreakDetector, StreakService};
pub use diff::{compute_diff, DiffEngine};
pub use error::{DiffError, Result};
pub use models::*;
pub use reconcile::{BatchReport, ReconcileOptions, ReconcileStats, Reconciler};
pub use store::{DiffStore, FilingProvider, InMemoryStore};
