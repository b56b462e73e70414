//! Persistence layer for the arbor DAG engine.
//!
//! Four tables back the engine: `dag_runs` (snapshots), `dag_events`
//! (append-only log, rowid = sequence), `dag_approvals` (human gates), and
//! `dag_run_queue` (admission queue with lease-based claims). Everything is
//! SQLite via sqlx; migrations live in `migrations/` and are applied with a
//! runtime migrator.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
