// ABOUTME: Library root for warehouse-replicator
// ABOUTME: Exposes the sync engine, orchestrator, and their collaborators to the CLI and tests

pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod pipeline;
pub mod postgres;
pub mod schema;
pub mod selection;
pub mod source;
pub mod sql;
pub mod sync;
pub mod utils;
pub mod warehouse;
