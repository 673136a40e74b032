//! Retires expired connection records and cascades the retirement across
//! every collection that denormalizes them.
//!
//! The binary in `main.rs` is a thin CLI over [`retention::run_once`] and
//! [`retention::start_retention_worker`]; everything else lives here so it
//! can be driven from tests against the in-memory store.

pub mod config;
pub mod db;
pub mod models;
pub mod observability;
pub mod retention;

#[cfg(test)]
mod tests;
