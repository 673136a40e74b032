//! Consolidated test modules.
//!
//! End-to-end retention runs against both datastore backends.

mod retention_e2e;
