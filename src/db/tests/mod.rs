//! Shared document store test infrastructure
//!
//! The same test logic runs against every [`DocumentStore`](crate::db::DocumentStore)
//! implementation. Each shared test takes `&dyn DocumentStore`; the backend
//! modules at the bottom of `documents.rs` wire them up.
//!
//! ```bash
//! cargo test db::tests                              # memory + SQLite
//! cargo test db::tests --no-default-features -F cli # memory only
//! ```
