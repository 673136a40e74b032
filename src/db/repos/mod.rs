mod documents;

pub use documents::{DocumentStore, DocumentTx, Seq, StoredDocument};
