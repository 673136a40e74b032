mod documents;

pub use documents::SqliteDocumentStore;
