pub mod document;
mod entity;

pub use document::{Document, Filter, PullOutcome};
pub use entity::{EndPeriod, Entity, EntityError};
