pub mod keys;
pub mod persistence;

pub use persistence::{select_largest, Decision, PersistenceTracker};
