mod store;
mod versioned;

pub use store::{GameStateStore, StateView, StoreStats};
pub use versioned::VersionedState;
