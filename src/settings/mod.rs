// Persisted preview configuration.

pub mod store;
pub mod types;
