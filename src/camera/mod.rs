// Camera domain: discovery, permission and device sessions.

pub mod backend;
pub mod error;
pub mod permission;
pub mod synthetic;
pub mod types;
