// In-page variant: one cooperative loop driven by display-frame callbacks.

pub mod media;
pub mod preview;
pub mod scheduler;
