// Preview pipeline: capture, processing, filtering and presentation.

pub mod capture;
pub mod controller;
pub mod gpu;
pub mod mailbox;
pub mod presenter;
pub mod process;
pub mod raster;
pub mod sink;
