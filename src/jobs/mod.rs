//! Job registry and background maintenance.

mod cleanup;
mod registry;

pub use cleanup::{cleanup_loop, sweep};
pub use registry::JobRegistry;
