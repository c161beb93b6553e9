//! Filesystem helpers

pub mod atomic;

pub use atomic::{atomic_write, cleanup_temp_files, remove_if_exists};
