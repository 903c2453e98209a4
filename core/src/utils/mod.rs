//! Utility functions and helpers

pub mod id;

pub use id::{Id, IdGenerator};
