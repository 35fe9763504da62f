//! Shared configuration and error types for the model adapter and the
//! word-substitution crates.

pub mod config;
pub mod error;
pub mod hub;

pub use config::{BackendKind, Config};
pub use error::{AdapterError, Result};
