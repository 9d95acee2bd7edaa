// kvpool-common - Shared configuration and error definitions for KVPool
//
// Both the client crate and the benchmark harness depend on these types, so
// they live apart from any I/O code.

pub mod config;
pub mod error;

// Re-export for convenience
pub use config::*;
pub use error::*;
