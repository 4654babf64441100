//! kestrel-ai: provider contract for the kestrel agent core
//!
//! This crate defines the conversation types, the chunked response stream and
//! the `ProviderClient` trait that every model provider implements.

pub mod error;
pub mod models;
pub mod provider;
pub mod stream;
pub mod types;

pub use error::{Error, Result, is_context_overflow};
pub use models::{DEFAULT_CONTEXT_WINDOW, ModelInfo};
pub use provider::ProviderClient;
pub use stream::{ApiStreamChunk, ChunkStream, FunctionCall};
pub use types::*;
