//! Council Core Library
//!
//! Shared functionality for Council components:
//! - Flow step definitions, loading and validation
//! - Process-wide character limits
//! - Conversation transcript (`ContextStore`) and tail truncation
//! - `{name}` template rendering
//! - Command-line tokenization without a shell
//! - Common error types

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod limits;
pub mod prerequisites;
pub mod template;
pub mod tracing_init;

pub use context::{ContextStore, Turn};
pub use error::{Error, Result};
pub use flow::Step;
pub use limits::Limits;
