//! `dprompts-ai`
//!
//! **Responsibility:** boundary to the external text-generation service.
//!
//! - It knows nothing about queues, groups or results.
//! - It turns one prompt (plus optional system instruction and schema) into one
//!   generated text, or a typed error the worker can report as attempt failure.

pub mod client;
pub mod ollama;
pub mod request;
pub mod result;

pub use client::TextGenerator;
pub use ollama::{OllamaClient, OllamaConfig};
pub use request::{ChatMessage, ChatRole, GenerationRequest, SamplingOptions};
pub use result::{Generation, GenerationError};
