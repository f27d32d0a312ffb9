//! Stage workers for the tscribe job choreography.
//!
//! This crate provides:
//! - Stage handlers that move jobs from `queued` to a terminal status
//! - Collaborator contracts and HTTP clients (metadata, inference)
//! - Prompt compilation
//! - A semaphore-bounded delivery loop with graceful shutdown
//! - Structured job logging

pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod prompt;
pub mod stages;

pub use collaborators::{HttpInferenceProvider, HttpMetadataResolver, InferenceProvider, MetadataResolver};
pub use config::{WorkerConfig, WorkerRole};
pub use error::{WorkerError, WorkerResult};
pub use executor::DeliveryLoop;
pub use logging::JobLogger;
pub use prompt::{compile_prompt, CompiledPrompt, PROMPT_VERSION};
pub use stages::{work_topic, DeliveryOutcome, StageHandlers};
