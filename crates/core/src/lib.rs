// Core engine for Adpilot marketing workflow automation

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod registry;
pub mod tracker;
pub mod triggers;
pub mod types;
pub mod variables;
pub mod workflow;

pub use config::EngineConfig;
pub use engine::{EngineBuilder, WorkflowEngine};
pub use error::{EngineError, EngineResult};
pub use types::*;
