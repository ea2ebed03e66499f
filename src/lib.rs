//! Workflow runtime orchestration engine.
//!
//! A workflow run walks an ordered list of stages. Each stage gets its own
//! coding-agent session, git work trees and report directory; every state
//! change commits together with its outbox rows so subscribers see events
//! only for durable state.

pub mod config;
pub mod domain;
pub mod engine_paths;
pub mod pipeline;
pub mod reliability;
pub mod services;
pub mod store;
pub mod usecases;

#[cfg(test)]
pub mod testing;

pub use config::EngineConfig;
pub use pipeline::{DriveOutcome, PipelineDriver, QueryRetryPolicy};
pub use usecases::{Engine, EngineParts};
