//! Domain model for workflow runs.
//!
//! - **Run** (`run.rs`): lifecycle state machine and execution history
//! - **Work** (`work.rs`): one stage execution and its ordered tasks
//! - **Checkpoint** (`checkpoint.rs`): commit snapshot a run can rewind to
//! - **Events** (`events.rs`): facts recorded by aggregates
//! - **Factory** (`factory.rs`): freezes a template into a new run

pub mod checkpoint;
pub mod errors;
pub mod events;
pub mod factory;
pub mod node_config;
pub mod records;
pub mod run;
pub mod types;
pub mod work;

pub use checkpoint::Checkpoint;
pub use errors::{EngineError, EngineResult};
pub use events::{EventEnvelope, WorkExecutionEvent, WorkflowRunEvent};
pub use factory::{WorkflowRunFactory, WorkflowTemplate};
pub use node_config::{GitRefNodeConfig, McpServerRefNodeConfig, TaskNodeConfig, WorkNodeConfig};
pub use records::{Report, WorkTree};
pub use run::{RunStatus, WorkflowRun};
pub use work::{TaskExecution, TaskStatus, WorkExecution};
