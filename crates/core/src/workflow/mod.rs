pub mod action_executor;
pub mod dag;
pub mod executor;

pub use action_executor::{ActionExecutor, ActionOutcome};
pub use dag::{order, ActionGraph, EdgeKind};
pub use executor::{RunRequest, WorkflowExecutor};
