//! Multi-hop introduction workflow engine
//!
//! A requester reaches a recipient through a chain of intermediaries, each of
//! whom must approve forwarding the request before the next hop may even see
//! it. The engine enforces strictly sequential approval, terminal rejection
//! and interruption handling, and fires completion side effects exactly once.

pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod models;
pub mod store;

pub use directory::{Directory, Identity, InMemoryDirectory};
pub use dispatch::{ChatDispatcher, Dispatcher, NullDispatcher};
pub use engine::{WorkflowEngine, WorkflowEvent};
pub use error::{Result, WorkflowError};
pub use models::{
    ConnectionRecord, ConnectionStatus, Evaluation, EvaluationStatus, FrontierRequest, Path,
    PathApproval,
};
pub use store::Store;
