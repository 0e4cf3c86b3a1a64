//! Error types for the workflow engine

use thiserror::Error;
use uuid::Uuid;

use crate::models::EvaluationStatus;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No user found for email: {0}")]
    IdentityNotFound(String),

    #[error("Invalid intermediary chain: {0}")]
    InvalidChain(String),

    #[error("Evaluation {0} not found")]
    EvaluationNotFound(Uuid),

    #[error("No user found for intermediary email: {0}")]
    IntermediaryNotFound(String),

    #[error("User {intermediary_id} has no path in evaluation {evaluation_id}")]
    PathNotFound {
        evaluation_id: Uuid,
        intermediary_id: Uuid,
    },

    #[error("Path for user {intermediary_id} in evaluation {evaluation_id} is already approved")]
    AlreadyApproved {
        evaluation_id: Uuid,
        intermediary_id: Uuid,
    },

    #[error("Hop at position {position} of evaluation {evaluation_id} is not at the frontier")]
    OutOfTurn {
        evaluation_id: Uuid,
        position: i64,
    },

    #[error("Evaluation {evaluation_id} is already {}", .status.as_str())]
    TerminalEvaluation {
        evaluation_id: Uuid,
        status: EvaluationStatus,
    },

    #[error("User {user_id} is neither an intermediary nor the recipient of evaluation {evaluation_id}")]
    NeitherIntermediaryNorRecipient {
        evaluation_id: Uuid,
        user_id: Uuid,
    },

    #[error("Dispatcher error: {0}")]
    Dispatcher(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
