//! Data models for evaluations and paths
//!
//! An `Evaluation` is one end-to-end introduction attempt from a requester to
//! a recipient via a fixed intermediary chain. Each hop in the chain is a
//! `Path` with its own approval state and position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `frontier_rank` value for the single hop currently eligible to approve.
pub const FRONTIER_ACTIVE: i64 = 1;
/// `frontier_rank` value for a hop that has already acted.
pub const FRONTIER_DONE: i64 = 0;
/// `frontier_rank` value for a hop whose predecessor has not approved yet.
pub const FRONTIER_UNREACHED: i64 = -1;

/// One introduction attempt from requester to recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub recipient_id: Uuid,
    pub status: EvaluationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Ongoing,
    Completed,
    Rejected,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Ongoing => "ongoing",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Rejected => "rejected",
        }
    }

    /// Terminal evaluations permit no further path mutation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EvaluationStatus::Completed | EvaluationStatus::Rejected
        )
    }
}

impl std::str::FromStr for EvaluationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(EvaluationStatus::Ongoing),
            "completed" => Ok(EvaluationStatus::Completed),
            "rejected" => Ok(EvaluationStatus::Rejected),
            _ => Err(format!("Invalid evaluation status: {}", s)),
        }
    }
}

/// One intermediary hop within an evaluation's chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    pub id: Uuid,
    pub evaluation_id: Uuid,
    pub intermediary_id: Uuid,
    /// 1-based position in the chain, fixed at creation
    pub position: i64,
    /// Display ordering among the remaining pending hops, recomputed fully on
    /// every approval; approved hops hold 0
    pub queue_position: i64,
    /// See [`FRONTIER_ACTIVE`], [`FRONTIER_DONE`], [`FRONTIER_UNREACHED`]
    pub frontier_rank: i64,
    pub approval: PathApproval,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Path {
    /// Whether this hop is the one currently eligible to approve
    pub fn is_frontier(&self) -> bool {
        self.frontier_rank == FRONTIER_ACTIVE && self.approval == PathApproval::Pending
    }
}

/// Approval state of a single hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathApproval {
    Pending,
    Approved,
    Rejected,
}

impl PathApproval {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathApproval::Pending => "pending",
            PathApproval::Approved => "approved",
            PathApproval::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for PathApproval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PathApproval::Pending),
            "approved" => Ok(PathApproval::Approved),
            "rejected" => Ok(PathApproval::Rejected),
            _ => Err(format!("Invalid path approval: {}", s)),
        }
    }
}

/// Denormalized connection-request status as seen by requester/recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    /// The recipient declined outright
    Rejected,
    /// An intermediary broke the chain midway
    Interrupted,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Rejected => "rejected",
            ConnectionStatus::Interrupted => "interrupted",
        }
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "connected" => Ok(ConnectionStatus::Connected),
            "rejected" => Ok(ConnectionStatus::Rejected),
            "interrupted" => Ok(ConnectionStatus::Interrupted),
            _ => Err(format!("Invalid connection status: {}", s)),
        }
    }
}

/// Per-evaluation connection record, updated in lock-step with the evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub evaluation_id: Uuid,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pending request visible to an intermediary at the frontier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierRequest {
    pub evaluation_id: Uuid,
    pub requester_id: Uuid,
    pub recipient_id: Uuid,
    pub status: EvaluationStatus,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}
