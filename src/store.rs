//! Database store for evaluations and paths
//!
//! The evaluation plus its paths form the unit of transactionality: every
//! multi-row mutation of one evaluation's aggregate runs inside a single
//! transaction, so a chain is never observed partially initialized or
//! partially advanced.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::models::{
    ConnectionRecord, ConnectionStatus, Evaluation, EvaluationStatus, FrontierRequest, Path,
    PathApproval, FRONTIER_ACTIVE, FRONTIER_DONE, FRONTIER_UNREACHED,
};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| WorkflowError::Internal(format!("Migration failed: {}", e)))?;
        Ok(())
    }

    /// Create an evaluation with its full path chain in one transaction
    ///
    /// The first hop starts at the frontier; all later hops are unreachable
    /// until their predecessor approves.
    pub async fn create_evaluation(
        &self,
        requester_id: Uuid,
        recipient_id: Uuid,
        intermediary_ids: &[Uuid],
    ) -> Result<Evaluation> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO evaluations (id, requester_id, recipient_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(requester_id.to_string())
        .bind(recipient_id.to_string())
        .bind(EvaluationStatus::Ongoing.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (index, intermediary_id) in intermediary_ids.iter().enumerate() {
            let position = index as i64 + 1;
            let frontier_rank = if index == 0 {
                FRONTIER_ACTIVE
            } else {
                FRONTIER_UNREACHED
            };

            sqlx::query(
                r#"
                INSERT INTO paths
                    (id, evaluation_id, intermediary_id, position, queue_position,
                     frontier_rank, approval, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(id.to_string())
            .bind(intermediary_id.to_string())
            .bind(position)
            .bind(position)
            .bind(frontier_rank)
            .bind(PathApproval::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO evaluation_approvals (id, evaluation_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(id.to_string())
        .bind(ConnectionStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Evaluation {
            id,
            requester_id,
            recipient_id,
            status: EvaluationStatus::Ongoing,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_evaluation(&self, id: Uuid) -> Result<Evaluation> {
        let row = sqlx::query_as::<_, EvaluationRow>(
            r#"
            SELECT id, requester_id, recipient_id, status, created_at, updated_at
            FROM evaluations
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(WorkflowError::EvaluationNotFound(id))?;

        row.try_into()
    }

    /// All paths of an evaluation in ascending chain position
    pub async fn get_paths(&self, evaluation_id: Uuid) -> Result<Vec<Path>> {
        let rows = sqlx::query_as::<_, PathRow>(
            r#"
            SELECT id, evaluation_id, intermediary_id, position, queue_position,
                   frontier_rank, approval, created_at, updated_at
            FROM paths
            WHERE evaluation_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(evaluation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    pub async fn get_connection_record(&self, evaluation_id: Uuid) -> Result<ConnectionRecord> {
        let row = sqlx::query_as::<_, ConnectionRow>(
            r#"
            SELECT id, evaluation_id, status, created_at, updated_at
            FROM evaluation_approvals
            WHERE evaluation_id = ?
            "#,
        )
        .bind(evaluation_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(WorkflowError::EvaluationNotFound(evaluation_id))?;

        row.try_into()
    }

    /// Pending requests currently at the frontier for one intermediary
    ///
    /// This is the sole visibility rule: a hop is invisible before its
    /// predecessor approves, after the hop itself approves, and once the
    /// evaluation has reached a terminal state. A rejection elsewhere in the
    /// chain leaves the frontier hop's row untouched as audit record, so the
    /// terminal filter lives in this query.
    pub async fn frontier_requests(&self, intermediary_id: Uuid) -> Result<Vec<FrontierRequest>> {
        let rows = sqlx::query_as::<_, FrontierRow>(
            r#"
            SELECT p.evaluation_id, e.requester_id, e.recipient_id, e.status,
                   p.position, e.created_at
            FROM paths p
            JOIN evaluations e ON e.id = p.evaluation_id
            WHERE p.intermediary_id = ?
              AND p.frontier_rank = ?
              AND p.approval = ?
              AND e.status = ?
            ORDER BY e.created_at ASC
            "#,
        )
        .bind(intermediary_id.to_string())
        .bind(FRONTIER_ACTIVE)
        .bind(PathApproval::Pending.as_str())
        .bind(EvaluationStatus::Ongoing.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Apply a planned approval as one atomic unit
    ///
    /// Marks the approved path, rewrites every queue position, then either
    /// hands the frontier to the next hop or transitions the evaluation to
    /// completed together with its connection record.
    pub async fn apply_approval(
        &self,
        evaluation_id: Uuid,
        approved_path_id: Uuid,
        next_frontier_path_id: Option<Uuid>,
        queue_positions: &[(Uuid, i64)],
    ) -> Result<EvaluationStatus> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE paths SET approval = ?, frontier_rank = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(PathApproval::Approved.as_str())
        .bind(FRONTIER_DONE)
        .bind(now)
        .bind(approved_path_id.to_string())
        .execute(&mut *tx)
        .await?;

        for (path_id, queue_position) in queue_positions {
            sqlx::query(
                r#"
                UPDATE paths SET queue_position = ?, updated_at = ? WHERE id = ?
                "#,
            )
            .bind(*queue_position)
            .bind(now)
            .bind(path_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        let status = match next_frontier_path_id {
            Some(next_path_id) => {
                sqlx::query(
                    r#"
                    UPDATE paths SET frontier_rank = ?, updated_at = ? WHERE id = ?
                    "#,
                )
                .bind(FRONTIER_ACTIVE)
                .bind(now)
                .bind(next_path_id.to_string())
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE evaluations SET updated_at = ? WHERE id = ?
                    "#,
                )
                .bind(now)
                .bind(evaluation_id.to_string())
                .execute(&mut *tx)
                .await?;

                EvaluationStatus::Ongoing
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE evaluations SET status = ?, updated_at = ? WHERE id = ?
                    "#,
                )
                .bind(EvaluationStatus::Completed.as_str())
                .bind(now)
                .bind(evaluation_id.to_string())
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE evaluation_approvals SET status = ?, updated_at = ?
                    WHERE evaluation_id = ?
                    "#,
                )
                .bind(ConnectionStatus::Connected.as_str())
                .bind(now)
                .bind(evaluation_id.to_string())
                .execute(&mut *tx)
                .await?;

                EvaluationStatus::Completed
            }
        };

        tx.commit().await?;
        Ok(status)
    }

    /// Recipient declined outright: evaluation and connection record both
    /// become rejected
    ///
    /// `recipient_path_id` covers the edge case where the recipient also
    /// occupies an intermediary slot; that path is marked rejected too.
    pub async fn apply_recipient_rejection(
        &self,
        evaluation_id: Uuid,
        recipient_path_id: Option<Uuid>,
    ) -> Result<()> {
        self.apply_rejection(evaluation_id, recipient_path_id, ConnectionStatus::Rejected)
            .await
    }

    /// An intermediary refused to forward: the chain is broken midway
    ///
    /// The evaluation is rejected but the connection record reads interrupted,
    /// distinguishing a broken chain from a recipient's decline. Approved
    /// upstream paths are left untouched.
    pub async fn apply_interruption(&self, evaluation_id: Uuid, path_id: Uuid) -> Result<()> {
        self.apply_rejection(evaluation_id, Some(path_id), ConnectionStatus::Interrupted)
            .await
    }

    async fn apply_rejection(
        &self,
        evaluation_id: Uuid,
        path_id: Option<Uuid>,
        connection_status: ConnectionStatus,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE evaluations SET status = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(EvaluationStatus::Rejected.as_str())
        .bind(now)
        .bind(evaluation_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE evaluation_approvals SET status = ?, updated_at = ?
            WHERE evaluation_id = ?
            "#,
        )
        .bind(connection_status.as_str())
        .bind(now)
        .bind(evaluation_id.to_string())
        .execute(&mut *tx)
        .await?;

        if let Some(path_id) = path_id {
            sqlx::query(
                r#"
                UPDATE paths SET approval = ?, frontier_rank = ?, updated_at = ? WHERE id = ?
                "#,
            )
            .bind(PathApproval::Rejected.as_str())
            .bind(FRONTIER_DONE)
            .bind(now)
            .bind(path_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// Internal row types for sqlx

#[derive(sqlx::FromRow)]
struct EvaluationRow {
    id: String,
    requester_id: String,
    recipient_id: String,
    status: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<EvaluationRow> for Evaluation {
    type Error = WorkflowError;

    fn try_from(row: EvaluationRow) -> Result<Self> {
        Ok(Evaluation {
            id: parse_uuid(&row.id)?,
            requester_id: parse_uuid(&row.requester_id)?,
            recipient_id: parse_uuid(&row.recipient_id)?,
            status: row
                .status
                .parse()
                .map_err(|e| WorkflowError::Internal(format!("Invalid status: {}", e)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PathRow {
    id: String,
    evaluation_id: String,
    intermediary_id: String,
    position: i64,
    queue_position: i64,
    frontier_rank: i64,
    approval: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<PathRow> for Path {
    type Error = WorkflowError;

    fn try_from(row: PathRow) -> Result<Self> {
        Ok(Path {
            id: parse_uuid(&row.id)?,
            evaluation_id: parse_uuid(&row.evaluation_id)?,
            intermediary_id: parse_uuid(&row.intermediary_id)?,
            position: row.position,
            queue_position: row.queue_position,
            frontier_rank: row.frontier_rank,
            approval: row
                .approval
                .parse()
                .map_err(|e| WorkflowError::Internal(format!("Invalid approval: {}", e)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    id: String,
    evaluation_id: String,
    status: String,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<ConnectionRow> for ConnectionRecord {
    type Error = WorkflowError;

    fn try_from(row: ConnectionRow) -> Result<Self> {
        Ok(ConnectionRecord {
            id: parse_uuid(&row.id)?,
            evaluation_id: parse_uuid(&row.evaluation_id)?,
            status: row
                .status
                .parse()
                .map_err(|e| WorkflowError::Internal(format!("Invalid status: {}", e)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FrontierRow {
    evaluation_id: String,
    requester_id: String,
    recipient_id: String,
    status: String,
    position: i64,
    created_at: chrono::DateTime<Utc>,
}

impl TryFrom<FrontierRow> for FrontierRequest {
    type Error = WorkflowError;

    fn try_from(row: FrontierRow) -> Result<Self> {
        Ok(FrontierRequest {
            evaluation_id: parse_uuid(&row.evaluation_id)?,
            requester_id: parse_uuid(&row.requester_id)?,
            recipient_id: parse_uuid(&row.recipient_id)?,
            status: row
                .status
                .parse()
                .map_err(|e| WorkflowError::Internal(format!("Invalid status: {}", e)))?,
            position: row.position,
            created_at: row.created_at,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| WorkflowError::Internal(format!("Invalid UUID: {}", e)))
}
