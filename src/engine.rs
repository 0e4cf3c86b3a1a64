//! Approval engine for multi-hop introduction workflows
//!
//! The engine handles:
//! - Evaluation creation from an ordered intermediary chain
//! - Frontier queries (which requests an intermediary may act on)
//! - Approval advancement, completion detection, out-of-order blocking
//! - Rejection and interruption with terminal-state transitions
//! - Per-evaluation mutual exclusion and event broadcasting
//!
//! State transitions are planned from an in-memory snapshot while the
//! evaluation's lock is held, then applied by the store as one transaction.
//! The dispatcher fires only after the completing transaction has committed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::directory::Directory;
use crate::dispatch::Dispatcher;
use crate::error::{Result, WorkflowError};
use crate::models::{
    ConnectionStatus, Evaluation, EvaluationStatus, FrontierRequest, Path, PathApproval,
};
use crate::store::Store;

/// Events emitted by the workflow engine
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// An evaluation was created with its full chain
    EvaluationCreated {
        evaluation_id: Uuid,
        requester_id: Uuid,
        recipient_id: Uuid,
        chain_length: usize,
    },
    /// An intermediary approved their hop
    HopApproved {
        evaluation_id: Uuid,
        intermediary_id: Uuid,
        position: i64,
    },
    /// Every hop approved; the evaluation is complete
    EvaluationCompleted { evaluation_id: Uuid },
    /// The evaluation ended in rejection
    EvaluationRejected {
        evaluation_id: Uuid,
        rejected_by: Uuid,
        /// true when an intermediary broke the chain, false when the
        /// recipient declined outright
        interrupted: bool,
    },
}

/// Per-evaluation locks serializing mutations on the same aggregate
///
/// Different evaluations share nothing and proceed concurrently.
struct EvaluationLocks {
    inner: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl EvaluationLocks {
    fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    async fn acquire(&self, evaluation_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.write().await;
            locks
                .entry(evaluation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for an evaluation that reached a terminal state
    ///
    /// Terminal status is monotonic, so any writer racing past a removed
    /// entry fails the terminal check before mutating anything. Without this
    /// the map would grow by one entry per evaluation ever touched.
    async fn release(&self, evaluation_id: Uuid) {
        let mut locks = self.inner.write().await;
        locks.remove(&evaluation_id);
    }
}

/// Planned outcome of one approval, computed before anything is written
#[derive(Debug, Clone)]
pub struct ApprovalPlan {
    pub approved_path_id: Uuid,
    /// Pending hops left after this approval; zero means completion
    pub remaining_pending: usize,
    /// The hop gaining the frontier, if any
    pub next_frontier_path_id: Option<Uuid>,
    /// Full queue-position recompute covering every path
    pub queue_positions: Vec<(Uuid, i64)>,
}

impl ApprovalPlan {
    pub fn completes(&self) -> bool {
        self.remaining_pending == 0
    }
}

/// Plan the state transition for approving `approved` within `paths`
///
/// `paths` must be the evaluation's full chain in ascending position. Queue
/// positions are recomputed from scratch: hops still pending after this
/// approval are numbered 1.. in chain order, everything else gets 0. The
/// frontier moves to the hop at the next position, never skipping a hop.
pub fn plan_approval(paths: &[Path], approved: &Path) -> ApprovalPlan {
    let mut queue_positions = Vec::with_capacity(paths.len());
    let mut next_queue = 1i64;
    let mut remaining_pending = 0usize;

    for path in paths {
        let still_pending = path.approval == PathApproval::Pending && path.id != approved.id;
        if still_pending {
            queue_positions.push((path.id, next_queue));
            next_queue += 1;
            remaining_pending += 1;
        } else {
            queue_positions.push((path.id, 0));
        }
    }

    let next_frontier_path_id = paths
        .iter()
        .find(|p| {
            p.position == approved.position + 1
                && p.approval == PathApproval::Pending
                && p.id != approved.id
        })
        .map(|p| p.id);

    ApprovalPlan {
        approved_path_id: approved.id,
        remaining_pending,
        next_frontier_path_id,
        queue_positions,
    }
}

/// Coordinates the introduction workflow over the store and collaborators
pub struct WorkflowEngine {
    store: Store,
    directory: Arc<dyn Directory>,
    dispatcher: Arc<dyn Dispatcher>,
    locks: EvaluationLocks,
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowEngine {
    pub fn new(store: Store, directory: Arc<dyn Directory>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            store,
            directory,
            dispatcher,
            locks: EvaluationLocks::new(),
            event_tx,
        }
    }

    /// Subscribe to workflow events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    /// Create an evaluation from an ordered intermediary chain
    ///
    /// Resolves every email first; the chain is then created atomically with
    /// the first hop at the frontier.
    pub async fn create_evaluation(
        &self,
        requester_email: &str,
        recipient_email: &str,
        intermediary_emails: &[String],
    ) -> Result<Evaluation> {
        if intermediary_emails.is_empty() {
            return Err(WorkflowError::InvalidChain(
                "intermediary list is empty".to_string(),
            ));
        }

        let requester = self.directory.resolve_identity(requester_email).await?;
        let recipient = self.directory.resolve_identity(recipient_email).await?;

        let mut intermediary_ids = Vec::with_capacity(intermediary_emails.len());
        for email in intermediary_emails {
            let identity = self.directory.resolve_identity(email).await?;
            if intermediary_ids.contains(&identity.id) {
                return Err(WorkflowError::InvalidChain(format!(
                    "duplicate intermediary: {}",
                    email
                )));
            }
            intermediary_ids.push(identity.id);
        }

        let evaluation = self
            .store
            .create_evaluation(requester.id, recipient.id, &intermediary_ids)
            .await?;

        tracing::info!(
            evaluation_id = %evaluation.id,
            requester_id = %requester.id,
            recipient_id = %recipient.id,
            chain_length = intermediary_ids.len(),
            "evaluation created"
        );

        let _ = self.event_tx.send(WorkflowEvent::EvaluationCreated {
            evaluation_id: evaluation.id,
            requester_id: requester.id,
            recipient_id: recipient.id,
            chain_length: intermediary_ids.len(),
        });

        Ok(evaluation)
    }

    /// Pending requests currently actionable by one intermediary
    pub async fn frontier_requests(&self, intermediary_email: &str) -> Result<Vec<FrontierRequest>> {
        let identity = self.directory.resolve_identity(intermediary_email).await?;
        self.store.frontier_requests(identity.id).await
    }

    /// Approve the intermediary's hop of an evaluation
    ///
    /// Advances the frontier by exactly one position, or transitions the
    /// evaluation to completed when this was the last pending hop. On the
    /// completed transition the dispatcher is invoked once, after the
    /// transaction has committed; a dispatcher failure is logged and never
    /// rolls the completion back.
    pub async fn approve(
        &self,
        evaluation_id: Uuid,
        intermediary_email: &str,
    ) -> Result<EvaluationStatus> {
        let identity = self
            .directory
            .resolve_identity(intermediary_email)
            .await
            .map_err(|e| match e {
                WorkflowError::IdentityNotFound(email) => {
                    WorkflowError::IntermediaryNotFound(email)
                }
                other => other,
            })?;

        let _guard = self.locks.acquire(evaluation_id).await;

        let evaluation = self.store.get_evaluation(evaluation_id).await?;
        if evaluation.status.is_terminal() {
            return Err(WorkflowError::TerminalEvaluation {
                evaluation_id,
                status: evaluation.status,
            });
        }

        let paths = self.store.get_paths(evaluation_id).await?;
        let path = paths
            .iter()
            .find(|p| p.intermediary_id == identity.id)
            .cloned()
            .ok_or(WorkflowError::PathNotFound {
                evaluation_id,
                intermediary_id: identity.id,
            })?;

        if path.approval == PathApproval::Approved {
            return Err(WorkflowError::AlreadyApproved {
                evaluation_id,
                intermediary_id: identity.id,
            });
        }
        if !path.is_frontier() {
            return Err(WorkflowError::OutOfTurn {
                evaluation_id,
                position: path.position,
            });
        }

        let plan = plan_approval(&paths, &path);
        if !plan.completes() && plan.next_frontier_path_id.is_none() {
            // positions are a contiguous 1..N permutation, so a pending
            // successor must exist whenever pending hops remain
            return Err(WorkflowError::Internal(format!(
                "evaluation {} has no hop at position {}",
                evaluation_id,
                path.position + 1
            )));
        }

        let status = self
            .store
            .apply_approval(
                evaluation_id,
                plan.approved_path_id,
                plan.next_frontier_path_id,
                &plan.queue_positions,
            )
            .await?;

        tracing::info!(
            evaluation_id = %evaluation_id,
            intermediary_id = %identity.id,
            position = path.position,
            status = status.as_str(),
            "hop approved"
        );

        let _ = self.event_tx.send(WorkflowEvent::HopApproved {
            evaluation_id,
            intermediary_id: identity.id,
            position: path.position,
        });

        if status == EvaluationStatus::Completed {
            let evaluation = self.store.get_evaluation(evaluation_id).await?;
            let chain = self.store.get_paths(evaluation_id).await?;
            if let Err(e) = self
                .dispatcher
                .on_evaluation_completed(&evaluation, &chain)
                .await
            {
                // completion is already committed; the side effect surfaces
                // to an external retry mechanism
                let failure = WorkflowError::Dispatcher(e.to_string());
                tracing::error!(
                    evaluation_id = %evaluation_id,
                    error = %failure,
                    "dispatcher failed after completion"
                );
            }
            let _ = self
                .event_tx
                .send(WorkflowEvent::EvaluationCompleted { evaluation_id });
            self.locks.release(evaluation_id).await;
        }

        Ok(status)
    }

    /// Reject an evaluation on behalf of its recipient or an intermediary
    ///
    /// A recipient's rejection marks the connection rejected; an
    /// intermediary's refusal marks it interrupted. Both are terminal for the
    /// evaluation, and approved upstream hops stay approved as the audit
    /// record.
    pub async fn reject(
        &self,
        evaluation_id: Uuid,
        rejecting_email: &str,
    ) -> Result<ConnectionStatus> {
        let identity = self.directory.resolve_identity(rejecting_email).await?;

        let _guard = self.locks.acquire(evaluation_id).await;

        let evaluation = self.store.get_evaluation(evaluation_id).await?;
        if evaluation.status.is_terminal() {
            return Err(WorkflowError::TerminalEvaluation {
                evaluation_id,
                status: evaluation.status,
            });
        }

        let paths = self.store.get_paths(evaluation_id).await?;
        let own_path = paths.iter().find(|p| p.intermediary_id == identity.id);

        let (connection_status, interrupted) = if identity.id == evaluation.recipient_id {
            // an approved hop is history and never transitions out of
            // approved, even when its owner is the rejecting recipient
            let own_pending_path = own_path
                .filter(|p| p.approval == PathApproval::Pending)
                .map(|p| p.id);
            self.store
                .apply_recipient_rejection(evaluation_id, own_pending_path)
                .await?;
            (ConnectionStatus::Rejected, false)
        } else {
            let path = own_path.ok_or(WorkflowError::NeitherIntermediaryNorRecipient {
                evaluation_id,
                user_id: identity.id,
            })?;
            if path.approval == PathApproval::Approved {
                // forwarding was already granted; that decision cannot be
                // withdrawn by a later rejection
                return Err(WorkflowError::AlreadyApproved {
                    evaluation_id,
                    intermediary_id: identity.id,
                });
            }
            self.store.apply_interruption(evaluation_id, path.id).await?;
            (ConnectionStatus::Interrupted, true)
        };

        tracing::info!(
            evaluation_id = %evaluation_id,
            rejected_by = %identity.id,
            interrupted,
            "evaluation rejected"
        );

        let _ = self.event_tx.send(WorkflowEvent::EvaluationRejected {
            evaluation_id,
            rejected_by: identity.id,
            interrupted,
        });
        self.locks.release(evaluation_id).await;

        Ok(connection_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::dispatch::NullDispatcher;
    use crate::models::FRONTIER_ACTIVE;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;

    fn make_path(position: i64, frontier_rank: i64, approval: PathApproval) -> Path {
        let now = Utc::now();
        Path {
            id: Uuid::new_v4(),
            evaluation_id: Uuid::new_v4(),
            intermediary_id: Uuid::new_v4(),
            position,
            queue_position: position,
            frontier_rank,
            approval,
            created_at: now,
            updated_at: now,
        }
    }

    fn make_chain(n: i64) -> Vec<Path> {
        (1..=n)
            .map(|position| {
                let frontier_rank = if position == 1 {
                    FRONTIER_ACTIVE
                } else {
                    crate::models::FRONTIER_UNREACHED
                };
                make_path(position, frontier_rank, PathApproval::Pending)
            })
            .collect()
    }

    #[test]
    fn test_plan_approval_advances_to_next_hop() {
        let paths = make_chain(3);
        let plan = plan_approval(&paths, &paths[0]);

        assert!(!plan.completes());
        assert_eq!(plan.remaining_pending, 2);
        assert_eq!(plan.approved_path_id, paths[0].id);
        assert_eq!(plan.next_frontier_path_id, Some(paths[1].id));
    }

    #[test]
    fn test_plan_approval_queue_positions_recomputed() {
        let paths = make_chain(3);
        let plan = plan_approval(&paths, &paths[0]);

        assert_eq!(
            plan.queue_positions,
            vec![(paths[0].id, 0), (paths[1].id, 1), (paths[2].id, 2)]
        );
    }

    #[test]
    fn test_plan_approval_mid_chain() {
        let mut paths = make_chain(3);
        paths[0].approval = PathApproval::Approved;
        paths[0].frontier_rank = crate::models::FRONTIER_DONE;
        paths[0].queue_position = 0;
        paths[1].frontier_rank = FRONTIER_ACTIVE;

        let plan = plan_approval(&paths, &paths[1]);

        assert_eq!(plan.remaining_pending, 1);
        assert_eq!(plan.next_frontier_path_id, Some(paths[2].id));
        assert_eq!(
            plan.queue_positions,
            vec![(paths[0].id, 0), (paths[1].id, 0), (paths[2].id, 1)]
        );
    }

    #[test]
    fn test_plan_approval_last_hop_completes() {
        let mut paths = make_chain(2);
        paths[0].approval = PathApproval::Approved;
        paths[1].frontier_rank = FRONTIER_ACTIVE;

        let plan = plan_approval(&paths, &paths[1]);

        assert!(plan.completes());
        assert_eq!(plan.next_frontier_path_id, None);
        assert_eq!(
            plan.queue_positions,
            vec![(paths[0].id, 0), (paths[1].id, 0)]
        );
    }

    #[test]
    fn test_plan_approval_single_hop_chain() {
        let paths = make_chain(1);
        let plan = plan_approval(&paths, &paths[0]);

        assert!(plan.completes());
        assert_eq!(plan.next_frontier_path_id, None);
    }

    #[tokio::test]
    async fn test_evaluation_locks_serialize_same_evaluation() {
        let locks = EvaluationLocks::new();
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await;

        // same evaluation must block; a different one must not
        let other = Uuid::new_v4();
        let other_guard =
            tokio::time::timeout(std::time::Duration::from_millis(50), locks.acquire(other))
                .await
                .expect("independent evaluation should not block");
        drop(other_guard);

        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), locks.acquire(id)).await;
        assert!(blocked.is_err());

        drop(guard);
        let _reacquired = locks.acquire(id).await;
    }

    async fn setup_engine() -> (WorkflowEngine, Arc<InMemoryDirectory>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        let store = Store::new(pool);
        store.migrate().await.expect("Failed to run migrations");

        let directory = Arc::new(InMemoryDirectory::new());
        let engine = WorkflowEngine::new(store, directory.clone(), Arc::new(NullDispatcher));
        (engine, directory)
    }

    #[tokio::test]
    async fn test_create_evaluation_empty_chain() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;
        directory.register("s@example.com").await;

        let result = engine
            .create_evaluation("r@example.com", "s@example.com", &[])
            .await;
        assert!(matches!(
            result.unwrap_err(),
            WorkflowError::InvalidChain(_)
        ));
    }

    #[tokio::test]
    async fn test_create_evaluation_duplicate_intermediary() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;
        directory.register("s@example.com").await;
        directory.register("a@example.com").await;

        let chain = vec!["a@example.com".to_string(), "a@example.com".to_string()];
        let result = engine
            .create_evaluation("r@example.com", "s@example.com", &chain)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            WorkflowError::InvalidChain(_)
        ));
    }

    #[tokio::test]
    async fn test_create_evaluation_unknown_email() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;

        let chain = vec!["a@example.com".to_string()];
        let result = engine
            .create_evaluation("r@example.com", "missing@example.com", &chain)
            .await;
        assert!(matches!(
            result.unwrap_err(),
            WorkflowError::IdentityNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_approve_unknown_intermediary_email() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;
        directory.register("s@example.com").await;
        directory.register("a@example.com").await;

        let chain = vec!["a@example.com".to_string()];
        let evaluation = engine
            .create_evaluation("r@example.com", "s@example.com", &chain)
            .await
            .unwrap();

        let result = engine.approve(evaluation.id, "ghost@example.com").await;
        assert!(matches!(
            result.unwrap_err(),
            WorkflowError::IntermediaryNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_approve_unknown_evaluation() {
        let (engine, directory) = setup_engine().await;
        directory.register("a@example.com").await;

        let result = engine.approve(Uuid::new_v4(), "a@example.com").await;
        assert!(matches!(
            result.unwrap_err(),
            WorkflowError::EvaluationNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_approve_emits_events() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;
        directory.register("s@example.com").await;
        directory.register("a@example.com").await;
        let mut rx = engine.subscribe();

        let chain = vec!["a@example.com".to_string()];
        let evaluation = engine
            .create_evaluation("r@example.com", "s@example.com", &chain)
            .await
            .unwrap();
        engine.approve(evaluation.id, "a@example.com").await.unwrap();

        match rx.try_recv().unwrap() {
            WorkflowEvent::EvaluationCreated {
                evaluation_id,
                chain_length,
                ..
            } => {
                assert_eq!(evaluation_id, evaluation.id);
                assert_eq!(chain_length, 1);
            }
            other => panic!("Expected EvaluationCreated, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkflowEvent::HopApproved { position: 1, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkflowEvent::EvaluationCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_locks_dropped_once_evaluation_is_terminal() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;
        directory.register("s@example.com").await;
        directory.register("a@example.com").await;
        directory.register("b@example.com").await;

        let chain = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        let evaluation = engine
            .create_evaluation("r@example.com", "s@example.com", &chain)
            .await
            .unwrap();

        // a non-terminal approval keeps the lock entry around
        engine.approve(evaluation.id, "a@example.com").await.unwrap();
        assert!(engine.locks.inner.read().await.contains_key(&evaluation.id));

        // the terminal transition drops it
        engine.reject(evaluation.id, "b@example.com").await.unwrap();
        assert!(!engine.locks.inner.read().await.contains_key(&evaluation.id));
    }

    #[tokio::test]
    async fn test_locks_dropped_after_completion() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;
        directory.register("s@example.com").await;
        directory.register("a@example.com").await;

        let chain = vec!["a@example.com".to_string()];
        let evaluation = engine
            .create_evaluation("r@example.com", "s@example.com", &chain)
            .await
            .unwrap();

        engine.approve(evaluation.id, "a@example.com").await.unwrap();
        assert!(engine.locks.inner.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reject_emits_interrupted_event() {
        let (engine, directory) = setup_engine().await;
        directory.register("r@example.com").await;
        directory.register("s@example.com").await;
        directory.register("a@example.com").await;
        let mut rx = engine.subscribe();

        let chain = vec!["a@example.com".to_string()];
        let evaluation = engine
            .create_evaluation("r@example.com", "s@example.com", &chain)
            .await
            .unwrap();
        engine.reject(evaluation.id, "a@example.com").await.unwrap();

        let _ = rx.try_recv(); // created
        match rx.try_recv().unwrap() {
            WorkflowEvent::EvaluationRejected { interrupted, .. } => assert!(interrupted),
            other => panic!("Expected EvaluationRejected, got {:?}", other),
        }
    }
}
