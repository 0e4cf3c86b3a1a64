//! Side-effect dispatch on evaluation completion
//!
//! The engine invokes the dispatcher exactly once, after the transaction that
//! marks an evaluation completed has committed. Dispatcher failures are
//! logged by the engine and never roll back the completed state; retry is the
//! responsibility of an external queue.

use async_trait::async_trait;
use std::sync::Arc;

use crate::directory::Directory;
use crate::error::Result;
use crate::models::{Evaluation, Path};

/// Receives the completion notification for an evaluation
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Called once when an evaluation transitions to completed
    ///
    /// `chain` holds the evaluation's paths in ascending position.
    async fn on_evaluation_completed(&self, evaluation: &Evaluation, chain: &[Path])
        -> Result<()>;
}

/// Dispatcher that does nothing
///
/// For tests and embedders that handle completion side effects elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

#[async_trait]
impl Dispatcher for NullDispatcher {
    async fn on_evaluation_completed(&self, _: &Evaluation, _: &[Path]) -> Result<()> {
        Ok(())
    }
}

/// Dispatcher that records the requester/recipient connection in the directory
///
/// Strength is the chain length: a longer chain means a weaker introduction.
/// Chat-channel creation lives in the surrounding application; this dispatcher
/// only logs that the channel should be opened.
pub struct ChatDispatcher {
    directory: Arc<dyn Directory>,
}

impl ChatDispatcher {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Dispatcher for ChatDispatcher {
    async fn on_evaluation_completed(
        &self,
        evaluation: &Evaluation,
        chain: &[Path],
    ) -> Result<()> {
        let strength = chain.len() as u32;
        self.directory
            .record_approved_connection(evaluation.requester_id, evaluation.recipient_id, strength)
            .await?;
        tracing::info!(
            evaluation_id = %evaluation.id,
            requester_id = %evaluation.requester_id,
            recipient_id = %evaluation.recipient_id,
            strength,
            "evaluation completed, chat channel requested"
        );
        Ok(())
    }
}
