use thiserror::Error;

use crate::db::StoreError;
use crate::ingestion::ledger_reader::ReaderError;

/// Failures that abort a pipeline cycle.
///
/// Everything else (undecodable transactions, copy rejections, failed
/// submissions) is handled inside the cycle and never surfaces here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("chain read failed: {0}")]
    Chain(#[from] ReaderError),

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),
}

impl PipelineError {
    /// Only exhausted endpoints and failed persistence warrant paging an operator.
    pub fn is_alerting(&self) -> bool {
        match self {
            PipelineError::Chain(e) => e.is_node_unavailable(),
            PipelineError::PersistenceFailure(_) => true,
        }
    }
}
