use std::collections::VecDeque;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::Mutex;

use crate::clock::Sleeper;
use crate::db::Store;
use crate::models::{short, ReplicationOrder, SubmissionResult};
use crate::polymarket::{OrderSubmitter, UnsignedOrder};

use super::retry::RetryPolicy;

/// Dry-run orders kept for inspection; older ones are dropped.
pub const SIMULATED_HISTORY: usize = 256;

/// Hands replication orders to the signing collaborator.
///
/// Dry-run orders never reach the network; the latest `SIMULATED_HISTORY`
/// are kept in memory and all are reported as accepted. Live orders are
/// retried on transient failures per the `RetryPolicy`, and the final
/// outcome is always a `SubmissionResult`, never an error that could stall
/// the pipeline.
pub struct ExecutionGateway {
    submitter: Option<Arc<dyn OrderSubmitter>>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    store: Arc<dyn Store>,
    simulated: Mutex<VecDeque<ReplicationOrder>>,
}

impl ExecutionGateway {
    pub fn new(
        submitter: Option<Arc<dyn OrderSubmitter>>,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            submitter,
            retry,
            sleeper,
            store,
            simulated: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent orders accepted in dry-run mode, oldest first.
    pub async fn simulated(&self) -> Vec<ReplicationOrder> {
        self.simulated.lock().await.iter().cloned().collect()
    }

    pub async fn submit(&self, order: &ReplicationOrder) -> SubmissionResult {
        let result = self.dispatch(order).await;

        counter!("submissions_total", "result" => result.label()).increment(1);

        if let Err(e) = self.store.record_submission(order.id, &result).await {
            tracing::warn!(order_id = %order.id, error = %e, "Failed to record submission outcome");
        }

        result
    }

    async fn dispatch(&self, order: &ReplicationOrder) -> SubmissionResult {
        if order.dry_run {
            tracing::info!(
                order_id = %order.id,
                market = %order.market_id,
                side = %order.side,
                size = order.size,
                limit_price = %order.limit_price,
                "[DRY-RUN] Would submit replication order"
            );
            let mut simulated = self.simulated.lock().await;
            if simulated.len() == SIMULATED_HISTORY {
                simulated.pop_front();
            }
            simulated.push_back(order.clone());
            drop(simulated);
            return SubmissionResult::Accepted {
                tx_hash: None,
                attempts: 0,
            };
        }

        let Some(submitter) = &self.submitter else {
            tracing::error!(order_id = %order.id, "Live order but no signer configured");
            return SubmissionResult::Error {
                reason: "no signer configured".into(),
                attempts: 0,
            };
        };

        let unsigned = UnsignedOrder::from(order);
        let max_attempts = self.retry.max_attempts;

        for attempt in 1..=max_attempts {
            match submitter.sign_and_submit(&unsigned).await {
                Ok(tx_hash) => {
                    tracing::info!(
                        order_id = %order.id,
                        source = short(&order.source_address),
                        tx_hash = %tx_hash,
                        attempt,
                        "Replication order submitted"
                    );
                    return SubmissionResult::Accepted {
                        tx_hash: Some(tx_hash),
                        attempts: attempt,
                    };
                }
                Err(e) if !e.is_transient() => {
                    tracing::warn!(order_id = %order.id, error = %e, attempt, "Order rejected");
                    return SubmissionResult::Rejected {
                        reason: e.to_string(),
                        attempts: attempt,
                    };
                }
                Err(e) if attempt == max_attempts => {
                    tracing::error!(
                        order_id = %order.id,
                        error = %e,
                        attempts = attempt,
                        "Submission failed after final attempt"
                    );
                    return SubmissionResult::Error {
                        reason: e.to_string(),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        order_id = %order.id,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient submission failure, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1, so the loop always returns.
        SubmissionResult::Error {
            reason: "no attempts made".into(),
            attempts: 0,
        }
    }
}
