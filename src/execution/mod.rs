pub mod copy_engine;
pub mod order_executor;
pub mod position_sizer;
pub mod retry;
pub mod risk_manager;

pub use copy_engine::{CopyEngine, CopyEngineConfig, CopyOutcome, Rejection};
pub use order_executor::ExecutionGateway;
pub use retry::RetryPolicy;
pub use risk_manager::{ExposureLimits, PriceLimits};
