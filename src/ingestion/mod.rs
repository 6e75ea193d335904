pub mod decoder;
pub mod head_listener;
pub mod ledger_reader;
pub mod pipeline;
pub mod rpc;

pub use decoder::TradeDecoder;
pub use ledger_reader::{LedgerReader, ReaderError};
pub use pipeline::{CycleReport, DriverState, PipelineConfig, PipelineDriver};
pub use rpc::{HttpTransport, RpcTransport};
