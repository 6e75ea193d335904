pub mod gamma_client;
pub mod market_data;
pub mod signer;

pub use gamma_client::GammaMarketData;
pub use market_data::{MarketData, MarketDataError, MarketSnapshot};
pub use signer::{HttpSigner, OrderSubmitter, SubmitError, UnsignedOrder};
