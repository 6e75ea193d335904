pub mod ledger;

pub use ledger::{SharedLedger, TraderLedger};
