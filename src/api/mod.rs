//! HTTP clients for the futures exchange and the decision oracle.

mod binance_client;
mod oracle_client;
mod types;

pub use binance_client::BinanceClient;
pub use oracle_client::{ChatBackend, OracleClient, OracleError};
pub use types::*;
