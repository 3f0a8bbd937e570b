pub mod api;
pub mod cli;
pub mod config;
pub mod errors;
pub mod instrument;
pub mod journal;
pub mod ledger;
pub mod orderbook;
pub mod orders;
pub mod recorder;
pub mod retry;
pub mod settlement;
pub mod state;
pub mod store;
pub mod trade;
pub mod utils;
