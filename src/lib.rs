pub mod cli;
pub mod config;
pub mod errors;
pub mod market_data;
pub mod orders;
pub mod report;
pub mod schedule;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod trade;
pub mod trader;
pub mod utils;
