pub mod config;
pub mod db;
pub mod market_api;
pub mod observability;
pub mod types;
