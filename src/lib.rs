pub mod app;
pub mod audit;
pub mod campaign;
pub mod checksum;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod output;
pub mod reconcile;
pub mod records;
pub mod store;
pub mod units;
