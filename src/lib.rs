extern crate core;

pub mod analyzer;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod r#const;
pub mod errors;
pub mod evm;
pub mod logger;
pub mod mutation;
pub mod replay;
pub mod strategy;
