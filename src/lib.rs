pub mod backtester;
pub mod commands;
pub mod config;
pub mod data_context;
pub mod engine;
pub mod indicators;
pub mod models;
pub mod performance;
pub mod scoring;
pub mod signals;
pub mod trading_rules;
