pub mod config;
pub mod engine;
pub mod errors;
pub mod execution;
pub mod models;
pub mod positions;
pub mod signal;
pub mod state;
