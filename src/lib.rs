pub mod assembler;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod registry;
pub mod server;
pub mod state;
pub mod storage;
pub mod utils;
