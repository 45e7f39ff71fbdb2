pub mod agent;
pub mod config;
pub mod db;
pub mod embedding;
pub mod errors;
pub mod knowledge;
pub mod llm;
pub mod logging;
pub mod server;
pub mod session;
pub mod sql;
