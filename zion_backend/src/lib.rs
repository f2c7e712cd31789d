pub mod agent;
pub mod analytics;
pub mod config;
pub mod conversation;
pub mod focus;
pub mod gateway;
pub mod guards;
pub mod interpreter;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod tools;
pub mod versioning;
