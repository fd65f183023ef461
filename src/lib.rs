pub mod api;
pub mod bootstrap;
pub mod browser;
pub mod config;
pub mod error;
pub mod retention;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod worker;
