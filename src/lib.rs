pub mod access;
pub mod backend;
pub mod broker;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod task;
