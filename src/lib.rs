//! pybox - Python code interpreter sessions multiplexed onto one Docker container.

pub mod config;
pub mod container;
pub mod coordinator;
pub mod current;
pub mod error;
pub mod http_server;
pub mod paths;
pub mod state;
pub mod tools;

pub use error::{Error, Result};
