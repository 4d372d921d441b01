pub mod agentgraph;
pub mod capability;
pub mod config;
pub mod error;
pub mod model;
pub mod stream;
pub mod tool;
pub mod trace;
pub mod wire;

pub use error::{Error, Result};
