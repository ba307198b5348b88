pub mod config;
pub mod entity;
pub mod error;
pub mod executor;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod registry;
pub mod session;
pub mod status;
pub mod store;
pub mod tracker;

pub use error::{IntelError, Result};
