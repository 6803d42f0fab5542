#![forbid(unsafe_code)]

//! Command-line front end for the websocket terminal bridge.

pub mod cli;
pub mod error;
pub mod realm;

pub use cli::{Cli, run, run_from_env};
pub use error::{AppError, Result};
pub use realm::Realm;
