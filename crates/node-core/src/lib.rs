//! Node Core - Foundation for the elastic training master
//!
//! Provides node identity and lifecycle types, master configuration,
//! error handling, and the constants shared by every master component.

pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod types;

pub use config::{MasterConfig, PlatformKind};
pub use error::{Error, Result};
pub use types::*;
