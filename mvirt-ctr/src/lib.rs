//! mvirt-ctr - container daemon library.
//!
//! Instance lifecycle, exec and migration sessions on top of an OCI
//! runtime. The binary in `main.rs` wires these together; integration
//! tests drive them with in-process fakes.

pub mod bundle;
pub mod config;
pub mod daemon;
pub mod error;
pub mod exec;
pub mod forkstart;
pub mod instance;
pub mod migration;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod watcher;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
