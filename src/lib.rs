//! # combox - Encrypted Sharding Across Cloud Sync Folders
//!
//! combox keeps one local directory (the combox directory) mirrored across N
//! node directories, each kept in sync with a different storage provider by
//! that provider's own agent. Every file is split into N contiguous ranges,
//! each range is encrypted and written to one node as `<path>.shard<K>`, so no
//! single provider holds a usable copy.
//!
//! Local changes are pushed out immediately. Remote changes are pulled in only
//! once all N node directories agree (quorum counters kept in the silo).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use combox::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(&Config::default_path())?;
//!     combox::runner::run(config).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Driving the monitors directly
//!
//! ```rust,ignore
//! use combox::events::{EventHandler, FsEvent};
//! use combox::runner::Monitors;
//! use combox::scheduler::ManualScheduler;
//!
//! let monitors = Monitors::new(&config, silo, Arc::new(ManualScheduler::new()))?;
//! monitors.combox.dispatch(&FsEvent::created(path, false))?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod paths;
pub mod runner;
pub mod scheduler;
pub mod silo;
pub mod utils;
pub mod watch;

// Re-export commonly used types and functions
pub use config::Config;
pub use error::{ComboxError, CryptoError, Result, SiloError};
pub use events::{EventHandler, FsEvent};
pub use monitor::{ComboxDirMonitor, MonitorContext, NodeDirMonitor};
pub use paths::PathMapper;
pub use silo::{CounterKind, Silo};

// vim: ts=4
