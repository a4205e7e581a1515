//! AMI extension monitor
//!
//! A client for the Asterisk Manager Interface (AMI) focused on extension
//! status monitoring: it keeps an authenticated TCP session to the switch,
//! correlates actions with their interleaved responses and events, and runs
//! a synchronization loop that diffs device states against a store and
//! publishes only what changed.
//!
//! ```text
//! Asterisk (AMI, TCP)
//!         |
//!         v
//!   FrameCodec (frames)
//!         |
//!         v
//!    Message (classify)
//!         |
//!     +---+----------+
//!     v              v
//! Correlator    EventRouter
//!     |              |
//!     v              v
//!  AmiClient --> ExtensionSynchronizer --> store / change sink
//! ```

pub mod ami;
pub mod config;
pub mod error;
pub mod monitor;

pub use ami::{AmiAction, AmiClient, CompletionPolicy, ConnectionState};
pub use config::{AmiConfig, Config, MonitorConfig, QueryStrategy, ReconnectConfig};
pub use error::{AmiError, AmiResult};
pub use monitor::{DeviceState, ExtensionStatus, ExtensionSynchronizer, StatusChange};
