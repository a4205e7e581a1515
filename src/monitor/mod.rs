// src/monitor/mod.rs
pub mod status;
pub mod store;
pub mod synchronizer;

pub use status::{map_status_code, DeviceState, ExtensionStatus, StatusChange};
pub use store::{
    ChangeSink, ExtensionProvider, LogChangeSink, MemoryChangeSink, MemoryStatusStore,
    StaticProvider, StatusStore,
};
pub use synchronizer::{CyclePhase, CycleReport, ExtensionSynchronizer, StatusQuerier, SyncStats};
