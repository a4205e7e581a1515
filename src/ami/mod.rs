// src/ami/mod.rs
pub mod action;
pub mod client;
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod message;
pub mod router;

pub use action::{ActionIdGenerator, AmiAction, CompletionPolicy};
pub use client::{AmiClient, ClientHealth};
pub use codec::{FrameCodec, RawFrame};
pub use connection::{AmiConnection, ConnectionState};
pub use correlator::{ActionResult, Correlator};
pub use message::{Message, MessageKind};
pub use router::EventRouter;
