//! # cascade-bus
//!
//! Messaging substrate for cascade, built on NATS JetStream.
//!
//! Provides:
//! - A broker client with one role-specific consumer (notify, replay, worker)
//! - The dotted subject hierarchy used by every cascade component
//! - Sequence aggregation: reconstructing the state of a workflow run from
//!   its retained messages
//! - Duplicate-fenced publishing for idempotent dispatch

mod client;
mod error;
mod keyfile;
mod message;
mod result;
pub mod subjects;

pub use client::{BusClient, MessageBundle, Publication, SequenceHandler};
pub use error::BusError;
pub use keyfile::KeyFile;
pub use message::{Channel, MsgMeta};
pub use result::{ResultMsg, ResultStatus};
pub use subjects::{CHANNEL_NOTIFY, CHANNEL_REQUEST, SOURCE_EVENT_ID};
