//! # cascade-worker
//!
//! The worker loop run by apps.
//!
//! A worker consumes request messages for one app, dispatches them to the
//! app's handlers, and keeps the broker's redelivery window extended while a
//! handler runs. Handlers publish their own success payloads; the worker
//! publishes a structured FAILURE result when a handler errors, then
//! acknowledges the request either way.

mod worker;

pub use worker::{App, Handler, Worker};
