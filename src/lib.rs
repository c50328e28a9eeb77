//! Server-side ingestion and persistence core for measurement streams.
//!
//! Injection points emit streams of typed measurement tuples annotated with
//! a schema; the collector validates each stream against its declared
//! schema, stamps server-side metadata, and durably persists tuples into a
//! relational backend organised per experiment — or proxies sessions
//! byte-for-byte to a downstream destination through the buffering pipeline
//! in `oml-buffers`.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate tracing;

pub mod config;
pub mod db;
mod internal_events;
pub mod schema;
pub mod server;
pub mod uri;
pub mod value;
