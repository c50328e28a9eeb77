//! Buffered byte pipeline for measurement streams.
//!
//! This library decouples measurement producers from a possibly slow or
//! intermittently failing output sink: producers push bytes into a bounded,
//! chunked in-memory queue, and a background worker drains the queue into an
//! [`OutStream`]. The queue has two lanes: a *meta* lane carrying the
//! once-per-connection preface (never dropped, re-supplied to the sink on
//! every write so reconnecting sinks can re-emit it), and a *data* lane
//! carrying measurement records (oldest dropped on overflow).

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate tracing;

pub mod chunk;
mod internal_events;
pub mod sink;
#[cfg(test)]
mod test_util;
pub mod writer;
pub mod zlib;

pub use chunk::Chunk;
pub use sink::{FileStream, OutStream, SinkError, TcpStream, UdpStream};
pub use writer::{BufferedWriter, WriterState};
pub use zlib::{ZlibStream, find_sync, inflate};
