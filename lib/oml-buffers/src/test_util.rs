//! Scripted sink double shared by the writer tests.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::sink::{OutStream, SinkError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkMode {
    /// Accept everything.
    Normal,
    /// Block inside `write` until the mode changes.
    Stalled,
    /// Reject every write, dropping the notional connection.
    Fail,
    /// Accept at most this many bytes per call.
    Partial(usize),
}

struct SinkInner {
    observed: Vec<u8>,
    mode: SinkMode,
    write_calls: usize,
    header_written: bool,
}

pub struct SinkState {
    inner: Mutex<SinkInner>,
    resumed: Condvar,
}

impl SinkState {
    /// Every byte the sink has accepted, headers included, in order.
    pub fn observed(&self) -> Vec<u8> {
        self.inner.lock().observed.clone()
    }

    pub fn write_calls(&self) -> usize {
        self.inner.lock().write_calls
    }

    pub fn set_mode(&self, mode: SinkMode) {
        self.inner.lock().mode = mode;
        self.resumed.notify_all();
    }
}

pub struct MockSink {
    state: Arc<SinkState>,
}

impl MockSink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SinkState {
                inner: Mutex::new(SinkInner {
                    observed: Vec::new(),
                    mode: SinkMode::Normal,
                    write_calls: 0,
                    header_written: false,
                }),
                resumed: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> Arc<SinkState> {
        Arc::clone(&self.state)
    }
}

impl OutStream for MockSink {
    fn write(&mut self, data: &[u8], header: &[u8]) -> Result<usize, SinkError> {
        let mut inner = self.state.inner.lock();
        while inner.mode == SinkMode::Stalled {
            self.state.resumed.wait(&mut inner);
        }
        inner.write_calls += 1;

        match inner.mode {
            SinkMode::Fail => {
                // The connection is notionally gone; a recovered sink will
                // want the preface again.
                inner.header_written = false;
                Err(SinkError::Write {
                    dest: "mock".into(),
                    source: std::io::Error::other("scripted failure"),
                })
            }
            SinkMode::Partial(limit) => {
                if !inner.header_written && !header.is_empty() {
                    inner.observed.extend_from_slice(header);
                    inner.header_written = true;
                }
                let n = data.len().min(limit);
                inner.observed.extend_from_slice(&data[..n]);
                Ok(n)
            }
            SinkMode::Normal | SinkMode::Stalled => {
                if !inner.header_written && !header.is_empty() {
                    inner.observed.extend_from_slice(header);
                    inner.header_written = true;
                }
                inner.observed.extend_from_slice(data);
                Ok(data.len())
            }
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn dest(&self) -> &str {
        "mock"
    }
}
