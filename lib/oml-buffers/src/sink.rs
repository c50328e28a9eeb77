use std::{
    fs::{File, OpenOptions},
    io::Write as _,
    net,
    path::Path,
};

use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SinkError {
    #[snafu(display("could not open {dest}: {source}"))]
    Open {
        dest: String,
        source: std::io::Error,
    },
    #[snafu(display("could not connect to {dest}: {source}"))]
    Connect {
        dest: String,
        source: std::io::Error,
    },
    #[snafu(display("write to {dest} failed: {source}"))]
    Write {
        dest: String,
        source: std::io::Error,
    },
    #[snafu(display("could not close {dest}: {source}"))]
    Close {
        dest: String,
        source: std::io::Error,
    },
    #[snafu(display("stream to {dest} is closed"))]
    StreamClosed { dest: String },
}

/// A byte sink at the downstream end of a [`BufferedWriter`][crate::writer::BufferedWriter].
///
/// `write` is handed the connection preface as `header` on every call, so
/// implementations that lose and re-establish their underlying transport can
/// re-emit it before any further data.
pub trait OutStream: Send {
    /// Writes `data`, preceded by `header` whenever the preface has not yet
    /// been emitted on the current connection.
    ///
    /// Returns the number of bytes of `data` written, which may be less than
    /// `data.len()`; the caller retains the unwritten suffix.
    fn write(&mut self, data: &[u8], header: &[u8]) -> Result<usize, SinkError>;

    /// Flushes and releases the underlying resources.
    fn close(&mut self) -> Result<(), SinkError>;

    /// Human-readable destination, for logging.
    fn dest(&self) -> &str;
}

impl<S: OutStream + ?Sized> OutStream for Box<S> {
    fn write(&mut self, data: &[u8], header: &[u8]) -> Result<usize, SinkError> {
        (**self).write(data, header)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }

    fn dest(&self) -> &str {
        (**self).dest()
    }
}

/// Appends to a local file; the `flush` variant syncs data to disk after
/// every write.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    dest: String,
    sync_per_write: bool,
    header_written: bool,
}

impl FileStream {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::open_inner(path.as_ref(), false)
    }

    /// Like [`FileStream::open`], but syncs to disk after every record.
    pub fn open_flush(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::open_inner(path.as_ref(), true)
    }

    fn open_inner(path: &Path, sync_per_write: bool) -> Result<Self, SinkError> {
        let dest = path.display().to_string();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(OpenSnafu { dest: dest.clone() })?;
        Ok(Self {
            file,
            dest,
            sync_per_write,
            header_written: false,
        })
    }
}

impl OutStream for FileStream {
    fn write(&mut self, data: &[u8], header: &[u8]) -> Result<usize, SinkError> {
        if !self.header_written && !header.is_empty() {
            self.file.write_all(header).context(WriteSnafu {
                dest: self.dest.clone(),
            })?;
            self.header_written = true;
        }
        let n = self.file.write(data).context(WriteSnafu {
            dest: self.dest.clone(),
        })?;
        if self.sync_per_write {
            self.file.sync_data().context(WriteSnafu {
                dest: self.dest.clone(),
            })?;
        }
        Ok(n)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.file.sync_all().context(CloseSnafu {
            dest: self.dest.clone(),
        })
    }

    fn dest(&self) -> &str {
        &self.dest
    }
}

/// A TCP sink that connects lazily and, after a write failure, reconnects on
/// the next write and re-emits the preface.
#[derive(Debug)]
pub struct TcpStream {
    dest: String,
    conn: Option<net::TcpStream>,
    header_written: bool,
}

impl TcpStream {
    /// Creates the sink; no connection is attempted until the first write.
    pub fn connect(dest: impl Into<String>) -> Self {
        Self {
            dest: dest.into(),
            conn: None,
            header_written: false,
        }
    }

    fn ensure_connected(&mut self) -> Result<(), SinkError> {
        if self.conn.is_none() {
            let conn = net::TcpStream::connect(&self.dest).context(ConnectSnafu {
                dest: self.dest.clone(),
            })?;
            // Measurement records are small; trade batching for latency.
            let _ = conn.set_nodelay(true);
            debug!(message = "Connected.", dest = %self.dest);
            self.conn = Some(conn);
            self.header_written = false;
        }
        Ok(())
    }
}

impl OutStream for TcpStream {
    fn write(&mut self, data: &[u8], header: &[u8]) -> Result<usize, SinkError> {
        self.ensure_connected()?;
        if !self.header_written && !header.is_empty() {
            let res = match self.conn.as_mut() {
                Some(conn) => conn.write_all(header),
                None => {
                    return StreamClosedSnafu {
                        dest: self.dest.clone(),
                    }
                    .fail();
                }
            };
            match res {
                Ok(()) => self.header_written = true,
                Err(source) => {
                    self.conn = None;
                    return Err(SinkError::Write {
                        dest: self.dest.clone(),
                        source,
                    });
                }
            }
        }
        let res = match self.conn.as_mut() {
            Some(conn) => conn.write(data),
            None => {
                return StreamClosedSnafu {
                    dest: self.dest.clone(),
                }
                .fail();
            }
        };
        match res {
            Ok(n) => Ok(n),
            Err(source) => {
                self.conn = None;
                Err(SinkError::Write {
                    dest: self.dest.clone(),
                    source,
                })
            }
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(conn) = self.conn.take() {
            conn.shutdown(net::Shutdown::Write).context(CloseSnafu {
                dest: self.dest.clone(),
            })?;
        }
        Ok(())
    }

    fn dest(&self) -> &str {
        &self.dest
    }
}

/// A UDP sink; the preface and every write become individual datagrams.
#[derive(Debug)]
pub struct UdpStream {
    socket: net::UdpSocket,
    dest: String,
    header_written: bool,
}

impl UdpStream {
    pub fn connect(dest: impl Into<String>) -> Result<Self, SinkError> {
        let dest = dest.into();
        let socket = net::UdpSocket::bind(("0.0.0.0", 0)).context(ConnectSnafu {
            dest: dest.clone(),
        })?;
        socket
            .connect(&dest)
            .context(ConnectSnafu { dest: dest.clone() })?;
        Ok(Self {
            socket,
            dest,
            header_written: false,
        })
    }
}

impl OutStream for UdpStream {
    fn write(&mut self, data: &[u8], header: &[u8]) -> Result<usize, SinkError> {
        if !self.header_written && !header.is_empty() {
            match self.socket.send(header) {
                Ok(_) => self.header_written = true,
                Err(source) => {
                    return Err(SinkError::Write {
                        dest: self.dest.clone(),
                        source,
                    });
                }
            }
        }
        match self.socket.send(data) {
            Ok(n) => Ok(n),
            Err(source) => {
                // A later successful send should be preceded by the preface
                // again; the receiver may have missed it.
                self.header_written = false;
                Err(SinkError::Write {
                    dest: self.dest.clone(),
                    source,
                })
            }
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn dest(&self) -> &str {
        &self.dest
    }
}
