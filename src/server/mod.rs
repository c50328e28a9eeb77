//! Session-facing server core.
//!
//! A [`Collector`] owns one [`Database`] per experiment domain, shared by
//! every session of that experiment behind a mutex. Each accepted
//! connection runs on its own thread, which is the sole owner of its
//! session state. Depending on configuration, sessions either persist
//! tuples into the backend or are proxied byte-for-byte to a downstream
//! collection URI through a [`BufferedWriter`].

pub mod protocol;

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::net;
use std::sync::Arc;

use oml_buffers::{BufferedWriter, FileStream, OutStream, SinkError, TcpStream, UdpStream};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};

use crate::config::CollectorConfig;
use crate::db::{Database, DbError, psql};
use crate::internal_events::{MalformedLine, RowDropped};
use crate::server::protocol::{ProtocolError, SessionHeader, parse_tuple};
use crate::uri::{CollectionUri, Scheme, UriError, resolve_service};

/// Default port for forwarded collection streams.
const DEFAULT_COLLECTION_PORT: u16 = 3003;

/// Data-lane bound of a proxy session's writer, in bytes.
const PROXY_QUEUE_CAPACITY: usize = 2 * 1024 * 1024;
const PROXY_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Snafu)]
pub enum SessionError {
    #[snafu(display("session I/O failed: {source}"))]
    SessionIo { source: std::io::Error },
    #[snafu(display("{source}"))]
    Header { source: ProtocolError },
    #[snafu(display("{source}"))]
    Storage { source: DbError },
    #[snafu(display("could not reach the forward destination: {source}"))]
    Forward { source: SinkError },
}

/// The shared server state: per-experiment databases, or the forward
/// destination when proxying.
pub struct Collector {
    config: CollectorConfig,
    forward: Option<CollectionUri>,
    databases: Mutex<HashMap<String, Arc<Mutex<Database>>>>,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Result<Self, UriError> {
        let forward = config
            .forward
            .as_deref()
            .map(CollectionUri::parse)
            .transpose()?;
        Ok(Self {
            config,
            forward,
            databases: Mutex::new(HashMap::new()),
        })
    }

    /// The database for `domain`, opened on first reference and shared by
    /// all of the experiment's sessions.
    fn database(&self, domain: &str) -> Result<Arc<Mutex<Database>>, DbError> {
        let mut databases = self.databases.lock();
        if let Some(database) = databases.get(domain) {
            return Ok(Arc::clone(database));
        }
        let adapter = psql::connect_database(&self.config.backend, domain)?;
        let database = Database::open(
            domain,
            Box::new(adapter),
            self.config.commit_interval(),
        )?;
        let database = Arc::new(Mutex::new(database));
        databases.insert(domain.to_owned(), Arc::clone(&database));
        Ok(database)
    }

    /// Closes every open database, committing outstanding transactions.
    ///
    /// Writers are per-session and close with their sessions, which happens
    /// before databases go away.
    pub fn shutdown(&self) {
        let mut databases = self.databases.lock();
        for (_, database) in databases.drain() {
            database.lock().close();
        }
    }

    /// Serves one client connection to completion.
    pub fn serve(&self, stream: net::TcpStream) {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string());
        info!(message = "Session opened.", peer = %peer);

        let result = match &self.forward {
            Some(uri) => proxy_session(stream, uri),
            None => self.persist_session(stream),
        };
        match result {
            Ok(rows) => info!(message = "Session closed.", peer = %peer, rows = %rows),
            Err(error) => warn!(message = "Session aborted.", peer = %peer, %error),
        }
    }

    fn persist_session(&self, stream: net::TcpStream) -> Result<u64, SessionError> {
        let mut reader = BufReader::new(stream);
        let header_lines = read_header_lines(&mut reader)?;
        let header = SessionHeader::parse(header_lines.iter().map(String::as_str))
            .context(HeaderSnafu)?;

        let database = self.database(&header.domain).context(StorageSnafu)?;
        let sender_id = {
            let mut database = database.lock();
            // A schema conflict rejects the whole session up front; rows
            // for a mismatched table would all be dropped anyway.
            for schema in header.schemas.values() {
                database.table(schema).context(StorageSnafu)?;
            }
            database
                .add_sender_id(&header.sender_id)
                .context(StorageSnafu)?
        };

        let mut rows = 0u64;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).context(SessionIoSnafu)? == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }

            let tuple = match parse_tuple(trimmed, &header.schemas) {
                Ok(tuple) => tuple,
                Err(error) => {
                    MalformedLine {
                        error: error.to_string(),
                    }
                    .emit();
                    continue;
                }
            };
            let table = &header.schemas[&tuple.schema_index].name;
            match database.lock().insert(
                table,
                sender_id,
                tuple.seq_no,
                tuple.time,
                &tuple.values,
            ) {
                Ok(()) => rows += 1,
                Err(error) => {
                    // Single-row failures never end the session.
                    RowDropped {
                        table: table.clone(),
                        error: error.to_string(),
                    }
                    .emit();
                }
            }
        }
        Ok(rows)
    }
}

/// Streams a session byte-for-byte to the forward destination: headers on
/// the meta lane, tuples on the data lane.
fn proxy_session(stream: net::TcpStream, uri: &CollectionUri) -> Result<u64, SessionError> {
    let sink = build_sink(uri).context(ForwardSnafu)?;
    let mut writer = BufferedWriter::new(sink, PROXY_QUEUE_CAPACITY, PROXY_CHUNK_SIZE);
    let mut reader = BufReader::new(stream);

    let mut in_header = true;
    let mut rows = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).context(SessionIoSnafu)? == 0 {
            break;
        }
        if in_header {
            writer.push_meta(line.as_bytes());
            if line.trim_end_matches(['\n', '\r']).is_empty() {
                in_header = false;
            }
        } else {
            writer.push(line.as_bytes());
            rows += 1;
        }
    }
    writer.close();
    Ok(rows)
}

/// Builds the sink for a collection URI; `tcp` is the default scheme.
pub(crate) fn build_sink(uri: &CollectionUri) -> Result<Box<dyn OutStream>, SinkError> {
    Ok(match uri.scheme {
        Some(Scheme::File) => Box::new(FileStream::open(&uri.host)?),
        Some(Scheme::FileFlush) => Box::new(FileStream::open_flush(&uri.host)?),
        Some(Scheme::Udp) => Box::new(UdpStream::connect(socket_dest(uri))?),
        Some(Scheme::Tcp) | None => Box::new(TcpStream::connect(socket_dest(uri))),
    })
}

fn socket_dest(uri: &CollectionUri) -> String {
    let port = uri
        .service
        .as_deref()
        .map_or(DEFAULT_COLLECTION_PORT, |service| {
            resolve_service(service, DEFAULT_COLLECTION_PORT)
        });
    if uri.host.contains(':') {
        format!("[{}]:{}", uri.host, port)
    } else {
        format!("{}:{}", uri.host, port)
    }
}

fn read_header_lines<R: BufRead>(reader: &mut R) -> Result<Vec<String>, SessionError> {
    let mut lines = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).context(SessionIoSnafu)? == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            break;
        }
        lines.push(trimmed.to_owned());
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::net::TcpListener;

    use super::{Collector, build_sink, socket_dest};
    use crate::config::CollectorConfig;
    use crate::uri::CollectionUri;

    #[test]
    fn socket_dest_defaults_and_brackets() {
        let uri = CollectionUri::parse("collector.example.com").unwrap();
        assert_eq!(socket_dest(&uri), "collector.example.com:3003");

        let uri = CollectionUri::parse("tcp:[::1]:5001").unwrap();
        assert_eq!(socket_dest(&uri), "[::1]:5001");
    }

    #[test]
    fn file_sinks_build_for_both_flavours() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let uri = CollectionUri::parse(&format!("file:{}", path.display())).unwrap();
        build_sink(&uri).unwrap();
        let uri = CollectionUri::parse(&format!("flush:{}", path.display())).unwrap();
        build_sink(&uri).unwrap();
    }

    // Full proxy path: socket in, buffered writer, file sink out.
    #[test]
    fn proxy_session_relays_header_and_tuples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forwarded");

        let config = CollectorConfig {
            forward: Some(format!("file:{}", path.display())),
            ..CollectorConfig::default()
        };
        let collector = Collector::new(config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut conn = std::net::TcpStream::connect(addr).unwrap();
            conn.write_all(
                b"protocol: 4\ndomain: t\nstart-time: 1\nsender-id: s\napp-name: a\n\
                  schema: 1 t_m v:int32\ncontent: text\n\n1.0\t1\t1\t5\n1.1\t1\t2\t6\n",
            )
            .unwrap();
        });

        let (stream, _) = listener.accept().unwrap();
        collector.serve(stream);
        client.join().unwrap();

        let forwarded = std::fs::read_to_string(&path).unwrap();
        assert!(forwarded.starts_with("protocol: 4\n"));
        // The header block arrives before any tuple, terminator included.
        let header_end = forwarded.find("\n\n").unwrap();
        assert!(forwarded[..header_end].contains("schema: 1 t_m v:int32"));
        assert!(forwarded.ends_with("1.0\t1\t1\t5\n1.1\t1\t2\t6\n"));
    }

    #[test]
    fn bad_forward_uri_is_rejected_at_construction() {
        let config = CollectorConfig {
            forward: Some(String::new()),
            ..CollectorConfig::default()
        };
        assert!(Collector::new(config).is_err());
    }
}
