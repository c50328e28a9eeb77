use std::io::{self, Write as _};

use flate2::{Compression, Decompress, FlushDecompress, Status, write::GzEncoder};
use snafu::Snafu;

use crate::sink::{OutStream, SinkError, StreamClosedSnafu};

/// Window size passed to the inflater; the gzip wrapping adds full
/// headers/trailers on top.
const WINDOW_BITS: u8 = 15;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const EMPTY_BLOCK: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[derive(Debug, Snafu)]
pub enum InflateError {
    #[snafu(display("compressed stream is corrupt and no sync marker follows"))]
    Corrupt,
}

/// A compressing wrapper around another [`OutStream`].
///
/// The connection preface passes through to the inner stream uncompressed,
/// so a peer can inspect the text header before the gzip stream starts;
/// everything after deflates into a single gzip member which `close`
/// finishes.
pub struct ZlibStream<S: OutStream> {
    encoder: Option<GzEncoder<SinkWriter<S>>>,
    dest: String,
    header_passed: bool,
}

struct SinkWriter<S> {
    sink: S,
}

impl<S: OutStream> io::Write for SinkWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write(buf, &[]).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: OutStream> ZlibStream<S> {
    pub fn new(inner: S) -> Self {
        let dest = format!("gzip+{}", inner.dest());
        Self {
            encoder: Some(GzEncoder::new(
                SinkWriter { sink: inner },
                Compression::default(),
            )),
            dest,
            header_passed: false,
        }
    }
}

impl<S: OutStream> OutStream for ZlibStream<S> {
    fn write(&mut self, data: &[u8], header: &[u8]) -> Result<usize, SinkError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return StreamClosedSnafu {
                dest: self.dest.clone(),
            }
            .fail();
        };
        if !self.header_passed && !header.is_empty() {
            encoder.get_mut().sink.write(&[], header)?;
            self.header_passed = true;
        }
        encoder.write_all(data).map_err(|source| SinkError::Write {
            dest: self.dest.clone(),
            source,
        })?;
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(encoder) = self.encoder.take() {
            let mut writer = encoder.finish().map_err(|source| SinkError::Close {
                dest: self.dest.clone(),
                source,
            })?;
            writer.sink.close()?;
        }
        Ok(())
    }

    fn dest(&self) -> &str {
        &self.dest
    }
}

/// Finds the next resynchronisation point: the first of a gzip member magic
/// (`1F 8B`) or an empty-block marker (`00 00 FF FF`), whichever comes
/// first.
pub fn find_sync(buf: &[u8]) -> Option<usize> {
    let gzip = buf
        .windows(GZIP_MAGIC.len())
        .position(|w| w == GZIP_MAGIC.as_slice());
    let block = buf
        .windows(EMPTY_BLOCK.len())
        .position(|w| w == EMPTY_BLOCK.as_slice());
    match (gzip, block) {
        (Some(g), Some(b)) => Some(g.min(b)),
        (Some(g), None) => Some(g),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Inflates a possibly damaged gzip byte stream into `out`.
///
/// Concatenated members decode back to back. On a data error the input is
/// scanned for the next sync marker: a gzip magic starts a fresh member, an
/// empty-block marker resumes raw deflate at that flush point. Returns the
/// number of resynchronisations performed; fails only when nothing could be
/// decoded at all.
pub fn inflate(input: &[u8], out: &mut Vec<u8>) -> Result<usize, InflateError> {
    let mut decoder = Decompress::new_gzip(WINDOW_BITS);
    let mut chunk = vec![0u8; 16 * 1024];
    let mut pos = 0usize;
    let mut resyncs = 0usize;
    let mut produced_any = false;

    while pos < input.len() {
        let before_in = decoder.total_in();
        let before_out = decoder.total_out();
        let result = decoder.decompress(&input[pos..], &mut chunk, FlushDecompress::None);
        let consumed = usize::try_from(decoder.total_in() - before_in).unwrap_or(0);
        let emitted = usize::try_from(decoder.total_out() - before_out).unwrap_or(0);
        pos += consumed;
        out.extend_from_slice(&chunk[..emitted]);
        if emitted > 0 {
            produced_any = true;
        }

        match result {
            Ok(Status::StreamEnd) => {
                if pos < input.len() {
                    decoder = Decompress::new_gzip(WINDOW_BITS);
                }
            }
            Ok(Status::Ok | Status::BufError) => {
                if consumed == 0 && emitted == 0 {
                    // Input exhausted mid-stream; whatever decoded stands.
                    break;
                }
            }
            Err(_) => {
                // When the failing position itself is a marker, skip past it
                // so the scan cannot land on the same spot forever.
                let search_from = if consumed == 0 { pos + 1 } else { pos };
                let Some(offset) = find_sync(&input[search_from.min(input.len())..]) else {
                    if produced_any {
                        break;
                    }
                    return CorruptSnafu.fail();
                };
                let at = search_from + offset;
                if input[at..].starts_with(&GZIP_MAGIC) {
                    decoder = Decompress::new_gzip(WINDOW_BITS);
                    pos = at;
                } else {
                    decoder = Decompress::new(false);
                    pos = at + EMPTY_BLOCK.len();
                }
                resyncs += 1;
                warn!(
                    message = "Resynchronised damaged compressed stream.",
                    offset = %at,
                );
            }
        }
    }

    Ok(resyncs)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use flate2::{Compression, write::GzEncoder};

    use super::{ZlibStream, find_sync, inflate};
    use crate::sink::OutStream as _;
    use crate::test_util::MockSink;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn find_sync_prefers_the_earlier_marker() {
        let gzip_first = [0x00, 0x1f, 0x8b, 0x00, 0x00, 0x00, 0xff, 0xff];
        assert_eq!(find_sync(&gzip_first), Some(1));

        let block_first = [0x00, 0x00, 0x00, 0xff, 0xff, 0x1f, 0x8b];
        assert_eq!(find_sync(&block_first), Some(1));

        assert_eq!(find_sync(&[0xaa; 32]), None);
    }

    #[test]
    fn inflate_round_trips_a_clean_stream() {
        let mut out = Vec::new();
        let resyncs = inflate(&gzip(b"one measurement per line\n"), &mut out).unwrap();
        assert_eq!(resyncs, 0);
        assert_eq!(out, b"one measurement per line\n");
    }

    #[test]
    fn inflate_decodes_concatenated_members() {
        let mut stream = gzip(b"first|");
        stream.extend_from_slice(&gzip(b"second"));

        let mut out = Vec::new();
        let resyncs = inflate(&stream, &mut out).unwrap();
        assert_eq!(resyncs, 0);
        assert_eq!(out, b"first|second");
    }

    #[test]
    fn inflate_resyncs_past_garbage() {
        let mut stream = vec![0xaa; 64];
        stream.extend_from_slice(&gzip(b"recovered"));

        let mut out = Vec::new();
        let resyncs = inflate(&stream, &mut out).unwrap();
        assert!(resyncs >= 1);
        assert_eq!(out, b"recovered");
    }

    #[test]
    fn inflate_fails_when_nothing_decodes() {
        let mut out = Vec::new();
        assert!(inflate(&[0xaa; 64], &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn stream_passes_header_through_uncompressed() {
        let sink = MockSink::new();
        let state = sink.state();
        let mut stream = ZlibStream::new(sink);

        stream.write(b"sample data, quite repetitive, quite repetitive", b"preface\n").unwrap();
        stream.write(b" and more samples", b"preface\n").unwrap();
        stream.close().unwrap();

        let observed = state.observed();
        assert!(observed.starts_with(b"preface\n"));

        let mut out = Vec::new();
        let resyncs = inflate(&observed[b"preface\n".len()..], &mut out).unwrap();
        assert_eq!(resyncs, 0);
        assert_eq!(
            out,
            b"sample data, quite repetitive, quite repetitive and more samples"
        );
    }
}
