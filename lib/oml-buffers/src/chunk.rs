use bytes::BytesMut;

/// A contiguous byte buffer with separate write, read, and flush positions.
///
/// `Chunk` is the queue element of the [`BufferedWriter`][crate::writer::BufferedWriter].
/// Bytes are appended at the write cursor, handed to the sink from the read
/// cursor, and the flush position trails the read cursor to record how much
/// of the chunk the sink has confirmed. A bounded chunk never grows past the
/// capacity it was created with; the meta lane uses an unbounded chunk so
/// preface headers can never be refused.
#[derive(Debug)]
pub struct Chunk {
    data: BytesMut,
    cap: Option<usize>,
    rd: usize,
    fill: usize,
}

impl Chunk {
    /// Creates a bounded chunk that accepts at most `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(cap),
            cap: Some(cap),
            rd: 0,
            fill: 0,
        }
    }

    /// Creates an unbounded chunk that grows on demand.
    pub fn growable() -> Self {
        Self {
            data: BytesMut::new(),
            cap: None,
            rd: 0,
            fill: 0,
        }
    }

    /// Appends as much of `buf` as fits, returning the number of bytes taken.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = buf.len().min(self.wr_remaining());
        self.data.extend_from_slice(&buf[..n]);
        n
    }

    /// Space left before the write cursor hits capacity.
    pub fn wr_remaining(&self) -> usize {
        match self.cap {
            Some(cap) => cap.saturating_sub(self.data.len()),
            None => usize::MAX,
        }
    }

    /// Unconsumed bytes, i.e. write cursor minus read cursor.
    pub fn len(&self) -> usize {
        self.data.len() - self.rd
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes ever written into the chunk.
    pub fn written(&self) -> usize {
        self.data.len()
    }

    /// The bytes between the read and write cursors.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.rd..]
    }

    /// The whole payload, including already-consumed bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Advances the read cursor after `n` bytes were handed to the sink.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unconsumed length; the drain loop only ever
    /// consumes what the sink reported written.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consumed past write cursor");
        self.rd += n;
    }

    /// Moves the flush position up to the read cursor once the sink call
    /// returned successfully.
    pub fn mark_flushed(&mut self) {
        self.fill = self.rd;
    }

    /// Position of the last confirmed flush.
    pub fn fill(&self) -> usize {
        self.fill
    }
}
