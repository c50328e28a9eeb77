use metrics::counter;

pub(crate) struct ChunkDropped {
    pub byte_size: usize,
    pub reason: &'static str,
}

impl ChunkDropped {
    pub(crate) fn emit(self) {
        warn!(
            message = "Data chunk dropped.",
            byte_size = %self.byte_size,
            reason = %self.reason,
        );
        counter!("buffer_discarded_chunks_total", "reason" => self.reason).increment(1);
        counter!("buffer_discarded_bytes_total", "reason" => self.reason)
            .increment(self.byte_size as u64);
    }
}

pub(crate) struct SinkWriteFailed {
    pub dest: String,
    pub error: String,
    pub dropped_bytes: usize,
}

impl SinkWriteFailed {
    pub(crate) fn emit(self) {
        error!(
            message = "Sink rejected write; discarding chunk.",
            dest = %self.dest,
            error = %self.error,
            dropped_bytes = %self.dropped_bytes,
        );
        counter!("sink_write_errors_total").increment(1);
        counter!("buffer_discarded_bytes_total", "reason" => "sink_error")
            .increment(self.dropped_bytes as u64);
    }
}
