use metrics::counter;

pub(crate) struct RowDropped {
    pub table: String,
    pub error: String,
}

impl RowDropped {
    pub(crate) fn emit(self) {
        warn!(
            message = "Row dropped.",
            table = %self.table,
            error = %self.error,
        );
        counter!("rows_dropped_total").increment(1);
    }
}

pub(crate) struct MalformedLine {
    pub error: String,
}

impl MalformedLine {
    pub(crate) fn emit(self) {
        warn!(message = "Malformed tuple line dropped.", error = %self.error);
        counter!("malformed_lines_total").increment(1);
    }
}
