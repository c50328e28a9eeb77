//! Text-mode session decoding.
//!
//! A session opens with `key: value` header lines terminated by a blank
//! line, then streams one tab-separated tuple per line:
//!
//! ```text
//! protocol: 4
//! domain: trial42
//! start-time: 1700000000
//! sender-id: node7
//! app-name: probe
//! schema: 1 probe_radio rssi:int32 noise:double
//! content: text
//!
//! 1.5<TAB>1<TAB>42<TAB>-91<TAB>3.14
//! ```
//!
//! Binary mode and header negotiation are handled upstream of the
//! collector; only `content: text` arrives here.

use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::schema::{Schema, SchemaError};
use crate::value::{Value, ValueParseError};

/// Highest text-protocol version this collector understands.
pub const MAX_PROTOCOL: u32 = 4;

#[derive(Debug, Snafu)]
pub enum ProtocolError {
    #[snafu(display("header is missing the {key:?} line"))]
    MissingHeader { key: &'static str },
    #[snafu(display("malformed header line {line:?}"))]
    MalformedHeader { line: String },
    #[snafu(display("unsupported protocol version {version}"))]
    UnsupportedProtocol { version: u32 },
    #[snafu(display("unsupported content mode {content:?}"))]
    UnsupportedContent { content: String },
    #[snafu(display("malformed schema declaration {line:?}"))]
    BadSchemaIndex { line: String },
    #[snafu(display("bad schema declaration {line:?}: {source}"))]
    BadSchemaDeclaration { line: String, source: SchemaError },
    #[snafu(display("malformed tuple line {line:?}"))]
    MalformedTuple { line: String },
    #[snafu(display("tuple references undeclared schema {index}"))]
    UnknownSchemaIndex { index: u32 },
    #[snafu(display("tuple for {table:?} has {got} values, its schema has {expected}"))]
    TupleWidth {
        table: String,
        expected: usize,
        got: usize,
    },
    #[snafu(display("bad value for column {column:?}: {source}"))]
    BadValue {
        column: String,
        source: ValueParseError,
    },
}

/// The decoded session preface.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionHeader {
    pub protocol: u32,
    /// Experiment identifier; names the database everything lands in.
    pub domain: String,
    /// Client-side experiment epoch, unix seconds.
    pub start_time: f64,
    pub sender_id: String,
    pub app_name: String,
    /// Declared measurement streams, by wire index.
    pub schemas: BTreeMap<u32, Schema>,
}

impl SessionHeader {
    /// Decodes the header lines (everything before the blank line).
    pub fn parse<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self, ProtocolError> {
        let mut protocol = None;
        let mut domain = None;
        let mut start_time = None;
        let mut sender_id = None;
        let mut app_name = None;
        let mut content = None;
        let mut schemas = BTreeMap::new();

        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .context(MalformedHeaderSnafu { line })?;
            let value = value.trim();
            match key.trim() {
                "protocol" => {
                    protocol = Some(value.parse().ok().context(MalformedHeaderSnafu { line })?);
                }
                "domain" | "experiment-id" => domain = Some(value.to_owned()),
                "start-time" | "start_time" => {
                    start_time = Some(value.parse().ok().context(MalformedHeaderSnafu { line })?);
                }
                "sender-id" => sender_id = Some(value.to_owned()),
                "app-name" => app_name = Some(value.to_owned()),
                "content" => content = Some(value.to_owned()),
                "schema" => {
                    let (index, declaration) = value
                        .split_once(' ')
                        .context(BadSchemaIndexSnafu { line })?;
                    let index: u32 =
                        index.parse().ok().context(BadSchemaIndexSnafu { line })?;
                    let schema =
                        Schema::parse(declaration).context(BadSchemaDeclarationSnafu { line })?;
                    if schemas.insert(index, schema).is_some() {
                        warn!(
                            message = "Schema index declared twice; keeping the later one.",
                            index = %index,
                        );
                    }
                }
                other => {
                    warn!(message = "Ignoring unknown header.", key = %other);
                }
            }
        }

        let protocol = protocol.context(MissingHeaderSnafu { key: "protocol" })?;
        ensure!(
            (1..=MAX_PROTOCOL).contains(&protocol),
            UnsupportedProtocolSnafu { version: protocol }
        );
        let content = content.context(MissingHeaderSnafu { key: "content" })?;
        ensure!(content == "text", UnsupportedContentSnafu { content });

        Ok(Self {
            protocol,
            domain: domain.context(MissingHeaderSnafu { key: "domain" })?,
            start_time: start_time.context(MissingHeaderSnafu { key: "start-time" })?,
            sender_id: sender_id.context(MissingHeaderSnafu { key: "sender-id" })?,
            app_name: app_name.context(MissingHeaderSnafu { key: "app-name" })?,
            schemas,
        })
    }
}

/// One decoded measurement tuple.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuple {
    pub time: f64,
    pub schema_index: u32,
    pub seq_no: i32,
    pub values: Vec<Value>,
}

/// Reverses the string escaping of the tab-separated framing.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Decodes one tuple line against the declared schemas.
pub fn parse_tuple(
    line: &str,
    schemas: &BTreeMap<u32, Schema>,
) -> Result<Tuple, ProtocolError> {
    let mut parts = line.split('\t');
    let time: f64 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .context(MalformedTupleSnafu { line })?;
    let schema_index: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .context(MalformedTupleSnafu { line })?;
    let seq_no: i32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .context(MalformedTupleSnafu { line })?;

    let schema = schemas
        .get(&schema_index)
        .context(UnknownSchemaIndexSnafu {
            index: schema_index,
        })?;

    let fields: Vec<&str> = parts.collect();
    ensure!(
        fields.len() == schema.fields.len(),
        TupleWidthSnafu {
            table: schema.name.clone(),
            expected: schema.fields.len(),
            got: fields.len(),
        }
    );

    let mut values = Vec::with_capacity(fields.len());
    for (field, text) in schema.fields.iter().zip(fields) {
        let text = if field.kind == crate::value::ValueKind::String {
            unescape(text)
        } else {
            text.to_owned()
        };
        let value = Value::parse_text(field.kind, &text).context(BadValueSnafu {
            column: field.name.clone(),
        })?;
        values.push(value);
    }

    Ok(Tuple {
        time,
        schema_index,
        seq_no,
        values,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::{ProtocolError, SessionHeader, parse_tuple, unescape};
    use crate::schema::Schema;
    use crate::value::Value;

    const HEADER: &[&str] = &[
        "protocol: 4",
        "domain: trial42",
        "start-time: 1700000000",
        "sender-id: node7",
        "app-name: probe",
        "schema: 1 probe_radio rssi:int32 noise:double",
        "schema: 2 probe_gps lat:double lon:double note:string",
        "content: text",
    ];

    fn schemas() -> BTreeMap<u32, Schema> {
        SessionHeader::parse(HEADER.iter().copied()).unwrap().schemas
    }

    #[test]
    fn header_parses_and_indexes_schemas() {
        let header = SessionHeader::parse(HEADER.iter().copied()).unwrap();
        assert_eq!(header.protocol, 4);
        assert_eq!(header.domain, "trial42");
        assert_eq!(header.sender_id, "node7");
        assert_eq!(header.app_name, "probe");
        assert!((header.start_time - 1_700_000_000.0).abs() < f64::EPSILON);
        assert_eq!(header.schemas.len(), 2);
        assert_eq!(header.schemas[&1].name, "probe_radio");
        assert_eq!(header.schemas[&2].fields.len(), 3);
    }

    #[test]
    fn header_accepts_legacy_aliases_and_unknown_keys() {
        let lines = [
            "protocol: 3",
            "experiment-id: legacy",
            "start_time: 1600000000",
            "sender-id: a",
            "app-name: b",
            "x-custom: ignored",
            "content: text",
        ];
        let header = SessionHeader::parse(lines).unwrap();
        assert_eq!(header.domain, "legacy");
        assert_eq!(header.protocol, 3);
    }

    #[test]
    fn header_rejects_what_it_cannot_serve() {
        let missing = ["protocol: 4", "content: text"];
        assert!(matches!(
            SessionHeader::parse(missing),
            Err(ProtocolError::MissingHeader { key: "domain" })
        ));

        let mut binary: Vec<&str> = HEADER.to_vec();
        binary[7] = "content: binary";
        assert!(matches!(
            SessionHeader::parse(binary),
            Err(ProtocolError::UnsupportedContent { .. })
        ));

        let mut future: Vec<&str> = HEADER.to_vec();
        future[0] = "protocol: 9";
        assert!(matches!(
            SessionHeader::parse(future),
            Err(ProtocolError::UnsupportedProtocol { version: 9 })
        ));

        assert!(SessionHeader::parse(["no colon here"]).is_err());
    }

    #[test]
    fn tuple_decodes_against_its_schema() {
        let tuple = parse_tuple("1.5\t1\t42\t-91\t3.14", &schemas()).unwrap();
        assert_eq!(tuple.schema_index, 1);
        assert_eq!(tuple.seq_no, 42);
        assert!((tuple.time - 1.5).abs() < f64::EPSILON);
        assert_eq!(tuple.values, vec![Value::Int32(-91), Value::Double(3.14)]);
    }

    #[test]
    fn tuple_strings_are_unescaped() {
        let tuple = parse_tuple(
            "2.0\t2\t7\t-33.86\t151.21\tnear the\\ttower",
            &schemas(),
        )
        .unwrap();
        assert_eq!(
            tuple.values[2],
            Value::String("near the\ttower".into())
        );
    }

    #[test]
    fn unescape_round_trips_the_specials() {
        assert_eq!(unescape("a\\tb\\nc\\\\d"), "a\tb\nc\\d");
        assert_eq!(unescape("plain"), "plain");
        assert_eq!(unescape("trailing\\"), "trailing\\");
        assert_eq!(unescape("\\q"), "\\q");
    }

    #[test]
    fn bad_tuples_name_the_failure() {
        let schemas = schemas();
        assert!(matches!(
            parse_tuple("oops\t1\t1\t0\t0.0", &schemas),
            Err(ProtocolError::MalformedTuple { .. })
        ));
        assert!(matches!(
            parse_tuple("1.0\t9\t1\t0", &schemas),
            Err(ProtocolError::UnknownSchemaIndex { index: 9 })
        ));
        assert!(matches!(
            parse_tuple("1.0\t1\t1\t-91", &schemas),
            Err(ProtocolError::TupleWidth { got: 1, .. })
        ));
        assert!(matches!(
            parse_tuple("1.0\t1\t1\tNaN-ish\t0.0", &schemas),
            Err(ProtocolError::BadValue { .. })
        ));
    }
}
