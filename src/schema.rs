use std::fmt;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::value::{KindError, ValueKind};

/// Number of implicit metadata columns prefixed to every user table, not
/// counting the backend-assigned primary key.
pub const NMETA: usize = 4;

/// The implicit metadata columns, in insert order.
pub const METADATA_FIELDS: [(&str, ValueKind); NMETA] = [
    ("oml_sender_id", ValueKind::Int32),
    ("oml_seq", ValueKind::Int32),
    ("oml_ts_client", ValueKind::Double),
    ("oml_ts_server", ValueKind::Double),
];

/// One typed column of a measurement stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: ValueKind,
}

/// The ordered, named column list of one measurement stream.
///
/// Schemas are immutable once a table has been created for them; an incoming
/// stream whose schema differs from the stored one is a conflict, not an
/// evolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<Field>,
}

#[derive(Debug, PartialEq, Snafu)]
pub enum SchemaError {
    #[snafu(display("schema declaration is empty"))]
    Empty,
    #[snafu(display("invalid identifier {name:?}"))]
    InvalidName { name: String },
    #[snafu(display("malformed field token {token:?}"))]
    MalformedField { token: String },
    #[snafu(display("field {name:?}: {source}"))]
    FieldKind { name: String, source: KindError },
}

pub(crate) fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Result<Self, SchemaError> {
        let name = name.into();
        ensure!(valid_identifier(&name), InvalidNameSnafu { name });
        for field in &fields {
            ensure!(
                valid_identifier(&field.name),
                InvalidNameSnafu {
                    name: field.name.clone()
                }
            );
        }
        Ok(Self { name, fields })
    }

    /// Parses the schema text form `<name> <field>:<kind> ...`.
    ///
    /// This is the representation stored under the `table_<name>` metadata
    /// key and carried by the protocol `schema:` header.
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let mut tokens = text.split_whitespace();
        let name = tokens.next().context(EmptySnafu)?;

        let mut fields = Vec::new();
        for token in tokens {
            let (name, kind) = token
                .split_once(':')
                .context(MalformedFieldSnafu { token })?;
            ensure!(
                !name.is_empty() && !kind.is_empty(),
                MalformedFieldSnafu { token }
            );
            let kind = kind.parse().context(FieldKindSnafu { name })?;
            fields.push(Field {
                name: name.to_owned(),
                kind,
            });
        }

        Self::new(name, fields)
    }

    /// The metadata sidecar key this schema is stored under.
    pub fn metadata_key(&self) -> String {
        format!("table_{}", self.name)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for field in &self.fields {
            write!(f, " {}:{}", field.name, field.kind)?;
        }
        Ok(())
    }
}
