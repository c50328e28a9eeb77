use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

/// The type tag of a measurement value.
///
/// `Long` is the legacy 32-bit integer tag kept for old injection points;
/// new streams use the explicitly sized tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Long,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Bool,
    Guid,
    String,
    Blob,
    VectorDouble,
    VectorInt32,
    VectorUInt32,
    VectorInt64,
    VectorUInt64,
    VectorBool,
}

pub const ALL_KINDS: [ValueKind; 16] = [
    ValueKind::Long,
    ValueKind::Int32,
    ValueKind::UInt32,
    ValueKind::Int64,
    ValueKind::UInt64,
    ValueKind::Double,
    ValueKind::Bool,
    ValueKind::Guid,
    ValueKind::String,
    ValueKind::Blob,
    ValueKind::VectorDouble,
    ValueKind::VectorInt32,
    ValueKind::VectorUInt32,
    ValueKind::VectorInt64,
    ValueKind::VectorUInt64,
    ValueKind::VectorBool,
];

impl ValueKind {
    /// The canonical text name, as used in schema declarations and the
    /// metadata sidecar.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Guid => "guid",
            Self::String => "string",
            Self::Blob => "blob",
            Self::VectorDouble => "vector_double",
            Self::VectorInt32 => "vector_int32",
            Self::VectorUInt32 => "vector_uint32",
            Self::VectorInt64 => "vector_int64",
            Self::VectorUInt64 => "vector_uint64",
            Self::VectorBool => "vector_bool",
        }
    }

    pub fn is_vector(self) -> bool {
        matches!(
            self,
            Self::VectorDouble
                | Self::VectorInt32
                | Self::VectorUInt32
                | Self::VectorInt64
                | Self::VectorUInt64
                | Self::VectorBool
        )
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Snafu)]
pub enum KindError {
    #[snafu(display("unknown value kind {name:?}"))]
    UnknownKind { name: String },
}

impl FromStr for ValueKind {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "long" => Self::Long,
            "int32" => Self::Int32,
            "uint32" => Self::UInt32,
            "int64" => Self::Int64,
            "uint64" => Self::UInt64,
            "double" => Self::Double,
            "bool" => Self::Bool,
            "guid" => Self::Guid,
            "string" => Self::String,
            "blob" => Self::Blob,
            "vector_double" => Self::VectorDouble,
            "vector_int32" => Self::VectorInt32,
            "vector_uint32" => Self::VectorUInt32,
            "vector_int64" => Self::VectorInt64,
            "vector_uint64" => Self::VectorUInt64,
            "vector_bool" => Self::VectorBool,
            other => return UnknownKindSnafu { name: other }.fail(),
        })
    }
}

/// One measurement value, tagged with its kind.
///
/// The kind of a value must match the kind of the schema column it is
/// inserted into; the database adapter enforces this per row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Long(i32),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Bool(bool),
    Guid(u64),
    String(String),
    Blob(Vec<u8>),
    VectorDouble(Vec<f64>),
    VectorInt32(Vec<i32>),
    VectorUInt32(Vec<u32>),
    VectorInt64(Vec<i64>),
    VectorUInt64(Vec<u64>),
    VectorBool(Vec<bool>),
}

#[derive(Debug, Snafu)]
pub enum ValueParseError {
    #[snafu(display("invalid {kind} literal {text:?}"))]
    BadLiteral { kind: ValueKind, text: String },
    #[snafu(display("invalid base64 blob: {source}"))]
    BadBlob { source: base64::DecodeError },
    #[snafu(display("invalid {kind} array: {source}"))]
    BadVector {
        kind: ValueKind,
        source: serde_json::Error,
    },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Long(_) => ValueKind::Long,
            Self::Int32(_) => ValueKind::Int32,
            Self::UInt32(_) => ValueKind::UInt32,
            Self::Int64(_) => ValueKind::Int64,
            Self::UInt64(_) => ValueKind::UInt64,
            Self::Double(_) => ValueKind::Double,
            Self::Bool(_) => ValueKind::Bool,
            Self::Guid(_) => ValueKind::Guid,
            Self::String(_) => ValueKind::String,
            Self::Blob(_) => ValueKind::Blob,
            Self::VectorDouble(_) => ValueKind::VectorDouble,
            Self::VectorInt32(_) => ValueKind::VectorInt32,
            Self::VectorUInt32(_) => ValueKind::VectorUInt32,
            Self::VectorInt64(_) => ValueKind::VectorInt64,
            Self::VectorUInt64(_) => ValueKind::VectorUInt64,
            Self::VectorBool(_) => ValueKind::VectorBool,
        }
    }

    /// Decodes the text-protocol representation of a value of `kind`.
    ///
    /// Scalars use their plain literal form, booleans accept `0`/`1` as well
    /// as `true`/`false`, blobs are base64, and vectors are JSON arrays.
    pub fn parse_text(kind: ValueKind, text: &str) -> Result<Self, ValueParseError> {
        fn scalar<T: FromStr>(kind: ValueKind, text: &str) -> Result<T, ValueParseError> {
            text.parse().ok().context(BadLiteralSnafu { kind, text })
        }

        Ok(match kind {
            ValueKind::Long => Self::Long(scalar(kind, text)?),
            ValueKind::Int32 => Self::Int32(scalar(kind, text)?),
            ValueKind::UInt32 => Self::UInt32(scalar(kind, text)?),
            ValueKind::Int64 => Self::Int64(scalar(kind, text)?),
            ValueKind::UInt64 => Self::UInt64(scalar(kind, text)?),
            ValueKind::Double => Self::Double(scalar(kind, text)?),
            ValueKind::Guid => Self::Guid(scalar(kind, text)?),
            ValueKind::Bool => Self::Bool(match text {
                "0" => false,
                "1" => true,
                other => scalar(kind, other)?,
            }),
            ValueKind::String => Self::String(text.to_owned()),
            ValueKind::Blob => Self::Blob(BASE64.decode(text).context(BadBlobSnafu)?),
            ValueKind::VectorDouble => {
                Self::VectorDouble(serde_json::from_str(text).context(BadVectorSnafu { kind })?)
            }
            ValueKind::VectorInt32 => {
                Self::VectorInt32(serde_json::from_str(text).context(BadVectorSnafu { kind })?)
            }
            ValueKind::VectorUInt32 => {
                Self::VectorUInt32(serde_json::from_str(text).context(BadVectorSnafu { kind })?)
            }
            ValueKind::VectorInt64 => {
                Self::VectorInt64(serde_json::from_str(text).context(BadVectorSnafu { kind })?)
            }
            ValueKind::VectorUInt64 => {
                Self::VectorUInt64(serde_json::from_str(text).context(BadVectorSnafu { kind })?)
            }
            ValueKind::VectorBool => {
                Self::VectorBool(serde_json::from_str(text).context(BadVectorSnafu { kind })?)
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn json<T: Serialize>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            match serde_json::to_string(items) {
                Ok(text) => f.write_str(&text),
                Err(_) => Err(fmt::Error),
            }
        }

        match self {
            Self::Long(v) | Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) | Self::Guid(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{}", u8::from(*v)),
            Self::String(v) => f.write_str(v),
            Self::Blob(v) => f.write_str(&BASE64.encode(v)),
            Self::VectorDouble(v) => json(f, v),
            Self::VectorInt32(v) => json(f, v),
            Self::VectorUInt32(v) => json(f, v),
            Self::VectorInt64(v) => json(f, v),
            Self::VectorUInt64(v) => json(f, v),
            Self::VectorBool(v) => json(f, v),
        }
    }
}
