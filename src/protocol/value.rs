//! Typed cell values and their encoding inside a row batch.
//!
//! Column types use the JDBC type-code space. Non-null cells are written
//! back to back into the batch blob with the same big-endian, fixed-width
//! bincode configuration the rest of the crate uses; nulls never reach the
//! blob and are listed in the batch's sparse null index instead.
use std::fmt;

use bincode::config::{BigEndian, Configuration, Fixint};
use thiserror::Error;

pub(crate) fn cell_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Error)]
pub enum RowError {
    #[error("failed to encode cell: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode cell: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("column {column} of type {column_type} cannot hold {value:?}")]
    TypeMismatch {
        column: usize,
        column_type: ColumnType,
        value: Value,
    },

    #[error("column type {0} has no cell encoding")]
    Unsupported(ColumnType),

    #[error("row has {found} cells but the result has {expected} columns")]
    Width { expected: usize, found: usize },

    #[error("null cell index {index} is out of order or beyond {cells} cells")]
    NullIndex { index: u32, cells: usize },

    #[error("{rows} rows of {width} columns do not fit the batch data")]
    RowCount { rows: u32, width: usize },

    #[error("batch blob has {0} bytes left after the last cell")]
    TrailingBytes(usize),

    #[error("cannot read '{text}' as {column_type}")]
    Parse {
        column_type: ColumnType,
        text: String,
    },

    #[error("a single row needs {size} bytes but only {max} fit in a datagram")]
    RowTooLarge { size: usize, max: usize },
}

/// A column type code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Type of a null parameter.
    Null,
    Bit,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Float,
    Double,
    Numeric,
    Decimal,
    Char,
    #[default]
    Varchar,
    LongVarchar,
    Date,
    Time,
    Timestamp,
    Binary,
    VarBinary,
    LongVarBinary,
    Boolean,
    Other(i32),
}

impl ColumnType {
    pub const fn code(self) -> i32 {
        match self {
            ColumnType::Null => 0,
            ColumnType::Bit => -7,
            ColumnType::TinyInt => -6,
            ColumnType::SmallInt => 5,
            ColumnType::Integer => 4,
            ColumnType::BigInt => -5,
            ColumnType::Real => 7,
            ColumnType::Float => 6,
            ColumnType::Double => 8,
            ColumnType::Numeric => 2,
            ColumnType::Decimal => 3,
            ColumnType::Char => 1,
            ColumnType::Varchar => 12,
            ColumnType::LongVarchar => -1,
            ColumnType::Date => 91,
            ColumnType::Time => 92,
            ColumnType::Timestamp => 93,
            ColumnType::Binary => -2,
            ColumnType::VarBinary => -3,
            ColumnType::LongVarBinary => -4,
            ColumnType::Boolean => 16,
            ColumnType::Other(code) => code,
        }
    }
}

impl From<i32> for ColumnType {
    fn from(code: i32) -> Self {
        match code {
            0 => ColumnType::Null,
            -7 => ColumnType::Bit,
            -6 => ColumnType::TinyInt,
            5 => ColumnType::SmallInt,
            4 => ColumnType::Integer,
            -5 => ColumnType::BigInt,
            7 => ColumnType::Real,
            6 => ColumnType::Float,
            8 => ColumnType::Double,
            2 => ColumnType::Numeric,
            3 => ColumnType::Decimal,
            1 => ColumnType::Char,
            12 => ColumnType::Varchar,
            -1 => ColumnType::LongVarchar,
            91 => ColumnType::Date,
            92 => ColumnType::Time,
            93 => ColumnType::Timestamp,
            -2 => ColumnType::Binary,
            -3 => ColumnType::VarBinary,
            -4 => ColumnType::LongVarBinary,
            16 => ColumnType::Boolean,
            other => ColumnType::Other(other),
        }
    }
}

impl From<ColumnType> for i32 {
    fn from(value: ColumnType) -> Self {
        value.code()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Other(code) => write!(f, "OTHER({code})"),
            t => write!(f, "{}", format!("{t:?}").to_uppercase()),
        }
    }
}

/// A single cell.
///
/// Dates, times, timestamps and exact numerics travel in their canonical
/// text form, so no calendar or decimal arithmetic is needed here.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Decimal(String),
    Varchar(String),
    Date(String),
    Time(String),
    Timestamp(String),
    Binary(Vec<u8>),
}

pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Appends the cell to `out`. Nulls must be handled by the caller.
    pub(crate) fn encode_cell(
        &self,
        column: usize,
        column_type: ColumnType,
        out: &mut Vec<u8>,
    ) -> Result<(), RowError> {
        use ColumnType as T;

        match (column_type, self) {
            (T::Bit | T::Boolean, Value::Boolean(v)) => encode(v, out),
            (T::TinyInt, Value::TinyInt(v)) => encode(v, out),
            (T::SmallInt, Value::SmallInt(v)) => encode(v, out),
            (T::Integer, Value::Integer(v)) => encode(v, out),
            (T::BigInt, Value::BigInt(v)) => encode(v, out),
            (T::Real, Value::Real(v)) => encode(v, out),
            (T::Float | T::Double, Value::Double(v)) => encode(v, out),
            (T::Numeric | T::Decimal, Value::Decimal(v))
            | (T::Char | T::Varchar | T::LongVarchar, Value::Varchar(v))
            | (T::Date, Value::Date(v))
            | (T::Time, Value::Time(v))
            | (T::Timestamp, Value::Timestamp(v)) => encode(v, out),
            (T::Binary | T::VarBinary | T::LongVarBinary, Value::Binary(v)) => encode(v, out),
            (T::Null | T::Other(_), _) => Err(RowError::Unsupported(column_type)),
            (_, value) => Err(RowError::TypeMismatch {
                column,
                column_type,
                value: value.clone(),
            }),
        }
    }

    /// Reads one cell of `column_type` from the front of `bytes`, returning
    /// it with the number of bytes consumed.
    pub(crate) fn decode_cell(
        column_type: ColumnType,
        bytes: &[u8],
    ) -> Result<(Value, usize), RowError> {
        use ColumnType as T;

        Ok(match column_type {
            T::Bit | T::Boolean => map(decode::<bool>(bytes)?, Value::Boolean),
            T::TinyInt => map(decode::<i8>(bytes)?, Value::TinyInt),
            T::SmallInt => map(decode::<i16>(bytes)?, Value::SmallInt),
            T::Integer => map(decode::<i32>(bytes)?, Value::Integer),
            T::BigInt => map(decode::<i64>(bytes)?, Value::BigInt),
            T::Real => map(decode::<f32>(bytes)?, Value::Real),
            T::Float | T::Double => map(decode::<f64>(bytes)?, Value::Double),
            T::Numeric | T::Decimal => map(decode::<String>(bytes)?, Value::Decimal),
            T::Char | T::Varchar | T::LongVarchar => {
                map(decode::<String>(bytes)?, Value::Varchar)
            }
            T::Date => map(decode::<String>(bytes)?, Value::Date),
            T::Time => map(decode::<String>(bytes)?, Value::Time),
            T::Timestamp => map(decode::<String>(bytes)?, Value::Timestamp),
            T::Binary | T::VarBinary | T::LongVarBinary => {
                map(decode::<Vec<u8>>(bytes)?, Value::Binary)
            }
            T::Null | T::Other(_) => return Err(RowError::Unsupported(column_type)),
        })
    }

    /// Re-types a parameter received as text.
    pub fn parse(column_type: ColumnType, text: &str) -> Result<Value, RowError> {
        use ColumnType as T;

        let err = || RowError::Parse {
            column_type,
            text: text.to_string(),
        };

        Ok(match column_type {
            T::Null => Value::Null,
            T::Bit | T::Boolean => match text.trim().to_lowercase().as_str() {
                "true" | "1" => Value::Boolean(true),
                "false" | "0" => Value::Boolean(false),
                _ => return Err(err()),
            },
            T::TinyInt => Value::TinyInt(text.trim().parse().map_err(|_| err())?),
            T::SmallInt => Value::SmallInt(text.trim().parse().map_err(|_| err())?),
            T::Integer => Value::Integer(text.trim().parse().map_err(|_| err())?),
            T::BigInt => Value::BigInt(text.trim().parse().map_err(|_| err())?),
            T::Real => Value::Real(text.trim().parse().map_err(|_| err())?),
            T::Float | T::Double => Value::Double(text.trim().parse().map_err(|_| err())?),
            T::Numeric | T::Decimal => {
                text.trim().parse::<f64>().map_err(|_| err())?;
                Value::Decimal(text.trim().to_string())
            }
            T::Char | T::Varchar | T::LongVarchar => Value::Varchar(text.to_string()),
            T::Date => Value::Date(text.to_string()),
            T::Time => Value::Time(text.to_string()),
            T::Timestamp => Value::Timestamp(text.to_string()),
            T::Binary | T::VarBinary | T::LongVarBinary => {
                Value::Binary(hex::decode(text.trim()).map_err(|_| err())?)
            }
            T::Other(_) => return Err(RowError::Unsupported(column_type)),
        })
    }

    /// Text form used to carry a parameter, the inverse of [`Value::parse`].
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Binary(bytes) => hex::encode(bytes),
            other => other.to_string(),
        }
    }

    /// Best matching column type for a value.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Boolean(_) => ColumnType::Boolean,
            Value::TinyInt(_) => ColumnType::TinyInt,
            Value::SmallInt(_) => ColumnType::SmallInt,
            Value::Integer(_) => ColumnType::Integer,
            Value::BigInt(_) => ColumnType::BigInt,
            Value::Real(_) => ColumnType::Real,
            Value::Double(_) => ColumnType::Double,
            Value::Decimal(_) => ColumnType::Decimal,
            Value::Varchar(_) => ColumnType::Varchar,
            Value::Date(_) => ColumnType::Date,
            Value::Time(_) => ColumnType::Time,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::Binary(_) => ColumnType::VarBinary,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::TinyInt(v) => write!(f, "{v}"),
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v)
            | Value::Varchar(v)
            | Value::Date(v)
            | Value::Time(v)
            | Value::Timestamp(v) => write!(f, "{v}"),
            Value::Binary(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

fn encode<T: bincode::Encode>(value: &T, out: &mut Vec<u8>) -> Result<(), RowError> {
    let bytes = bincode::encode_to_vec(value, cell_config())?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<(T, usize), RowError> {
    Ok(bincode::decode_from_slice(bytes, cell_config())?)
}

fn map<T>((v, n): (T, usize), f: impl FnOnce(T) -> Value) -> (Value, usize) {
    (f(v), n)
}
