use std::fmt;

use thiserror::Error;

/// How a statement carried by a query request is to be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementType {
    /// Executed immediately; the first rows ride along with the metadata.
    Plain,
    /// Described first, then executed with bound parameters.
    Prepared,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    #[error("unknown statement type code {0}")]
    UnknownType(i32),
}

impl StatementType {
    pub const fn code(self) -> i32 {
        match self {
            StatementType::Plain => 1,
            StatementType::Prepared => 2,
        }
    }
}

impl TryFrom<i32> for StatementType {
    type Error = StatementError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StatementType::Plain),
            2 => Ok(StatementType::Prepared),
            code => Err(StatementError::UnknownType(code)),
        }
    }
}

impl From<StatementType> for i32 {
    fn from(value: StatementType) -> Self {
        value.code()
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementType::Plain => write!(f, "statement"),
            StatementType::Prepared => write!(f, "prepared statement"),
        }
    }
}
