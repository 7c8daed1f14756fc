//! Wire messages of the lite query protocol.
//!
//! Every datagram starts with the same header, `u8 type | string queryID |
//! i32 sequenceNumber`, followed by a body specific to the message type.
use std::{fmt, net::SocketAddr};

use bytes::BytesMut;

use crate::statement::StatementType;

use super::{
    ProtocolError, RowBatch,
    codec::{BOOL_SIZE, INT_SIZE, Reader, Writer, string_len},
    value::ColumnType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    QueryRequest = 0,
    MetaData = 1,
    ExecuteQueryRequest = 2,
    ExecuteQueryResponse = 3,
    NextValuesRequest = 4,
    NextValuesResponse = 5,
    CloseRequest = 6,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::QueryRequest,
        MessageType::MetaData,
        MessageType::ExecuteQueryRequest,
        MessageType::ExecuteQueryResponse,
        MessageType::NextValuesRequest,
        MessageType::NextValuesResponse,
        MessageType::CloseRequest,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub statement_type: Option<StatementType>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub column_type: ColumnType,
    pub scale: i32,
    pub precision: i32,
    pub display_size: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaData {
    pub number_of_parameters: u32,
    pub columns: Vec<ColumnMetadata>,
    /// 1-based indices of the columns that may hold nulls.
    pub nullable_columns: Vec<u32>,
    /// First rows of a plain statement, sent along with the description.
    pub batch: Option<RowBatch>,
}

impl MetaData {
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub column_type: ColumnType,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    QueryRequest(QueryRequest),
    MetaData(MetaData),
    ExecuteQueryRequest(Vec<Parameter>),
    ExecuteQueryResponse(RowBatch),
    NextValuesRequest,
    NextValuesResponse(RowBatch),
    CloseRequest,
}

impl Payload {
    pub fn empty(kind: MessageType) -> Self {
        match kind {
            MessageType::QueryRequest => Payload::QueryRequest(QueryRequest::default()),
            MessageType::MetaData => Payload::MetaData(MetaData::default()),
            MessageType::ExecuteQueryRequest => Payload::ExecuteQueryRequest(Vec::new()),
            MessageType::ExecuteQueryResponse => {
                Payload::ExecuteQueryResponse(RowBatch::default())
            }
            MessageType::NextValuesRequest => Payload::NextValuesRequest,
            MessageType::NextValuesResponse => Payload::NextValuesResponse(RowBatch::default()),
            MessageType::CloseRequest => Payload::CloseRequest,
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Payload::QueryRequest(_) => MessageType::QueryRequest,
            Payload::MetaData(_) => MessageType::MetaData,
            Payload::ExecuteQueryRequest(_) => MessageType::ExecuteQueryRequest,
            Payload::ExecuteQueryResponse(_) => MessageType::ExecuteQueryResponse,
            Payload::NextValuesRequest => MessageType::NextValuesRequest,
            Payload::NextValuesResponse(_) => MessageType::NextValuesResponse,
            Payload::CloseRequest => MessageType::CloseRequest,
        }
    }
}

/// A protocol message.
///
/// Equality compares header and payload only; the address a message
/// arrived from is bookkeeping, not content.
#[derive(Debug, Clone)]
pub struct Message {
    pub query_id: Option<String>,
    pub sequence_number: Option<u32>,
    pub payload: Payload,
    origin: Option<SocketAddr>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.query_id == other.query_id
            && self.sequence_number == other.sequence_number
            && self.payload == other.payload
    }
}

impl Eq for Message {}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            query_id: None,
            sequence_number: None,
            payload: Payload::empty(kind),
            origin: None,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    pub fn origin(&self) -> Option<SocketAddr> {
        self.origin
    }

    pub fn set_header(&mut self, query_id: &str, sequence_number: u32) {
        match &mut self.query_id {
            Some(id) => {
                id.clear();
                id.push_str(query_id);
            }
            None => self.query_id = Some(query_id.to_string()),
        }
        self.sequence_number = Some(sequence_number);
    }

    /// The row batch carried by this message, if any.
    pub fn batch(&self) -> Option<&RowBatch> {
        match &self.payload {
            Payload::MetaData(m) => m.batch.as_ref(),
            Payload::ExecuteQueryResponse(b) | Payload::NextValuesResponse(b) => Some(b),
            _ => None,
        }
    }

    pub fn batch_mut(&mut self) -> Option<&mut RowBatch> {
        match &mut self.payload {
            Payload::MetaData(m) => m.batch.as_mut(),
            Payload::ExecuteQueryResponse(b) | Payload::NextValuesResponse(b) => Some(b),
            _ => None,
        }
    }

    /// Resets every field so the instance can be reused for another exchange.
    pub fn clean(&mut self) {
        self.query_id = None;
        self.sequence_number = None;
        self.origin = None;
        match &mut self.payload {
            Payload::QueryRequest(q) => *q = QueryRequest::default(),
            Payload::MetaData(m) => {
                m.number_of_parameters = 0;
                m.columns.clear();
                m.nullable_columns.clear();
                m.batch = None;
            }
            Payload::ExecuteQueryRequest(params) => params.clear(),
            Payload::ExecuteQueryResponse(b) | Payload::NextValuesResponse(b) => b.clear(),
            Payload::NextValuesRequest | Payload::CloseRequest => {}
        }
    }

    /// Checks that every required field is set and representable.
    fn validate(&self) -> Result<(), ProtocolError> {
        let kind = self.kind();
        let unset = |field| ProtocolError::Unset {
            message: kind,
            field,
        };

        self.query_id.as_ref().ok_or_else(|| unset("queryID"))?;
        self.sequence_number
            .ok_or_else(|| unset("sequenceNumber"))?;

        match &self.payload {
            Payload::QueryRequest(q) => {
                q.statement_type.ok_or_else(|| unset("statementType"))?;
                q.query.as_ref().ok_or_else(|| unset("query"))?;
            }
            Payload::MetaData(m) => {
                let columns = m.columns.len() as u32;
                if let Some(&index) = m
                    .nullable_columns
                    .iter()
                    .find(|&&i| i == 0 || i > columns)
                {
                    return Err(ProtocolError::Malformed {
                        message: kind,
                        field: "nullableColumns",
                        reason: format!("column {index} is not one of {columns} columns"),
                    });
                }
                if let Some(batch) = &m.batch {
                    batch.check(kind)?;
                }
            }
            Payload::ExecuteQueryResponse(b) | Payload::NextValuesResponse(b) => b.check(kind)?,
            Payload::ExecuteQueryRequest(_)
            | Payload::NextValuesRequest
            | Payload::CloseRequest => {}
        }
        Ok(())
    }

    /// Encodes the message into a datagram.
    ///
    /// Nothing is written when a required field is unset.
    pub fn serialize(&self) -> Result<BytesMut, ProtocolError> {
        self.validate()?;

        let kind = self.kind();
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let mut w = Writer::new(&mut buf, kind);

        w.put_u8(kind.tag());
        w.put_string("queryID", self.query_id.as_deref().unwrap_or_default())?;
        w.put_count(
            "sequenceNumber",
            self.sequence_number.unwrap_or_default() as usize,
        )?;

        match &self.payload {
            Payload::QueryRequest(q) => {
                w.put_i32(q.statement_type.map(StatementType::code).unwrap_or_default());
                w.put_string("query", q.query.as_deref().unwrap_or_default())?;
            }
            Payload::MetaData(m) => {
                w.put_count("numberOfParameters", m.number_of_parameters as usize)?;
                w.put_count("numberOfColumns", m.columns.len())?;
                for column in &m.columns {
                    w.put_i32(column.column_type.code());
                }
                w.put_count("numberOfNullableColumns", m.nullable_columns.len())?;
                for index in &m.nullable_columns {
                    w.put_count("nullableColumns", *index as usize)?;
                }
                for column in &m.columns {
                    w.put_string("columnNames", &column.name)?;
                }
                for column in &m.columns {
                    w.put_i32(column.scale);
                }
                for column in &m.columns {
                    w.put_i32(column.precision);
                }
                for column in &m.columns {
                    w.put_i32(column.display_size);
                }
                w.put_bool(m.batch.is_some());
                if let Some(batch) = &m.batch {
                    batch.write(&mut w)?;
                }
            }
            Payload::ExecuteQueryRequest(params) => {
                w.put_count("numberOfParameters", params.len())?;
                for p in params {
                    w.put_i32(p.column_type.code());
                }
                for p in params {
                    w.put_string("parameterValues", &p.value)?;
                }
            }
            Payload::ExecuteQueryResponse(b) | Payload::NextValuesResponse(b) => b.write(&mut w)?,
            Payload::NextValuesRequest | Payload::CloseRequest => {}
        }

        Ok(buf)
    }

    /// Number of bytes [`Message::serialize`] produces.
    pub fn encoded_len(&self) -> usize {
        let header = 1
            + string_len(self.query_id.as_deref().unwrap_or_default())
            + INT_SIZE;
        let body = match &self.payload {
            Payload::QueryRequest(q) => {
                INT_SIZE + string_len(q.query.as_deref().unwrap_or_default())
            }
            Payload::MetaData(m) => {
                let columns: usize = m
                    .columns
                    .iter()
                    .map(|c| string_len(&c.name) + 4 * INT_SIZE)
                    .sum();
                3 * INT_SIZE
                    + INT_SIZE * m.nullable_columns.len()
                    + columns
                    + BOOL_SIZE
                    + m.batch.as_ref().map_or(0, RowBatch::encoded_len)
            }
            Payload::ExecuteQueryRequest(params) => {
                INT_SIZE
                    + params
                        .iter()
                        .map(|p| INT_SIZE + string_len(&p.value))
                        .sum::<usize>()
            }
            Payload::ExecuteQueryResponse(b) | Payload::NextValuesResponse(b) => b.encoded_len(),
            Payload::NextValuesRequest | Payload::CloseRequest => 0,
        };
        header + body
    }

    /// Size of everything but the carried batch.
    pub(crate) fn overhead(&self) -> usize {
        self.encoded_len() - self.batch().map_or(0, RowBatch::encoded_len)
    }

    /// Decodes `bytes` into this instance, whose type must match the tag.
    ///
    /// Bytes past the end of the message are ignored.
    pub fn deserialize(
        &mut self,
        bytes: &[u8],
        origin: Option<SocketAddr>,
    ) -> Result<(), ProtocolError> {
        let kind = self.kind();
        let tag = *bytes.first().ok_or(ProtocolError::Empty)?;
        if tag != kind.tag() {
            return Err(ProtocolError::WrongType {
                expected: kind,
                found: tag,
            });
        }

        self.clean();
        let mut r = Reader::new(&bytes[1..], kind);
        self.query_id = Some(r.get_string("queryID")?);
        self.sequence_number = Some(r.get_u32("sequenceNumber")?);

        match &mut self.payload {
            Payload::QueryRequest(q) => {
                let code = r.get_i32("statementType")?;
                let statement_type =
                    StatementType::try_from(code).map_err(|e| ProtocolError::Malformed {
                        message: kind,
                        field: "statementType",
                        reason: e.to_string(),
                    })?;
                q.statement_type = Some(statement_type);
                q.query = Some(r.get_string("query")?);
            }
            Payload::MetaData(m) => {
                m.number_of_parameters = r.get_u32("numberOfParameters")?;
                let columns = r.get_count("numberOfColumns", INT_SIZE)?;
                let types = r.get_i32_vec("columnTypes", columns)?;
                let nullable = r.get_count("numberOfNullableColumns", INT_SIZE)?;
                for _ in 0..nullable {
                    let index = r.get_u32("nullableColumns")?;
                    if index == 0 || index as usize > columns {
                        return Err(r.malformed(
                            "nullableColumns",
                            format!("column {index} is not one of {columns} columns"),
                        ));
                    }
                    m.nullable_columns.push(index);
                }
                m.columns.reserve(columns);
                for code in types {
                    m.columns.push(ColumnMetadata {
                        name: r.get_string("columnNames")?,
                        column_type: ColumnType::from(code),
                        ..Default::default()
                    });
                }
                for c in m.columns.iter_mut() {
                    c.scale = r.get_i32("columnScale")?;
                }
                for c in m.columns.iter_mut() {
                    c.precision = r.get_i32("columnPrecision")?;
                }
                for c in m.columns.iter_mut() {
                    c.display_size = r.get_i32("columnDisplaySize")?;
                }
                if r.get_bool("hasValues")? {
                    let mut batch = RowBatch::default();
                    batch.read(&mut r)?;
                    m.batch = Some(batch);
                }
            }
            Payload::ExecuteQueryRequest(params) => {
                let count = r.get_count("numberOfParameters", INT_SIZE)?;
                let types = r.get_i32_vec("parameterTypes", count)?;
                for code in types {
                    params.push(Parameter {
                        column_type: ColumnType::from(code),
                        value: r.get_string("parameterValues")?,
                    });
                }
            }
            Payload::ExecuteQueryResponse(b) | Payload::NextValuesResponse(b) => b.read(&mut r)?,
            Payload::NextValuesRequest | Payload::CloseRequest => {}
        }

        self.origin = origin;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{batch::EMPTY_BATCH_LEN, value::Value};

    use super::*;

    fn header(kind: MessageType) -> Message {
        let mut msg = Message::new(kind);
        msg.set_header("q1", 7);
        msg
    }

    fn reparse(msg: &Message) -> Message {
        let bytes = msg.serialize().unwrap();
        assert_eq!(bytes.len(), msg.encoded_len());
        let mut out = Message::new(msg.kind());
        out.deserialize(&bytes, None).unwrap();
        out
    }

    fn two_columns() -> Vec<ColumnMetadata> {
        vec![
            ColumnMetadata {
                name: "ID".into(),
                column_type: ColumnType::Integer,
                scale: 0,
                precision: 10,
                display_size: 11,
            },
            ColumnMetadata {
                name: "NAME".into(),
                column_type: ColumnType::Varchar,
                scale: 0,
                precision: 32,
                display_size: 32,
            },
        ]
    }

    #[test]
    fn tags_are_stable() {
        for (i, kind) in MessageType::ALL.iter().enumerate() {
            assert_eq!(kind.tag() as usize, i);
            assert_eq!(MessageType::from_tag(i as u8), Some(*kind));
        }
        assert_eq!(MessageType::from_tag(7), None);
    }

    #[test]
    fn header_layout() {
        let bytes = header(MessageType::CloseRequest).serialize().unwrap();
        assert_eq!(&bytes[..], &[6, 0, 2, b'q', b'1', 0, 0, 0, 7]);
    }

    #[test]
    fn unset_header_writes_nothing() {
        let mut msg = Message::new(MessageType::NextValuesRequest);
        msg.sequence_number = Some(1);
        assert_eq!(
            msg.serialize().unwrap_err(),
            ProtocolError::Unset {
                message: MessageType::NextValuesRequest,
                field: "queryID"
            }
        );

        let mut msg = Message::new(MessageType::NextValuesRequest);
        msg.query_id = Some("q".into());
        assert!(matches!(
            msg.serialize(),
            Err(ProtocolError::Unset {
                field: "sequenceNumber",
                ..
            })
        ));
    }

    #[test]
    fn query_request_requires_statement() {
        let msg = header(MessageType::QueryRequest);
        assert!(matches!(
            msg.serialize(),
            Err(ProtocolError::Unset {
                field: "statementType",
                ..
            })
        ));
    }

    #[test]
    fn query_request_reparses() {
        let mut msg = header(MessageType::QueryRequest);
        msg.payload = Payload::QueryRequest(QueryRequest {
            statement_type: Some(StatementType::Prepared),
            query: Some("select * from LT0 where id = ?".into()),
        });
        assert_eq!(reparse(&msg), msg);
    }

    #[test]
    fn execute_request_reparses() {
        let mut msg = header(MessageType::ExecuteQueryRequest);
        assert_eq!(reparse(&msg), msg);

        msg.payload = Payload::ExecuteQueryRequest(vec![
            Parameter {
                column_type: ColumnType::Integer,
                value: "12".into(),
            },
            Parameter {
                column_type: ColumnType::Varchar,
                value: "gaian node".into(),
            },
        ]);
        assert_eq!(reparse(&msg), msg);
    }

    #[test]
    fn metadata_with_and_without_rows() {
        let mut meta = MetaData {
            number_of_parameters: 1,
            columns: two_columns(),
            nullable_columns: vec![2],
            batch: None,
        };
        let mut msg = header(MessageType::MetaData);
        msg.payload = Payload::MetaData(meta.clone());
        assert_eq!(reparse(&msg), msg);

        let mut batch = RowBatch::default();
        batch
            .push_row(&[Value::Integer(1), Value::Null], &meta.column_types())
            .unwrap();
        batch.contains_last_values = true;
        meta.batch = Some(batch);
        msg.payload = Payload::MetaData(meta);
        assert_eq!(reparse(&msg), msg);
    }

    #[test]
    fn metadata_nullable_index_is_one_based() {
        let mut msg = header(MessageType::MetaData);
        msg.payload = Payload::MetaData(MetaData {
            columns: two_columns(),
            nullable_columns: vec![0],
            ..Default::default()
        });
        assert!(matches!(
            msg.serialize(),
            Err(ProtocolError::Malformed {
                field: "nullableColumns",
                ..
            })
        ));
    }

    #[test]
    fn nullable_index_outside_columns_fails_to_decode() {
        let mut msg = header(MessageType::MetaData);
        msg.payload = Payload::MetaData(MetaData {
            columns: two_columns(),
            nullable_columns: vec![2],
            ..Default::default()
        });
        let mut bytes = msg.serialize().unwrap();
        // Header, parameter count, column count and two types come first.
        let at = 9 + 4 + 4 + 8 + 4;
        assert_eq!(&bytes[at..at + 4], &2i32.to_be_bytes());

        for index in [0u8, 3] {
            bytes[at + 3] = index;
            let mut out = Message::new(MessageType::MetaData);
            assert!(matches!(
                out.deserialize(&bytes, None),
                Err(ProtocolError::Malformed {
                    field: "nullableColumns",
                    ..
                })
            ));
        }
    }

    #[test]
    fn responses_reparse() {
        for kind in [
            MessageType::ExecuteQueryResponse,
            MessageType::NextValuesResponse,
        ] {
            let mut msg = header(kind);
            assert_eq!(reparse(&msg), msg);

            let types = [ColumnType::BigInt];
            let batch = msg.batch_mut().unwrap();
            for i in 0..20 {
                batch.push_row(&[Value::BigInt(i)], &types).unwrap();
            }
            assert_eq!(reparse(&msg), msg);
        }
    }

    #[test]
    fn truncated_metadata_names_field() {
        let mut msg = header(MessageType::MetaData);
        msg.payload = Payload::MetaData(MetaData {
            columns: two_columns(),
            ..Default::default()
        });
        let bytes = msg.serialize().unwrap();

        let mut out = Message::new(MessageType::MetaData);
        let err = out.deserialize(&bytes[..bytes.len() - 6], None).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                message: MessageType::MetaData,
                field: "columnDisplaySize",
                ..
            }
        ));
    }

    #[test]
    fn tag_must_match_instance() {
        let bytes = header(MessageType::CloseRequest).serialize().unwrap();
        let mut msg = Message::new(MessageType::NextValuesRequest);
        assert_eq!(
            msg.deserialize(&bytes, None).unwrap_err(),
            ProtocolError::WrongType {
                expected: MessageType::NextValuesRequest,
                found: 6
            }
        );
        assert_eq!(msg.deserialize(&[], None), Err(ProtocolError::Empty));
    }

    #[test]
    fn clean_resets_everything() {
        let mut msg = header(MessageType::NextValuesResponse);
        msg.batch_mut().unwrap().number_of_rows = 3;
        msg.clean();
        assert_eq!(msg, Message::new(MessageType::NextValuesResponse));
        assert!(msg.origin().is_none());
    }

    #[test]
    fn overhead_excludes_rows() {
        let mut msg = header(MessageType::NextValuesResponse);
        let empty = msg.encoded_len();
        msg.batch_mut()
            .unwrap()
            .push_row(&[Value::Integer(5)], &[ColumnType::Integer])
            .unwrap();
        assert_eq!(msg.overhead() + EMPTY_BATCH_LEN, empty);
    }
}
