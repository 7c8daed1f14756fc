//! Row batches carried by MetaData, ExecuteQueryResponse and
//! NextValuesResponse.
//!
//! Layout: `bool containsLastValues | i32 numberOfRows` and, only when rows
//! are present, `i32 nullCount | nullCount x i32 cellIndex | i32 blobLength |
//! blob`. A null cell index is `rowInBatch * numberOfColumns + column`.
use super::{
    MessageType, ProtocolError,
    codec::{BOOL_SIZE, INT_SIZE, Reader, Writer},
    value::{ColumnType, Row, RowError, Value},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowBatch {
    pub contains_last_values: bool,
    pub number_of_rows: u32,
    /// Strictly increasing indices of null cells.
    pub null_cells: Vec<u32>,
    /// Non-null cells, row-major.
    pub values: Vec<u8>,
}

/// Encoded size of a batch holding no rows.
pub const EMPTY_BATCH_LEN: usize = BOOL_SIZE + INT_SIZE;

impl RowBatch {
    pub fn clear(&mut self) {
        self.contains_last_values = false;
        self.number_of_rows = 0;
        self.null_cells.clear();
        self.values.clear();
    }

    pub fn encoded_len(&self) -> usize {
        if self.number_of_rows == 0 {
            return EMPTY_BATCH_LEN;
        }
        EMPTY_BATCH_LEN + INT_SIZE * (2 + self.null_cells.len()) + self.values.len()
    }

    pub(crate) fn check(&self, message: MessageType) -> Result<(), ProtocolError> {
        if self.number_of_rows == 0 && (!self.values.is_empty() || !self.null_cells.is_empty()) {
            return Err(ProtocolError::Malformed {
                message,
                field: "numberOfRows",
                reason: "cell data present in a batch of zero rows".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn write(&self, w: &mut Writer<'_>) -> Result<(), ProtocolError> {
        w.put_bool(self.contains_last_values);
        w.put_count("numberOfRows", self.number_of_rows as usize)?;
        if self.number_of_rows > 0 {
            w.put_count("nullCount", self.null_cells.len())?;
            for index in &self.null_cells {
                w.put_count("nullCells", *index as usize)?;
            }
            w.put_blob("values", &self.values)?;
        }
        Ok(())
    }

    pub(crate) fn read(&mut self, r: &mut Reader<'_>) -> Result<(), ProtocolError> {
        self.clear();
        self.contains_last_values = r.get_bool("containsLastValues")?;
        self.number_of_rows = r.get_u32("numberOfRows")?;
        if self.number_of_rows > 0 {
            let nulls = r.get_count("nullCount", INT_SIZE)?;
            self.null_cells.reserve(nulls);
            for _ in 0..nulls {
                self.null_cells.push(r.get_u32("nullCells")?);
            }
            self.values = r.get_blob("values")?;
            // Every row holds at least one cell, and a non-null cell takes at
            // least one byte.
            let cells = self.null_cells.len() + self.values.len();
            if self.number_of_rows as usize > cells {
                return Err(r.malformed(
                    "numberOfRows",
                    format!("{} rows cannot fit in {cells} cells", self.number_of_rows),
                ));
            }
        }
        Ok(())
    }

    /// Appends one row, recording its nulls and encoding the rest.
    pub fn push_row(&mut self, row: &[Value], column_types: &[ColumnType]) -> Result<(), RowError> {
        if row.len() != column_types.len() {
            return Err(RowError::Width {
                expected: column_types.len(),
                found: row.len(),
            });
        }
        let base = self.number_of_rows as usize * column_types.len();
        for (column, (value, column_type)) in row.iter().zip(column_types).enumerate() {
            if value.is_null() {
                self.null_cells.push((base + column) as u32);
            } else {
                value.encode_cell(column, *column_type, &mut self.values)?;
            }
        }
        self.number_of_rows += 1;
        Ok(())
    }

    /// Decodes every row of the batch.
    pub fn rows(&self, column_types: &[ColumnType]) -> Result<Vec<Row>, RowError> {
        let width = column_types.len();
        let cells = (self.number_of_rows as usize).saturating_mul(width);

        let mut previous: Option<u32> = None;
        for &index in &self.null_cells {
            if index as usize >= cells || previous.is_some_and(|p| p >= index) {
                return Err(RowError::NullIndex { index, cells });
            }
            previous = Some(index);
        }
        if (width == 0 && self.number_of_rows > 0)
            || cells > self.null_cells.len() + self.values.len()
        {
            return Err(RowError::RowCount {
                rows: self.number_of_rows,
                width,
            });
        }

        let mut nulls = self.null_cells.iter().peekable();
        let mut offset = 0;
        let mut rows = Vec::with_capacity(self.number_of_rows as usize);
        for row_index in 0..self.number_of_rows as usize {
            let mut row = Vec::with_capacity(width);
            for (column, column_type) in column_types.iter().enumerate() {
                let cell = (row_index * width + column) as u32;
                if nulls.next_if_eq(&&cell).is_some() {
                    row.push(Value::Null);
                    continue;
                }
                let (value, used) = Value::decode_cell(*column_type, &self.values[offset..])?;
                offset += used;
                row.push(value);
            }
            rows.push(row);
        }

        if offset != self.values.len() {
            return Err(RowError::TrailingBytes(self.values.len() - offset));
        }
        Ok(rows)
    }

    fn mark(&self) -> (u32, usize, usize) {
        (self.number_of_rows, self.null_cells.len(), self.values.len())
    }

    fn rewind(&mut self, (rows, nulls, values): (u32, usize, usize)) {
        self.number_of_rows = rows;
        self.null_cells.truncate(nulls);
        self.values.truncate(values);
    }
}

/// Rows produced by a query, consumed one batch at a time.
pub type RowSource = Box<dyn Iterator<Item = Row> + Send>;

/// Fills batches from a row source so that each message fits a datagram.
///
/// A row that does not fit is held back and opens the next batch.
pub struct BatchEncoder {
    column_types: Vec<ColumnType>,
    rows: RowSource,
    pending: Option<Row>,
}

impl BatchEncoder {
    pub fn new(column_types: Vec<ColumnType>, rows: RowSource) -> Self {
        Self {
            column_types,
            rows,
            pending: None,
        }
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    /// Adds rows to `batch` while its encoded size stays within `budget`.
    ///
    /// When `allow_empty` is set the batch may be returned with no rows if
    /// even the first one is too large; otherwise that row is an error.
    pub fn fill(
        &mut self,
        batch: &mut RowBatch,
        budget: usize,
        allow_empty: bool,
    ) -> Result<(), RowError> {
        batch.clear();
        loop {
            let row = match self.pending.take().or_else(|| self.rows.next()) {
                Some(row) => row,
                None => {
                    batch.contains_last_values = true;
                    return Ok(());
                }
            };

            let mark = batch.mark();
            batch.push_row(&row, &self.column_types)?;
            let size = batch.encoded_len();
            if size <= budget {
                continue;
            }

            batch.rewind(mark);
            if batch.number_of_rows == 0 && !allow_empty {
                return Err(RowError::RowTooLarge { size, max: budget });
            }
            self.pending = Some(row);
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn int_rows(n: i32) -> RowSource {
        Box::new((0..n).map(|i| vec![Value::Integer(i), Value::Varchar(format!("r{i}"))]))
    }

    const TYPES: [ColumnType; 2] = [ColumnType::Integer, ColumnType::Varchar];

    #[test]
    fn sparse_nulls_land_on_their_cells() {
        let types = [ColumnType::Integer];
        let mut batch = RowBatch::default();
        for i in 0..5 {
            let cell = if i == 2 { Value::Null } else { Value::Integer(i) };
            batch.push_row(&[cell], &types).unwrap();
        }
        assert_eq!(batch.null_cells, vec![2]);

        let types = [ColumnType::Integer, ColumnType::Integer];
        let mut batch = RowBatch::default();
        for r in 0..5 {
            let row: Vec<Value> = (0..2)
                .map(|c| match r * 2 + c {
                    2 | 7 => Value::Null,
                    n => Value::Integer(n),
                })
                .collect();
            batch.push_row(&row, &types).unwrap();
        }
        assert_eq!(batch.null_cells, vec![2, 7]);

        let rows = batch.rows(&types).unwrap();
        assert_eq!(rows[1][0], Value::Null);
        assert_eq!(rows[3][1], Value::Null);
        let nulls = rows.iter().flatten().filter(|v| v.is_null()).count();
        assert_eq!(nulls, 2);
    }

    #[test]
    fn all_null_batch_has_empty_blob() {
        let mut batch = RowBatch::default();
        batch.push_row(&[Value::Null, Value::Null], &TYPES).unwrap();
        batch.push_row(&[Value::Null, Value::Null], &TYPES).unwrap();
        assert_eq!(batch.null_cells, vec![0, 1, 2, 3]);
        assert!(batch.values.is_empty());
        assert_eq!(batch.rows(&TYPES).unwrap(), vec![vec![Value::Null; 2]; 2]);
    }

    #[test]
    fn zero_row_batch_omits_cell_section() {
        let batch = RowBatch {
            contains_last_values: true,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        batch
            .write(&mut Writer::new(&mut buf, MessageType::NextValuesResponse))
            .unwrap();
        assert_eq!(&buf[..], &[1, 0, 0, 0, 0]);
        assert_eq!(buf.len(), batch.encoded_len());
    }

    #[test]
    fn encoded_len_matches_written_bytes() {
        let mut batch = RowBatch::default();
        batch
            .push_row(&[Value::Integer(1), Value::Null], &TYPES)
            .unwrap();
        let mut buf = BytesMut::new();
        batch
            .write(&mut Writer::new(&mut buf, MessageType::NextValuesResponse))
            .unwrap();
        assert_eq!(buf.len(), batch.encoded_len());
    }

    #[test]
    fn out_of_order_null_index_is_rejected() {
        let batch = RowBatch {
            contains_last_values: true,
            number_of_rows: 2,
            null_cells: vec![3, 1],
            values: vec![],
        };
        assert!(matches!(
            batch.rows(&[ColumnType::Integer, ColumnType::Integer]),
            Err(RowError::NullIndex { index: 1, .. })
        ));
    }

    #[test]
    fn null_index_beyond_batch_is_rejected() {
        let batch = RowBatch {
            contains_last_values: true,
            number_of_rows: 1,
            null_cells: vec![2],
            values: vec![],
        };
        assert!(matches!(
            batch.rows(&TYPES),
            Err(RowError::NullIndex { index: 2, cells: 2 })
        ));
    }

    #[test]
    fn row_count_beyond_cell_data_is_rejected() {
        let batch = RowBatch {
            contains_last_values: true,
            number_of_rows: u32::MAX,
            null_cells: vec![],
            values: vec![0; 4],
        };
        assert!(matches!(
            batch.rows(&[ColumnType::Integer]),
            Err(RowError::RowCount { rows: u32::MAX, width: 1 })
        ));

        let headless = RowBatch {
            number_of_rows: 3,
            ..Default::default()
        };
        assert!(matches!(
            headless.rows(&[]),
            Err(RowError::RowCount { rows: 3, width: 0 })
        ));
    }

    #[test]
    fn huge_row_count_fails_to_decode() {
        // numberOfRows is i32::MAX with no nulls and an empty blob.
        let wire = [0, 0x7f, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut batch = RowBatch::default();
        let err = batch
            .read(&mut Reader::new(&wire, MessageType::NextValuesResponse))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Malformed {
                field: "numberOfRows",
                ..
            }
        ));
    }

    #[test]
    fn trailing_blob_bytes_are_rejected() {
        let mut batch = RowBatch::default();
        batch.push_row(&[Value::Integer(1)], &[ColumnType::Integer]).unwrap();
        batch.values.push(0);
        assert!(matches!(
            batch.rows(&[ColumnType::Integer]),
            Err(RowError::TrailingBytes(1))
        ));
    }

    #[test]
    fn encoder_splits_rows_across_batches() {
        let mut encoder = BatchEncoder::new(TYPES.to_vec(), int_rows(10));
        let mut batch = RowBatch::default();
        let mut seen = Vec::new();

        loop {
            encoder.fill(&mut batch, 80, false).unwrap();
            assert!(batch.encoded_len() <= 80);
            assert!(batch.number_of_rows > 0 || batch.contains_last_values);
            seen.extend(batch.rows(&TYPES).unwrap());
            if batch.contains_last_values {
                break;
            }
        }

        let expected: Vec<Row> = int_rows(10).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn encoder_marks_last_batch_when_everything_fits() {
        let mut encoder = BatchEncoder::new(TYPES.to_vec(), int_rows(3));
        let mut batch = RowBatch::default();
        encoder.fill(&mut batch, 1000, true).unwrap();
        assert!(batch.contains_last_values);
        assert_eq!(batch.number_of_rows, 3);
    }

    #[test]
    fn oversized_first_row() {
        let mut encoder = BatchEncoder::new(TYPES.to_vec(), int_rows(2));
        let mut batch = RowBatch::default();

        encoder.fill(&mut batch, 10, true).unwrap();
        assert_eq!(batch.number_of_rows, 0);
        assert!(!batch.contains_last_values);

        assert!(matches!(
            encoder.fill(&mut batch, 10, false),
            Err(RowError::RowTooLarge { max: 10, .. })
        ));
    }
}
