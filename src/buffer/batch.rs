//! Tuple batches and their wire format.
//!
//! A [`TupleBatch`] is a contiguous block of rows, the unit of buffering and
//! spilling. Batches are immutable once built; the buffer that owns them
//! stamps the starting row number and may strip the column types once they
//! are known from context.
//!
//! ## Wire Format
//!
//! Batches serialize to an explicit little-endian schema so spill files and
//! snapshot streams are portable across processes:
//!
//! ```text
//! row_count: u32
//! col_count: u16
//! has_types: u8
//! [type_tag: u8; col_count]        only when has_types == 1
//! rows * cols values, each:
//!     tag: u8
//!     payload (fixed width LE, or u32 length prefix + bytes)
//! ```
//!
//! LOB values serialize as their reference id only; the payload never
//! travels with the tuple. Deserialized references are placeholders until
//! the owning `LobManager` rewrites them.

use std::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;

use crate::types::{DataType, Value};

#[derive(Debug)]
pub struct TupleBatch {
    begin_row: u64,
    rows: Vec<Vec<Value>>,
    types: Option<SmallVec<[DataType; 8]>>,
    serialized: AtomicBool,
}

impl TupleBatch {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self {
            begin_row: 1,
            rows,
            types: None,
            serialized: AtomicBool::new(false),
        }
    }

    pub fn with_types(rows: Vec<Vec<Value>>, types: SmallVec<[DataType; 8]>) -> Self {
        Self {
            begin_row: 1,
            rows,
            types: Some(types),
            serialized: AtomicBool::new(false),
        }
    }

    /// First row number of this batch, 1-based.
    pub fn begin_row(&self) -> u64 {
        self.begin_row
    }

    pub(crate) fn set_begin_row(&mut self, begin_row: u64) {
        self.begin_row = begin_row;
    }

    /// Last row number of this batch, inclusive.
    pub fn end_row(&self) -> u64 {
        self.begin_row + self.len().saturating_sub(1)
    }

    pub fn len(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [Vec<Value>] {
        &mut self.rows
    }

    pub fn types(&self) -> Option<&[DataType]> {
        self.types.as_deref()
    }

    pub(crate) fn clear_types(&mut self) {
        self.types = None;
    }

    /// Whether this batch has been through serialization at least once.
    pub fn is_serialized(&self) -> bool {
        self.serialized.load(Ordering::Acquire)
    }

    fn mark_serialized(&self) {
        self.serialized.store(true, Ordering::Release);
    }
}

pub(crate) mod codec {
    use std::io::{Read, Write};

    use eyre::{bail, ensure, Result};
    use smallvec::SmallVec;

    use crate::error::BufferError;
    use crate::types::{DataType, LobRef, Value};

    use super::TupleBatch;

    const TAG_NULL: u8 = 0;
    const TAG_BOOLEAN: u8 = 1;
    const TAG_INTEGER: u8 = 2;
    const TAG_LONG: u8 = 3;
    const TAG_DOUBLE: u8 = 4;
    const TAG_STRING: u8 = 5;
    const TAG_BINARY: u8 = 6;
    const TAG_LOB: u8 = 7;

    pub(crate) fn write_all(w: &mut impl Write, buf: &[u8]) -> Result<()> {
        w.write_all(buf)
            .map_err(|e| BufferError::io("writing batch stream", e).into())
    }

    pub(crate) fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
        r.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                BufferError::format("truncated batch stream").into()
            } else {
                BufferError::io("reading batch stream", e).into()
            }
        })
    }

    pub(crate) fn write_u8(w: &mut impl Write, v: u8) -> Result<()> {
        write_all(w, &[v])
    }

    pub(crate) fn write_u16(w: &mut impl Write, v: u16) -> Result<()> {
        write_all(w, &v.to_le_bytes())
    }

    pub(crate) fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
        write_all(w, &v.to_le_bytes())
    }

    pub(crate) fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
        write_all(w, &v.to_le_bytes())
    }

    pub(crate) fn read_u8(r: &mut impl Read) -> Result<u8> {
        let mut buf = [0u8; 1];
        read_exact(r, &mut buf)?;
        Ok(buf[0])
    }

    pub(crate) fn read_u16(r: &mut impl Read) -> Result<u16> {
        let mut buf = [0u8; 2];
        read_exact(r, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub(crate) fn read_u32(r: &mut impl Read) -> Result<u32> {
        let mut buf = [0u8; 4];
        read_exact(r, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn read_u64(r: &mut impl Read) -> Result<u64> {
        let mut buf = [0u8; 8];
        read_exact(r, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a u32, distinguishing clean end-of-stream (`None`) from a
    /// truncated value.
    pub(crate) fn read_u32_opt(r: &mut impl Read) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = r
                .read(&mut buf[filled..])
                .map_err(|e| BufferError::io("reading stream", e))?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                bail!(BufferError::format("truncated stream"));
            }
            filled += n;
        }
        Ok(Some(u32::from_le_bytes(buf)))
    }

    pub(crate) fn write_string(w: &mut impl Write, s: &str) -> Result<()> {
        ensure!(
            s.len() <= u32::MAX as usize,
            BufferError::format("string too long for wire format")
        );
        write_u32(w, s.len() as u32)?;
        write_all(w, s.as_bytes())
    }

    pub(crate) fn read_string(r: &mut impl Read) -> Result<String> {
        let len = read_u32(r)? as usize;
        let mut buf = vec![0u8; len];
        read_exact(r, &mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| BufferError::format("invalid UTF-8 in stream").into())
    }

    fn write_value(w: &mut impl Write, value: &Value) -> Result<()> {
        match value {
            Value::Null => write_u8(w, TAG_NULL),
            Value::Boolean(b) => {
                write_u8(w, TAG_BOOLEAN)?;
                write_u8(w, *b as u8)
            }
            Value::Integer(i) => {
                write_u8(w, TAG_INTEGER)?;
                write_all(w, &i.to_le_bytes())
            }
            Value::Long(i) => {
                write_u8(w, TAG_LONG)?;
                write_all(w, &i.to_le_bytes())
            }
            Value::Double(d) => {
                write_u8(w, TAG_DOUBLE)?;
                write_all(w, &d.to_bits().to_le_bytes())
            }
            Value::String(s) => {
                write_u8(w, TAG_STRING)?;
                write_string(w, s)
            }
            Value::Binary(b) => {
                write_u8(w, TAG_BINARY)?;
                ensure!(
                    b.len() <= u32::MAX as usize,
                    BufferError::format("binary value too long for wire format")
                );
                write_u32(w, b.len() as u32)?;
                write_all(w, b)
            }
            Value::Lob(lob) => {
                write_u8(w, TAG_LOB)?;
                write_string(w, &lob.id)
            }
        }
    }

    fn read_value(r: &mut impl Read) -> Result<Value> {
        let tag = read_u8(r)?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_BOOLEAN => Value::Boolean(read_u8(r)? != 0),
            TAG_INTEGER => {
                let mut buf = [0u8; 4];
                read_exact(r, &mut buf)?;
                Value::Integer(i32::from_le_bytes(buf))
            }
            TAG_LONG => {
                let mut buf = [0u8; 8];
                read_exact(r, &mut buf)?;
                Value::Long(i64::from_le_bytes(buf))
            }
            TAG_DOUBLE => {
                let mut buf = [0u8; 8];
                read_exact(r, &mut buf)?;
                Value::Double(f64::from_bits(u64::from_le_bytes(buf)))
            }
            TAG_STRING => Value::String(read_string(r)?),
            TAG_BINARY => {
                let len = read_u32(r)? as usize;
                let mut buf = vec![0u8; len];
                read_exact(r, &mut buf)?;
                Value::Binary(buf)
            }
            TAG_LOB => Value::Lob(LobRef::placeholder(read_string(r)?)),
            other => bail!(BufferError::format(format!("unknown value tag {other}"))),
        };
        Ok(value)
    }

    /// Serializes a batch. `types_override` forces the type list onto the
    /// wire (used by snapshot streams); otherwise the batch's own types are
    /// written when present.
    pub(crate) fn encode(
        batch: &TupleBatch,
        types_override: Option<&[DataType]>,
        w: &mut impl Write,
    ) -> Result<()> {
        let types: Option<&[DataType]> = types_override.or_else(|| batch.types());
        let col_count = types
            .map(|t| t.len())
            .or_else(|| batch.rows().first().map(|r| r.len()))
            .unwrap_or(0);
        ensure!(
            batch.rows().len() <= u32::MAX as usize && col_count <= u16::MAX as usize,
            BufferError::format("batch dimensions exceed wire format limits")
        );

        write_u32(w, batch.rows().len() as u32)?;
        write_u16(w, col_count as u16)?;
        match types {
            Some(types) => {
                write_u8(w, 1)?;
                for t in types {
                    write_u8(w, t.wire_tag())?;
                }
            }
            None => write_u8(w, 0)?,
        }

        for row in batch.rows() {
            ensure!(
                row.len() == col_count,
                BufferError::format("ragged row in batch")
            );
            for value in row {
                write_value(w, value)?;
            }
        }
        batch.mark_serialized();
        Ok(())
    }

    /// Deserializes a batch. `expected_types` supplies the schema when the
    /// stream carries none.
    pub(crate) fn decode(r: &mut impl Read, expected_types: &[DataType]) -> Result<TupleBatch> {
        let row_count = read_u32(r)? as usize;
        let col_count = read_u16(r)? as usize;
        let has_types = read_u8(r)?;

        let wire_types = match has_types {
            0 => None,
            1 => {
                let mut types: SmallVec<[DataType; 8]> = SmallVec::with_capacity(col_count);
                for _ in 0..col_count {
                    let tag = read_u8(r)?;
                    let t = DataType::from_wire_tag(tag).ok_or_else(|| {
                        eyre::Report::new(BufferError::format(format!("unknown type tag {tag}")))
                    })?;
                    types.push(t);
                }
                Some(types)
            }
            other => bail!(BufferError::format(format!("bad types marker {other}"))),
        };
        if wire_types.is_none() {
            ensure!(
                expected_types.is_empty() || expected_types.len() == col_count,
                BufferError::format("column count does not match expected schema")
            );
        }

        let mut rows = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(col_count);
            for _ in 0..col_count {
                row.push(read_value(r)?);
            }
            rows.push(row);
        }

        let batch = TupleBatch {
            begin_row: 1,
            rows,
            types: wire_types,
            serialized: std::sync::atomic::AtomicBool::new(true),
        };
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BufferError;
    use smallvec::smallvec;

    fn sample_rows() -> Vec<Vec<Value>> {
        vec![
            vec![
                Value::Integer(1),
                Value::String("alpha".into()),
                Value::Double(1.5),
            ],
            vec![Value::Integer(2), Value::Null, Value::Double(-2.25)],
        ]
    }

    #[test]
    fn test_row_range() {
        let mut batch = TupleBatch::new(sample_rows());
        batch.set_begin_row(101);
        assert_eq!(batch.begin_row(), 101);
        assert_eq!(batch.end_row(), 102);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let batch = TupleBatch::new(sample_rows());
        let mut wire = Vec::new();
        codec::encode(&batch, None, &mut wire).unwrap();
        assert!(batch.is_serialized());

        let decoded = codec::decode(
            &mut wire.as_slice(),
            &[DataType::Integer, DataType::String, DataType::Double],
        )
        .unwrap();
        assert_eq!(decoded.rows(), batch.rows());
        assert!(decoded.is_serialized());
    }

    #[test]
    fn test_types_travel_when_forced() {
        let batch = TupleBatch::new(sample_rows());
        let mut wire = Vec::new();
        codec::encode(
            &batch,
            Some(&[DataType::Integer, DataType::String, DataType::Double]),
            &mut wire,
        )
        .unwrap();

        let decoded = codec::decode(&mut wire.as_slice(), &[]).unwrap();
        assert_eq!(
            decoded.types(),
            Some(&[DataType::Integer, DataType::String, DataType::Double][..])
        );
    }

    #[test]
    fn test_lob_values_decode_as_placeholders() {
        use crate::types::{LobHandle, LobRef};
        let handle = LobHandle::new("lob-9", vec![1, 2, 3]);
        let batch = TupleBatch::new(vec![vec![Value::Lob(LobRef::new(handle))]]);

        let mut wire = Vec::new();
        codec::encode(&batch, None, &mut wire).unwrap();
        let decoded = codec::decode(&mut wire.as_slice(), &[DataType::Blob]).unwrap();

        match &decoded.rows()[0][0] {
            Value::Lob(lob) => {
                assert_eq!(lob.id, "lob-9");
                assert!(!lob.is_resolved());
            }
            other => panic!("expected lob, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_stream_is_format_error() {
        let batch = TupleBatch::new(sample_rows());
        let mut wire = Vec::new();
        codec::encode(&batch, None, &mut wire).unwrap();
        wire.truncate(wire.len() / 2);

        let err = codec::decode(
            &mut wire.as_slice(),
            &[DataType::Integer, DataType::String, DataType::Double],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BufferError>(),
            Some(BufferError::Format { .. })
        ));
    }

    #[test]
    fn test_ragged_batch_rejected() {
        let batch = TupleBatch::with_types(
            vec![vec![Value::Integer(1)], vec![]],
            smallvec![DataType::Integer],
        );
        let mut wire = Vec::new();
        let err = codec::encode(&batch, None, &mut wire).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BufferError>(),
            Some(BufferError::Format { .. })
        ));
    }
}
