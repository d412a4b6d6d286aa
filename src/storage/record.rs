use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Entity, ObjectId, TypeId};

// [ LENGTH:u64 ][ TYPE_ID:u64 ][ OBJECT_ID:u64 ][ PAYLOAD ... ]
// LENGTH covers the header as well.
pub const HEADER_LENGTH: u64 = 24;
const OFFSET_LENGTH: usize = 0;
const OFFSET_TYPE_ID: usize = 8;
const OFFSET_OBJECT_ID: usize = 16;

/// Byte order of all binary channel files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn from_switch(switch_byte_order: bool) -> Self {
        if switch_byte_order { ByteOrder::Big } else { ByteOrder::Little }
    }

    pub fn put_u64(self, buffer: &mut Vec<u8>, value: u64) {
        match self {
            ByteOrder::Little => buffer.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::Big => buffer.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Caller guarantees `bytes.len() >= offset + 8`.
    pub fn get_u64(self, bytes: &[u8], offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[offset..offset + 8]);
        match self {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        }
    }
}

/// Borrowed view of one entity record
#[derive(Debug, Clone, Copy)]
pub struct EntityRecord<'a> {
    pub length: u64,
    pub type_id: TypeId,
    pub object_id: ObjectId,
    pub payload: &'a [u8],
}

impl<'a> EntityRecord<'a> {
    pub fn to_entity(&self) -> Entity {
        Entity::new(self.object_id, self.type_id, self.payload.to_vec())
    }
}

pub fn record_length(payload_length: usize) -> u64 {
    HEADER_LENGTH + payload_length as u64
}

pub fn encode_record(entity: &Entity, order: ByteOrder, out: &mut Vec<u8>) {
    order.put_u64(out, record_length(entity.payload.len()));
    order.put_u64(out, entity.type_id.0);
    order.put_u64(out, entity.object_id.0);
    out.extend_from_slice(&entity.payload);
}

/// Decode the record starting at `offset`, bound-checking its length.
pub fn decode_record(data: &[u8], offset: usize, order: ByteOrder) -> Result<EntityRecord<'_>> {
    let available = data.len().saturating_sub(offset) as u64;
    if available < HEADER_LENGTH {
        return Err(Error::new(
            ErrorKind::InvalidEntityLength,
            format!("truncated record header at offset {} ({} bytes left)", offset, available),
        ));
    }

    let length = order.get_u64(data, offset + OFFSET_LENGTH);
    if length < HEADER_LENGTH || length > available {
        return Err(Error::new(
            ErrorKind::InvalidEntityLength,
            format!("invalid entity length {} at offset {} ({} bytes left)", length, offset, available),
        ));
    }

    let end = offset + length as usize;
    Ok(EntityRecord {
        length,
        type_id: TypeId(order.get_u64(data, offset + OFFSET_TYPE_ID)),
        object_id: ObjectId(order.get_u64(data, offset + OFFSET_OBJECT_ID)),
        payload: &data[offset + HEADER_LENGTH as usize..end],
    })
}

/// Iterator over consecutive records of a data file region
pub struct RecordIterator<'a> {
    data: &'a [u8],
    position: usize,
    order: ByteOrder,
    failed: bool,
}

impl<'a> RecordIterator<'a> {
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        RecordIterator { data, position: 0, order, failed: false }
    }
}

impl<'a> Iterator for RecordIterator<'a> {
    /// (offset, record)
    type Item = Result<(u64, EntityRecord<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.position >= self.data.len() {
            return None;
        }

        match decode_record(self.data, self.position, self.order) {
            Ok(record) => {
                let offset = self.position as u64;
                self.position += record.length as usize;
                Some(Ok((offset, record)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(oid: u64, payload: &[u8]) -> Entity {
        Entity::new(ObjectId(oid), TypeId(1_000_010), payload.to_vec())
    }

    #[test]
    fn iterates_records_in_both_orders() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let mut data = Vec::new();
            encode_record(&sample(7, b"abc"), order, &mut data);
            encode_record(&sample(8, b""), order, &mut data);

            let records: Vec<_> = RecordIterator::new(&data, order)
                .collect::<Result<Vec<_>>>()
                .unwrap();

            assert_eq!(records.len(), 2);
            assert_eq!(records[0].0, 0);
            assert_eq!(records[0].1.payload, b"abc");
            assert_eq!(records[1].0, HEADER_LENGTH + 3);
            assert_eq!(records[1].1.object_id, ObjectId(8));
            assert_eq!(records[1].1.length, HEADER_LENGTH);
        }
    }

    #[test]
    fn rejects_length_past_end() {
        let mut data = Vec::new();
        encode_record(&sample(7, b"abcdef"), ByteOrder::Little, &mut data);
        data.truncate(data.len() - 2);

        let err = decode_record(&data, 0, ByteOrder::Little).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidEntityLength);
    }

    #[test]
    fn rejects_length_below_header() {
        let mut data = Vec::new();
        ByteOrder::Little.put_u64(&mut data, 3);
        data.extend_from_slice(&[0u8; 16]);

        let mut iter = RecordIterator::new(&data, ByteOrder::Little);
        assert_eq!(iter.next().unwrap().unwrap_err().kind, ErrorKind::InvalidEntityLength);
        assert!(iter.next().is_none());
    }
}
