use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{ObjectId, TypeId};

/// Shape of one payload field. Payload fields are always little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Primitive(usize),  // fixed width, no references
    Reference,         // u64 object id, 0 = null
    ReferenceList,     // u32 count + count * u64
    Bytes,             // u32 length + bytes
}

#[derive(Debug, Clone)]
pub struct TypeLayout {
    pub name: String,
    pub fields: Vec<FieldKind>,
}

impl TypeLayout {
    pub fn new(name: impl Into<String>, fields: Vec<FieldKind>) -> Self {
        TypeLayout { name: name.into(), fields }
    }

    pub fn has_references(&self) -> bool {
        self.fields.iter().any(|f| matches!(f, FieldKind::Reference | FieldKind::ReferenceList))
    }
}

/// Registry of the payload layouts of all persisted types
pub struct TypeDictionary {
    layouts: RwLock<HashMap<TypeId, Arc<TypeLayout>>>,
}

impl TypeDictionary {
    pub fn new() -> Self {
        let dictionary = TypeDictionary { layouts: RwLock::new(HashMap::new()) };
        dictionary.register(
            TypeId::ROOTS,
            TypeLayout::new("roots", vec![FieldKind::ReferenceList]),
        );
        dictionary
    }

    pub fn register(&self, type_id: TypeId, layout: TypeLayout) {
        self.layouts.write().insert(type_id, Arc::new(layout));
    }

    pub fn layout(&self, type_id: TypeId) -> Option<Arc<TypeLayout>> {
        self.layouts.read().get(&type_id).cloned()
    }

    /// Calls `visit` for every non-null reference in the payload.
    /// Types without a registered layout are treated as reference-free.
    pub fn iterate_references(
        &self,
        type_id: TypeId,
        payload: &[u8],
        visit: &mut dyn FnMut(ObjectId),
    ) -> Result<()> {
        let layout = match self.layout(type_id) {
            Some(layout) => layout,
            None => return Ok(()),
        };
        if !layout.has_references() {
            return Ok(());
        }

        let mut reader = PayloadReader::new(payload);
        for field in &layout.fields {
            match field {
                FieldKind::Primitive(width) => reader.skip(*width)?,
                FieldKind::Reference => {
                    let oid = reader.u64()?;
                    if oid != 0 {
                        visit(ObjectId(oid));
                    }
                }
                FieldKind::ReferenceList => {
                    for oid in reader.references()? {
                        if oid.0 != 0 {
                            visit(oid);
                        }
                    }
                }
                FieldKind::Bytes => {
                    reader.bytes()?;
                }
            }
        }
        Ok(())
    }

    pub fn references_of(&self, type_id: TypeId, payload: &[u8]) -> Result<Vec<ObjectId>> {
        let mut references = Vec::new();
        self.iterate_references(type_id, payload, &mut |oid| references.push(oid))?;
        Ok(references)
    }
}

impl Default for TypeDictionary {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes payload fields in layout order
#[derive(Default)]
pub struct PayloadBuilder {
    buffer: Vec<u8>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        PayloadBuilder { buffer: Vec::new() }
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn reference(self, oid: Option<ObjectId>) -> Self {
        self.u64(oid.map(|o| o.0).unwrap_or(0))
    }

    pub fn references(mut self, oids: &[ObjectId]) -> Self {
        self.buffer.extend_from_slice(&(oids.len() as u32).to_le_bytes());
        for oid in oids {
            self.buffer.extend_from_slice(&oid.0.to_le_bytes());
        }
        self
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads payload fields in layout order
pub struct PayloadReader<'a> {
    payload: &'a [u8],
    position: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        PayloadReader { payload, position: 0 }
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.position.checked_add(length).filter(|end| *end <= self.payload.len());
        match end {
            Some(end) => {
                let slice = &self.payload[self.position..end];
                self.position = end;
                Ok(slice)
            }
            None => Err(Error::new(
                ErrorKind::InvalidEntityLength,
                format!(
                    "payload field of {} bytes at {} exceeds payload length {}",
                    length, self.position, self.payload.len()
                ),
            )),
        }
    }

    pub fn skip(&mut self, length: usize) -> Result<()> {
        self.take(length).map(|_| ())
    }

    pub fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn reference(&mut self) -> Result<Option<ObjectId>> {
        let oid = self.u64()?;
        Ok(if oid == 0 { None } else { Some(ObjectId(oid)) })
    }

    pub fn references(&mut self) -> Result<Vec<ObjectId>> {
        let count = self.u32()? as usize;
        let mut oids = Vec::with_capacity(count.min(self.payload.len() / 8));
        for _ in 0..count {
            oids.push(ObjectId(self.u64()?));
        }
        Ok(oids)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let length = self.u32()? as usize;
        self.take(length)
    }
}
