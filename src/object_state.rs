//! Length-prefixed packing of object state blobs
//!
//! Integers are fixed-width big-endian, strings and byte arrays carry a u32
//! length prefix, a `Uid` is its four fields in order.

use crate::Uid;

/// Error unpacking a state blob
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Ran past the end of the buffer
    #[error("state underflow: wanted {wanted} bytes, {remaining} left")]
    Underflow {
        /// Bytes requested
        wanted: usize,
        /// Bytes remaining
        remaining: usize,
    },
    /// String field was not valid utf-8
    #[error("invalid utf-8 in packed string")]
    Utf8,
    /// A tag byte had no meaning
    #[error("unknown tag {tag} for {what}")]
    UnknownTag {
        /// Field being decoded
        what: &'static str,
        /// Raw tag
        tag: u32,
    },
}

/// Blob being written, bound to the (uid, type) it will be stored under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputObjectState {
    uid: Uid,
    type_name: Box<str>,
    buffer: Vec<u8>,
}

impl OutputObjectState {
    /// Empty state for `uid` under `type_name`
    pub fn new(uid: Uid, type_name: &str) -> Self {
        Self {
            uid,
            type_name: type_name.into(),
            buffer: Vec::new(),
        }
    }

    /// State whose content is an already-packed image
    pub fn with_bytes(uid: Uid, type_name: &str, buffer: Vec<u8>) -> Self {
        Self {
            uid,
            type_name: type_name.into(),
            buffer,
        }
    }

    /// Owner uid
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Store type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Packed bytes so far
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the packed bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Append a bool as one byte
    pub fn pack_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Append a byte
    pub fn pack_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Append a u32
    pub fn pack_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Append an i32
    pub fn pack_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a u64
    pub fn pack_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Append an i64
    pub fn pack_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a length-prefixed byte array
    pub fn pack_bytes(&mut self, value: &[u8]) {
        self.pack_u32(value.len() as u32);
        self.buffer.extend_from_slice(value);
    }

    /// Append a length-prefixed utf-8 string
    pub fn pack_string(&mut self, value: &str) {
        self.pack_bytes(value.as_bytes());
    }

    /// Append a uid
    pub fn pack_uid(&mut self, uid: Uid) {
        self.buffer.extend_from_slice(&uid.to_bytes());
    }

    /// Append the standard header: originating process and transaction
    pub fn pack_header(&mut self, process: Uid, transaction: Uid) {
        self.pack_uid(process);
        self.pack_uid(transaction);
    }
}

/// Blob being read back.
#[derive(Clone, Debug)]
pub struct InputObjectState {
    uid: Uid,
    type_name: Box<str>,
    buffer: Vec<u8>,
    cursor: usize,
}

impl InputObjectState {
    /// Wrap raw bytes read from the store
    pub fn new(uid: Uid, type_name: &str, buffer: Vec<u8>) -> Self {
        Self {
            uid,
            type_name: type_name.into(),
            buffer,
            cursor: 0,
        }
    }

    /// Owner uid
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Store type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// All bytes, ignoring the cursor
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    fn take(&mut self, wanted: usize) -> Result<&[u8], StateError> {
        let remaining = self.remaining();
        if wanted > remaining {
            return Err(StateError::Underflow { wanted, remaining });
        }
        let start = self.cursor;
        self.cursor += wanted;
        Ok(&self.buffer[start..self.cursor])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], StateError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a bool
    pub fn unpack_bool(&mut self) -> Result<bool, StateError> {
        Ok(self.unpack_u8()? != 0)
    }

    /// Read a byte
    pub fn unpack_u8(&mut self) -> Result<u8, StateError> {
        Ok(self.take(1)?[0])
    }

    /// Read a u32
    pub fn unpack_u32(&mut self) -> Result<u32, StateError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    /// Read an i32
    pub fn unpack_i32(&mut self) -> Result<i32, StateError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    /// Read a u64
    pub fn unpack_u64(&mut self) -> Result<u64, StateError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    /// Read an i64
    pub fn unpack_i64(&mut self) -> Result<i64, StateError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Read a length-prefixed byte array
    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, StateError> {
        let len = self.unpack_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed string
    pub fn unpack_string(&mut self) -> Result<String, StateError> {
        String::from_utf8(self.unpack_bytes()?).map_err(|_| StateError::Utf8)
    }

    /// Read a uid
    pub fn unpack_uid(&mut self) -> Result<Uid, StateError> {
        let raw: [u8; 20] = self.take_array()?;
        Ok(Uid::from_bytes(&raw).unwrap_or(Uid::NIL))
    }

    /// Read the standard header: (process, transaction)
    pub fn unpack_header(&mut self) -> Result<(Uid, Uid), StateError> {
        let process = self.unpack_uid()?;
        let transaction = self.unpack_uid()?;
        Ok((process, transaction))
    }
}

impl From<OutputObjectState> for InputObjectState {
    fn from(out: OutputObjectState) -> Self {
        Self {
            uid: out.uid,
            type_name: out.type_name,
            buffer: out.buffer,
            cursor: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_fields_unpack_in_order() {
        let uid = Uid::from_parts(1, 2, 3, 4);
        let mut out = OutputObjectState::new(uid, "/Test");
        out.pack_header(Uid::from_parts(1, 2, 3, 0), uid);
        out.pack_string("account-7");
        out.pack_i64(-42);
        out.pack_bytes(&[]);
        out.pack_bool(true);
        out.pack_u32(7);

        let mut input = InputObjectState::from(out);
        assert_eq!(input.unpack_header().unwrap(), (Uid::from_parts(1, 2, 3, 0), uid));
        assert_eq!(input.unpack_string().unwrap(), "account-7");
        assert_eq!(input.unpack_i64().unwrap(), -42);
        assert!(input.unpack_bytes().unwrap().is_empty());
        assert!(input.unpack_bool().unwrap());
        assert_eq!(input.unpack_u32().unwrap(), 7);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn truncated_blob_reports_underflow() {
        let mut out = OutputObjectState::new(Uid::NIL, "/Test");
        out.pack_u32(100);
        let mut input = InputObjectState::from(out);
        assert_eq!(
            input.unpack_bytes(),
            Err(StateError::Underflow {
                wanted: 100,
                remaining: 0
            })
        );
    }
}
