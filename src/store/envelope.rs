//! Versioned envelope wrapping every blob a durable backend writes

use super::StoreError;
use crate::Uid;
use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;

/// Current envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

/// On-disk wrapper: format version, owning key and the packed state.
#[derive(Clone, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Envelope {
    /// Format version
    pub version: u32,
    /// Owner uid in binary form
    pub uid: [u8; 20],
    /// Store type name
    pub type_name: String,
    /// Packed object state
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a payload for (uid, type)
    pub fn new(uid: Uid, type_name: &str, payload: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            uid: uid.to_bytes(),
            type_name: type_name.to_owned(),
            payload,
        }
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rkyv::to_bytes::<RkyvError>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| StoreError::Storage(e.to_string().into()))
    }

    /// Decode bytes read for (uid, type), checking the key and version match
    pub fn decode(uid: Uid, type_name: &str, raw: &[u8]) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            uid,
            type_name: type_name.into(),
            reason: reason.into(),
        };
        let mut aligned = AlignedVec::<16>::with_capacity(raw.len());
        aligned.extend_from_slice(raw);
        let envelope = rkyv::from_bytes::<Envelope, RkyvError>(&aligned)
            .map_err(|e| corrupt(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(corrupt(format!("unsupported version {}", envelope.version)));
        }
        if envelope.uid != uid.to_bytes() || envelope.type_name != type_name {
            return Err(corrupt("envelope key mismatch".to_owned()));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_foreign_key() {
        let uid = Uid::from_parts(1, 2, 3, 4);
        let bytes = Envelope::new(uid, "/A", vec![1, 2, 3]).encode().unwrap();
        let back = Envelope::decode(uid, "/A", &bytes).unwrap();
        assert_eq!(back.payload, vec![1, 2, 3]);
        assert!(Envelope::decode(Uid::from_parts(1, 2, 3, 5), "/A", &bytes).is_err());
        assert!(Envelope::decode(uid, "/B", &bytes).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        let uid = Uid::from_parts(1, 2, 3, 4);
        assert!(matches!(
            Envelope::decode(uid, "/A", b"not an envelope"),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
