use crate::error::Result;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encode(what, e.to_string()))
}

/// Serialize a value into a writer using bincode
pub fn serialize_into<T: Serialize, W: Write>(what: &'static str, writer: W, value: &T) -> Result<()> {
    bincode::serialize_into(writer, value).map_err(|e| Error::Encode(what, e.to_string()))
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(what: &'static str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Decode(what, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::Pointer;

    #[test]
    fn test_pointer_encoding() {
        let pointer = Pointer {
            fp: 42,
            timestamp: 7,
            tombstoned: false,
            version: 3,
            value: Some(b"inline".to_vec()),
        };
        let bytes = serialize("pointer", &pointer).unwrap();
        let decoded: Pointer = deserialize("pointer", &bytes).unwrap();
        assert_eq!(pointer, decoded);
    }

    #[test]
    fn test_serialize_into_writer() {
        let mut buffer = Vec::new();
        serialize_into("pair", &mut buffer, &(1i64, b"abc".to_vec())).unwrap();
        let decoded: (i64, Vec<u8>) = deserialize("pair", &buffer).unwrap();
        assert_eq!(decoded, (1, b"abc".to_vec()));
    }

    #[test]
    fn test_invalid_data() {
        let invalid = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<Pointer> = deserialize("pointer", &invalid);
        assert!(matches!(result, Err(Error::Decode("pointer", _))));
    }
}
