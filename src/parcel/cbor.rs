#![cfg(feature = "cbor")]

//! Serde payloads carried as a CBOR-encoded byte array.

use serde::{Serialize, de::DeserializeOwned};

use crate::{BinderError, Result};

use super::Parcel;

impl Parcel {
    pub fn write_cbor<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let encoded = ::serde_cbor::to_vec(value).map_err(BinderError::cbor_encode)?;
        self.write_byte_array(&encoded)
    }

    pub fn read_cbor<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.read_byte_array()?;
        ::serde_cbor::from_slice(bytes).map_err(BinderError::cbor_decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct SlotInfo {
        suffix: String,
        retries: u8,
        sizes: Vec<u64>,
    }

    #[test]
    fn cbor_roundtrip_struct() {
        let info = SlotInfo { suffix: "_a".into(), retries: 7, sizes: vec![4096, 1 << 20] };
        let mut p = Parcel::new();
        p.write_cbor(&info).expect("write");
        assert_eq!(p.read_cbor::<SlotInfo>().expect("read"), info);
    }

    #[test]
    fn cbor_sequence_keeps_alignment() {
        let mut p = Parcel::new();
        p.write_cbor(&"first").unwrap();
        p.write_cbor(&12345u64).unwrap();
        assert_eq!(p.data_size() % 4, 0);
        assert_eq!(p.read_cbor::<String>().unwrap(), "first");
        assert_eq!(p.read_cbor::<u64>().unwrap(), 12345);
    }

    #[test]
    fn cbor_decode_error_leaves_next_payload_readable() {
        let mut p = Parcel::new();
        p.write_byte_array(&[0xff, 0xff, 0xff]).unwrap();
        p.write_cbor(&"valid").unwrap();
        assert!(p.read_cbor::<String>().unwrap_err().is(StatusCode::CborDecode));
        assert_eq!(p.read_cbor::<String>().unwrap(), "valid");
    }
}
