#![cfg(feature = "postcard")]

//! Serde payloads carried as a postcard-encoded byte array.

use serde::{Serialize, de::DeserializeOwned};

use crate::{BinderError, Result};

use super::Parcel;

impl Parcel {
    /// Writes `value` as an i32 length followed by its postcard encoding.
    pub fn write_postcard<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let encoded = ::postcard::to_allocvec(value).map_err(BinderError::postcard_encode)?;
        self.write_byte_array(&encoded)
    }

    pub fn read_postcard<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.read_byte_array()?;
        ::postcard::from_bytes(bytes).map_err(BinderError::postcard_decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    enum SlotCommand {
        MarkBootSuccessful,
        SetActive(u32),
        Query { slot: u32, bootable: bool },
    }

    #[test]
    fn postcard_roundtrip_enum() {
        let mut p = Parcel::new();
        p.write_postcard(&SlotCommand::SetActive(1)).expect("write");
        p.write_i32(-1).expect("trailer");
        p.write_postcard(&SlotCommand::Query { slot: 0, bootable: true }).expect("write");

        assert_eq!(p.read_postcard::<SlotCommand>().expect("read"), SlotCommand::SetActive(1));
        assert_eq!(p.read_i32().unwrap(), -1);
        assert_eq!(
            p.read_postcard::<SlotCommand>().expect("read"),
            SlotCommand::Query { slot: 0, bootable: true }
        );
        assert_eq!(p.data_avail(), 0);
    }

    #[test]
    fn postcard_is_compact() {
        let mut p = Parcel::new();
        p.write_postcard(&SlotCommand::MarkBootSuccessful).unwrap();
        // length word + one tag byte padded
        assert_eq!(p.data_size(), 8);
    }

    #[test]
    fn postcard_decode_error() {
        let mut p = Parcel::new();
        p.write_byte_array(&[0xff, 0xff, 0xff]).unwrap();
        let err = p.read_postcard::<String>().unwrap_err();
        assert!(err.is(StatusCode::PostcardDecode));
    }
}
