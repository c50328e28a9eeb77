//! Binary marshalling into the adapter's per-column scratch slots.
//!
//! Everything integer goes out in network byte order, doubles as their
//! big-endian IEEE-754 bit pattern, strings as UTF-8 text, blobs as raw
//! bytes, and numeric vectors as JSON text. These are exactly the binary
//! parameter formats the backend expects for the column types in the
//! typemap, so a slot can be handed to a prepared statement verbatim.

use bytes::{BufMut, BytesMut};
use serde::Serialize;

pub(crate) fn put_i32(slot: &mut BytesMut, value: i32) {
    slot.clear();
    slot.put_i32(value);
}

/// Unsigned 32-bit values are stored in 64-bit signed columns; widening
/// preserves the value.
pub(crate) fn put_u32(slot: &mut BytesMut, value: u32) {
    put_i64(slot, i64::from(value));
}

pub(crate) fn put_i64(slot: &mut BytesMut, value: i64) {
    slot.clear();
    slot.put_i64(value);
}

/// Unsigned 64-bit values are reinterpreted into the same-width signed
/// column; values above `i64::MAX` come back negative.
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn put_u64(slot: &mut BytesMut, value: u64) {
    put_i64(slot, value as i64);
}

pub(crate) fn put_f64(slot: &mut BytesMut, value: f64) {
    slot.clear();
    slot.put_f64(value);
}

pub(crate) fn put_bool(slot: &mut BytesMut, value: bool) {
    slot.clear();
    slot.put_u8(u8::from(value));
}

pub(crate) fn put_text(slot: &mut BytesMut, value: &str) {
    slot.clear();
    slot.extend_from_slice(value.as_bytes());
}

pub(crate) fn put_blob(slot: &mut BytesMut, value: &[u8]) {
    slot.clear();
    slot.extend_from_slice(value);
}

pub(crate) fn put_json_vector<T: Serialize>(
    slot: &mut BytesMut,
    values: &[T],
) -> Result<(), serde_json::Error> {
    slot.clear();
    let text = serde_json::to_string(values)?;
    slot.extend_from_slice(text.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{
        put_blob, put_bool, put_f64, put_i32, put_i64, put_json_vector, put_text, put_u32, put_u64,
    };

    // The decode side of the round trip, as the backend would read a binary
    // column of the corresponding type.
    fn read_i32(slot: &[u8]) -> i32 {
        i32::from_be_bytes(slot.try_into().unwrap())
    }

    fn read_i64(slot: &[u8]) -> i64 {
        i64::from_be_bytes(slot.try_into().unwrap())
    }

    fn read_f64(slot: &[u8]) -> f64 {
        f64::from_be_bytes(slot.try_into().unwrap())
    }

    #[test]
    fn i32_round_trips_in_network_order() {
        let mut slot = BytesMut::new();
        for value in [0, 1, -1, i32::MIN, i32::MAX] {
            put_i32(&mut slot, value);
            assert_eq!(slot.len(), 4);
            assert_eq!(read_i32(&slot), value);
        }
        put_i32(&mut slot, 0x0102_0304);
        assert_eq!(&slot[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn u32_widens_into_i64() {
        let mut slot = BytesMut::new();
        for value in [0u32, 1, u32::MAX] {
            put_u32(&mut slot, value);
            assert_eq!(slot.len(), 8);
            assert_eq!(read_i64(&slot), i64::from(value));
        }
    }

    #[test]
    fn i64_round_trips_in_network_order() {
        let mut slot = BytesMut::new();
        for value in [0, 1, -1, i64::MIN, i64::MAX] {
            put_i64(&mut slot, value);
            assert_eq!(read_i64(&slot), value);
        }
    }

    #[test]
    fn u64_above_i64_max_wraps_negative() {
        let mut slot = BytesMut::new();
        put_u64(&mut slot, u64::MAX);
        assert_eq!(read_i64(&slot), -1);

        put_u64(&mut slot, 42);
        assert_eq!(read_i64(&slot), 42);
    }

    #[test]
    fn doubles_are_bit_exact() {
        let mut slot = BytesMut::new();
        for value in [0.0, -0.0, 3.14, f64::MIN_POSITIVE, f64::INFINITY] {
            put_f64(&mut slot, value);
            assert_eq!(read_f64(&slot).to_bits(), value.to_bits());
        }
        put_f64(&mut slot, f64::NAN);
        assert_eq!(read_f64(&slot).to_bits(), f64::NAN.to_bits());
    }

    #[test]
    fn bool_is_a_single_byte() {
        let mut slot = BytesMut::new();
        put_bool(&mut slot, true);
        assert_eq!(&slot[..], &[1]);
        put_bool(&mut slot, false);
        assert_eq!(&slot[..], &[0]);
    }

    #[test]
    fn text_and_blob_pass_through() {
        let mut slot = BytesMut::new();
        put_text(&mut slot, "héllo");
        assert_eq!(&slot[..], "héllo".as_bytes());

        put_blob(&mut slot, &[0, 159, 146, 150]);
        assert_eq!(&slot[..], &[0, 159, 146, 150]);
    }

    #[test]
    fn vectors_render_as_json_text() {
        let mut slot = BytesMut::new();
        put_json_vector(&mut slot, &[1.0f64, 2.0]).unwrap();
        assert_eq!(&slot[..], b"[1.0,2.0]");

        let decoded: Vec<f64> = serde_json::from_slice(&slot).unwrap();
        assert_eq!(decoded, vec![1.0, 2.0]);

        put_json_vector(&mut slot, &[true, false]).unwrap();
        assert_eq!(&slot[..], b"[true,false]");
    }

    #[test]
    fn slots_are_reused_without_leftovers() {
        let mut slot = BytesMut::new();
        put_text(&mut slot, "a long value that grows the slot");
        let grown = slot.capacity();
        put_text(&mut slot, "x");
        assert_eq!(&slot[..], b"x");
        assert!(slot.capacity() >= grown.min(1));
    }
}
