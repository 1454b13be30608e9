//! ttyrec frame encoding.
//!
//! A recording is a sequence of `{sec: i32, usec: i32, len: i32}` headers in
//! little-endian byte order, each followed by `len` payload bytes. Players
//! like `ttyplay` and `ipbt` consume this directly.

use chrono::{DateTime, Local};

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Encode the header for a payload of `len` bytes captured at `stamp`.
pub fn header(stamp: DateTime<Local>, len: usize) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&(stamp.timestamp() as i32).to_le_bytes());
    out[4..8].copy_from_slice(&(stamp.timestamp_subsec_micros() as i32).to_le_bytes());
    out[8..12].copy_from_slice(&(len as i32).to_le_bytes());
    out
}

/// Append one full frame (header plus payload) to `out`.
pub fn append_frame(out: &mut Vec<u8>, stamp: DateTime<Local>, data: &[u8]) {
    out.extend_from_slice(&header(stamp, data.len()));
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn header_is_three_le_words() {
        let stamp = Local.timestamp_opt(1_700_000_000, 250_000_000).unwrap();
        let h = header(stamp, 5);
        assert_eq!(&h[0..4], &1_700_000_000i32.to_le_bytes());
        assert_eq!(&h[4..8], &250_000i32.to_le_bytes());
        assert_eq!(&h[8..12], &5i32.to_le_bytes());
    }

    #[test]
    fn frame_wraps_payload() {
        let stamp = Local.timestamp_opt(12, 0).unwrap();
        let mut out = Vec::new();
        append_frame(&mut out, stamp, b"hello");
        assert_eq!(out.len(), HEADER_LEN + 5);
        assert_eq!(&out[HEADER_LEN..], b"hello");
    }
}
