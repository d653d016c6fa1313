//! Utility functions and shared small types for the library.
use fixedbitset_stack::on_stack::{get_nblock, FixedBitSet};

/// A 256-bit set indexed by byte value.
pub(crate) type ByteSet = FixedBitSet<{ get_nblock(u8::MAX as usize) }>;

/// Render a byte as it would appear inside a single-quoted literal.
pub(crate) fn display_byte(byte: u8) -> String {
    match byte {
        b'\n' => "\\n".to_string(),
        b'\r' => "\\r".to_string(),
        b'\t' => "\\t".to_string(),
        0x20..=0x7e => (byte as char).to_string(),
        _ => format!("\\x{:02x}", byte),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_set_roundtrip() {
        let mut set = ByteSet::with_capacity(256);
        set.insert(b'a' as usize);
        set.insert(0xff);
        assert_eq!(set.ones().collect::<Vec<_>>(), vec![97, 255]);
    }

    #[test]
    fn display_byte_escapes() {
        assert_eq!(display_byte(b'\n'), "\\n");
        assert_eq!(display_byte(b'A'), "A");
        assert_eq!(display_byte(0x01), "\\x01");
    }
}
