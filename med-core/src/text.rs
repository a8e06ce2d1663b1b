//! Fixed-width UTF-8 fields.
//!
//! MED stores names and descriptions in fixed-size on-disk fields as
//! NUL-terminated UTF-8; bytes after the terminator are undefined and
//! must be preserved on rewrite.

use crate::error::{MedError, Result};

/// Read a NUL-terminated UTF-8 string from a fixed-width field.
pub fn read_fixed_utf8(field: &[u8]) -> Result<String> {
    let end = memchr::memchr(0, field).unwrap_or(field.len());
    let s = std::str::from_utf8(&field[..end]).map_err(|e| {
        MedError::decode(format!("invalid UTF-8 in fixed-width field: {e}"))
    })?;
    Ok(s.to_owned())
}

/// Write a string into a fixed-width field, NUL-terminating it and
/// zero-filling the remainder. The string must leave room for the
/// terminator.
pub fn write_fixed_utf8(field: &mut [u8], s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= field.len() {
        return Err(MedError::parameter(format!(
            "string of {} bytes does not fit a {}-byte field",
            bytes.len(),
            field.len()
        )));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    field[bytes.len()..].fill(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut field = [0xAAu8; 32];
        write_fixed_utf8(&mut field, "frontal-Fp1").unwrap();
        assert_eq!(read_fixed_utf8(&field).unwrap(), "frontal-Fp1");
        // Remainder is zero-filled.
        assert!(field[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn unterminated_field_reads_to_width() {
        let field = *b"abcd";
        assert_eq!(read_fixed_utf8(&field).unwrap(), "abcd");
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut field = [0u8; 4];
        assert!(write_fixed_utf8(&mut field, "abcd").is_err());
        assert!(write_fixed_utf8(&mut field, "abc").is_ok());
    }

    #[test]
    fn multibyte_utf8_survives() {
        let mut field = [0u8; 64];
        write_fixed_utf8(&mut field, "électrode-µV").unwrap();
        assert_eq!(read_fixed_utf8(&field).unwrap(), "électrode-µV");
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let field = [0xFF, 0xFE, 0x00, 0x00];
        assert!(read_fixed_utf8(&field).is_err());
    }
}
