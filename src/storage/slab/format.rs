//! On-disk file format
//!
//! A database file starts with a 24-byte header: two 64-bit top-refs (only
//! one valid at a time), the magic `"T-DB"`, two file-format versions, a
//! reserved byte, and a flags byte whose bit 0 (the *select* bit) chooses
//! the live top-ref / file-format slot. Committing writes the inactive slot,
//! syncs, then flips the select bit, so one slot is always durable.
//!
//! A file produced by streaming serialization instead carries
//! `0xFFFF_FFFF_FFFF_FFFF` in top-ref slot 0 and stores the real top-ref in
//! a 16-byte footer at the end of the file. Such a file is on *streaming
//! form* until the first update commits it to header form.
//!
//! All multi-byte fields are little-endian.

use crate::error::{Error, Result};

/// Size of the file header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Size of the streaming footer in bytes.
pub const FOOTER_SIZE: usize = 16;

/// Magic bytes identifying a TDB file.
pub const MAGIC: [u8; 4] = *b"T-DB";

/// File format version written by this library.
pub const CURRENT_FILE_FORMAT: u8 = 3;

/// Flags bit 0: selects the live top-ref / file-format slot.
pub const FLAGS_SELECT_BIT: u8 = 0x1;

/// Flags bit 1: file was created with server-sync support.
pub const FLAGS_SERVER_SYNC_MODE: u8 = 0x2;

/// Top-ref slot 0 value marking a file on streaming form.
pub const STREAMING_TOP_REF: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Magic cookie validating the streaming footer.
pub const FOOTER_MAGIC_COOKIE: u64 = 0x3034_1252_37e5_26c8;

/// The 24-byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub top_ref: [u64; 2],
    pub magic: [u8; 4],
    pub file_format: [u8; 2],
    pub reserved: u8,
    pub flags: u8,
}

impl Header {
    /// Header of a freshly created, empty database file.
    pub fn empty(server_sync_mode: bool) -> Self {
        Self {
            top_ref: [0, 0],
            magic: MAGIC,
            file_format: [CURRENT_FILE_FORMAT, CURRENT_FILE_FORMAT],
            reserved: 0,
            flags: if server_sync_mode {
                FLAGS_SERVER_SYNC_MODE
            } else {
                0
            },
        }
    }

    /// Canonical header of a file on streaming form.
    pub fn streaming() -> Self {
        Self {
            top_ref: [STREAMING_TOP_REF, 0],
            magic: MAGIC,
            file_format: [CURRENT_FILE_FORMAT, CURRENT_FILE_FORMAT],
            reserved: 0,
            flags: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.top_ref[0].to_le_bytes());
        bytes[8..16].copy_from_slice(&self.top_ref[1].to_le_bytes());
        bytes[16..20].copy_from_slice(&self.magic);
        bytes[20] = self.file_format[0];
        bytes[21] = self.file_format[1];
        bytes[22] = self.reserved;
        bytes[23] = self.flags;
        bytes
    }

    /// Decode a header from the first `HEADER_SIZE` bytes of `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is shorter than `HEADER_SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut top_ref0 = [0u8; 8];
        let mut top_ref1 = [0u8; 8];
        top_ref0.copy_from_slice(&data[0..8]);
        top_ref1.copy_from_slice(&data[8..16]);
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[16..20]);
        Self {
            top_ref: [u64::from_le_bytes(top_ref0), u64::from_le_bytes(top_ref1)],
            magic,
            file_format: [data[20], data[21]],
            reserved: data[22],
            flags: data[23],
        }
    }

    /// Index of the live top-ref / file-format slot.
    pub fn select_field(&self) -> usize {
        (self.flags & FLAGS_SELECT_BIT) as usize
    }
}

/// The 16-byte footer of a file on streaming form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingFooter {
    pub top_ref: u64,
    pub magic_cookie: u64,
}

impl StreamingFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut bytes = [0u8; FOOTER_SIZE];
        bytes[0..8].copy_from_slice(&self.top_ref.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.magic_cookie.to_le_bytes());
        bytes
    }

    /// Decode a footer from the last `FOOTER_SIZE` bytes of `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is shorter than `FOOTER_SIZE`.
    pub fn from_bytes(data: &[u8]) -> Self {
        let at = data.len() - FOOTER_SIZE;
        let mut top_ref = [0u8; 8];
        let mut cookie = [0u8; 8];
        top_ref.copy_from_slice(&data[at..at + 8]);
        cookie.copy_from_slice(&data[at + 8..at + 16]);
        Self {
            top_ref: u64::from_le_bytes(top_ref),
            magic_cookie: u64::from_le_bytes(cookie),
        }
    }
}

/// Outcome of a successful buffer validation.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedBuffer {
    /// Root ref of the stored data structure.
    pub top_ref: usize,
    /// Live file-format version.
    pub file_format: u8,
    /// Whether the file is on streaming form.
    pub streaming_form: bool,
}

/// Validate a database buffer (mapped file or caller-supplied memory).
///
/// Checks size and alignment, the magic, the file-format version (allowing
/// a v2 file to be opened as v3 through a shared group), and that the live
/// top-ref lies within the buffer. Resolves the top-ref through the
/// streaming footer when the file is on streaming form.
pub fn validate_buffer(data: &[u8], is_shared: bool) -> Result<ValidatedBuffer> {
    let size = data.len();
    if size < HEADER_SIZE || size % 8 != 0 {
        return Err(Error::InvalidDatabase("Database file has bad size".to_string()));
    }

    let header = Header::from_bytes(data);
    if header.magic != MAGIC {
        return Err(Error::InvalidDatabase("Not a TDB file".to_string()));
    }

    let valid_part = header.select_field();

    let file_format = header.file_format[valid_part];
    let mut bad_file_format = file_format != CURRENT_FILE_FORMAT;
    // Special case: version 2 files may be upgraded to version 3, but only
    // when accessed through a shared group.
    if file_format == 2 && CURRENT_FILE_FORMAT == 3 && is_shared {
        bad_file_format = false;
    }
    if bad_file_format {
        return Err(Error::InvalidDatabase(
            "Unsupported file format version".to_string(),
        ));
    }

    let mut ref_ = header.top_ref[valid_part];
    let mut streaming_form = false;
    if valid_part == 0 && ref_ == STREAMING_TOP_REF {
        if size < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::InvalidDatabase(
                "Database file in streaming form has bad size".to_string(),
            ));
        }
        let footer = StreamingFooter::from_bytes(data);
        if footer.magic_cookie != FOOTER_MAGIC_COOKIE {
            return Err(Error::InvalidDatabase("Bad database header (#1)".to_string()));
        }
        ref_ = footer.top_ref;
        streaming_form = true;
    }

    if ref_ % 8 != 0 {
        return Err(Error::InvalidDatabase("Bad database header (#2)".to_string()));
    }
    if ref_ >= size as u64 {
        return Err(Error::InvalidDatabase("Bad database header (#3)".to_string()));
    }

    Ok(ValidatedBuffer {
        top_ref: ref_ as usize,
        file_format,
        streaming_form,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with_header(header: Header, size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        buf
    }

    #[test]
    fn test_header_round_trip() {
        let header = Header {
            top_ref: [0x1122_3344_5566_7788, 0x99aa_bbcc_ddee_ff00],
            magic: MAGIC,
            file_format: [2, 3],
            reserved: 0,
            flags: FLAGS_SELECT_BIT | FLAGS_SERVER_SYNC_MODE,
        };
        let decoded = Header::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert_eq!(decoded.select_field(), 1);
    }

    #[test]
    fn test_header_is_little_endian() {
        let header = Header::empty(false);
        let mut bytes = header.to_bytes();
        // top_ref[0] = 8 encoded little-endian: low byte first
        bytes[0] = 8;
        let decoded = Header::from_bytes(&bytes);
        assert_eq!(decoded.top_ref[0], 8);
    }

    #[test]
    fn test_footer_round_trip() {
        let footer = StreamingFooter {
            top_ref: 1024,
            magic_cookie: FOOTER_MAGIC_COOKIE,
        };
        let decoded = StreamingFooter::from_bytes(&footer.to_bytes());
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_validate_empty_header() -> crate::error::Result<()> {
        let buf = buffer_with_header(Header::empty(false), 4096);
        let v = validate_buffer(&buf, false)?;
        assert_eq!(v.top_ref, 0);
        assert_eq!(v.file_format, CURRENT_FILE_FORMAT);
        assert!(!v.streaming_form);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_size() {
        // Too small
        let buf = vec![0u8; 16];
        assert!(validate_buffer(&buf, false).is_err());

        // Unaligned
        let buf = buffer_with_header(Header::empty(false), 4097);
        assert!(validate_buffer(&buf, false).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_magic() {
        let mut header = Header::empty(false);
        header.magic = *b"NOPE";
        let buf = buffer_with_header(header, 4096);
        assert!(validate_buffer(&buf, false).is_err());
    }

    #[test]
    fn test_version_2_upgrade_gate() {
        let mut header = Header::empty(false);
        header.file_format = [2, 2];
        let buf = buffer_with_header(header, 4096);

        // Opening through a shared group upgrades v2 to v3
        let v = validate_buffer(&buf, true).expect("shared open of v2 file");
        assert_eq!(v.file_format, 2);

        // Unshared open of a v2 file is rejected
        assert!(validate_buffer(&buf, false).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let mut header = Header::empty(false);
        header.file_format = [9, 9];
        let buf = buffer_with_header(header, 4096);
        assert!(validate_buffer(&buf, true).is_err());
    }

    #[test]
    fn test_select_bit_picks_slot_one() -> crate::error::Result<()> {
        let header = Header {
            top_ref: [0xdead_beef, 128],
            magic: MAGIC,
            file_format: [9, CURRENT_FILE_FORMAT],
            reserved: 0,
            flags: FLAGS_SELECT_BIT,
        };
        let buf = buffer_with_header(header, 4096);
        let v = validate_buffer(&buf, false)?;
        assert_eq!(v.top_ref, 128);
        assert_eq!(v.file_format, CURRENT_FILE_FORMAT);
        Ok(())
    }

    #[test]
    fn test_streaming_form_resolution() -> crate::error::Result<()> {
        let mut buf = buffer_with_header(Header::streaming(), 4096);
        let footer = StreamingFooter {
            top_ref: 2048,
            magic_cookie: FOOTER_MAGIC_COOKIE,
        };
        let at = buf.len() - FOOTER_SIZE;
        buf[at..].copy_from_slice(&footer.to_bytes());

        let v = validate_buffer(&buf, false)?;
        assert!(v.streaming_form);
        assert_eq!(v.top_ref, 2048);
        Ok(())
    }

    #[test]
    fn test_streaming_form_bad_cookie() {
        let mut buf = buffer_with_header(Header::streaming(), 4096);
        let footer = StreamingFooter {
            top_ref: 2048,
            magic_cookie: 0x1234,
        };
        let at = buf.len() - FOOTER_SIZE;
        buf[at..].copy_from_slice(&footer.to_bytes());
        assert!(validate_buffer(&buf, false).is_err());
    }

    #[test]
    fn test_streaming_form_too_small() {
        // Header only: no room for the footer
        let buf = buffer_with_header(Header::streaming(), HEADER_SIZE);
        assert!(validate_buffer(&buf, false).is_err());
    }

    #[test]
    fn test_top_ref_bounds_and_alignment() {
        // Unaligned top-ref
        let mut header = Header::empty(false);
        header.top_ref[0] = 12;
        let buf = buffer_with_header(header, 4096);
        assert!(validate_buffer(&buf, false).is_err());

        // Top-ref outside the buffer
        let mut header = Header::empty(false);
        header.top_ref[0] = 4096;
        let buf = buffer_with_header(header, 4096);
        assert!(validate_buffer(&buf, false).is_err());
    }
}
