// qfiles.rs — on-disk layout of pk3 (zip) archives

/// Zip local file header magic ("PK\x03\x04").
pub const ZPAKHEADER: u32 = 0x0403_4b50;
/// Zip central directory header magic ("PK\x01\x02").
pub const ZPAKDIRHEADER: u32 = 0x0201_4b50;
/// Zip end of central directory magic ("PK\x05\x06").
pub const ZPAKENDHEADER: u32 = 0x0605_4b50;

pub const ZIP_METHOD_STORED: u16 = 0;
pub const ZIP_METHOD_DEFLATED: u16 = 8;

/// Bit 3 of the general purpose flags: sizes and CRC follow the data.
pub const ZIP_FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
/// Bit 0: member is encrypted.
pub const ZIP_FLAG_ENCRYPTED: u16 = 0x0001;

pub const MAX_FILES_IN_PACK: usize = 16384;

/// Zip local file header, the fixed 30-byte part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DZipHeader {
    pub ident: u32,
    pub version: u16,
    pub flags: u16,
    pub compression: u16,
    pub modtime: u16,
    pub moddate: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub filename_length: u16,
    pub extra_field_length: u16,
}

impl DZipHeader {
    pub const SIZE: usize = 30;

    /// Decode the little-endian header. Does not validate `ident`.
    pub fn parse(b: &[u8; Self::SIZE]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([b[o], b[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        Self {
            ident: u32_at(0),
            version: u16_at(4),
            flags: u16_at(6),
            compression: u16_at(8),
            modtime: u16_at(10),
            moddate: u16_at(12),
            crc32: u32_at(14),
            compressed_size: u32_at(18),
            uncompressed_size: u32_at(22),
            filename_length: u16_at(26),
            extra_field_length: u16_at(28),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.ident.to_le_bytes());
        b[4..6].copy_from_slice(&self.version.to_le_bytes());
        b[6..8].copy_from_slice(&self.flags.to_le_bytes());
        b[8..10].copy_from_slice(&self.compression.to_le_bytes());
        b[10..12].copy_from_slice(&self.modtime.to_le_bytes());
        b[12..14].copy_from_slice(&self.moddate.to_le_bytes());
        b[14..18].copy_from_slice(&self.crc32.to_le_bytes());
        b[18..22].copy_from_slice(&self.compressed_size.to_le_bytes());
        b[22..26].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        b[26..28].copy_from_slice(&self.filename_length.to_le_bytes());
        b[28..30].copy_from_slice(&self.extra_field_length.to_le_bytes());
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_header_layout() {
        let hdr = DZipHeader {
            ident: ZPAKHEADER,
            version: 20,
            flags: 0,
            compression: ZIP_METHOD_DEFLATED,
            modtime: 0,
            moddate: 0,
            crc32: 0xdead_beef,
            compressed_size: 12,
            uncompressed_size: 34,
            filename_length: 5,
            extra_field_length: 0,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(&bytes[0..4], b"PK\x03\x04");
        assert_eq!(DZipHeader::parse(&bytes), hdr);
    }
}
