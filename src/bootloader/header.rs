//! Image header record shared by the installed image and every load slot.

use ufmt::derive::uDebug;

use crate::config::VALID_MASK;

/// Size of the persisted header record
pub const HEADER_SIZE: usize = 16;

/// Offset of `raw_crc` inside the record
pub const RAW_CRC_OFFSET: u32 = 6;

/// Width of `raw_crc`
pub const RAW_CRC_SIZE: u32 = 2;

/// Ordered firmware version, compared most significant field first
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, uDebug)]
pub struct Version {
    pub major: u8,
    pub middle: u8,
    pub minor: u8,
    pub comp: u8,
}

impl Version {
    pub const fn new(major: u8, middle: u8, minor: u8, comp: u8) -> Self {
        Self {
            major,
            middle,
            minor,
            comp,
        }
    }
}

/// Header layout, little endian:
///
/// | offset | field            |
/// |--------|------------------|
/// | 0      | `valid_mask`     |
/// | 1      | `image_id`       |
/// | 2..6   | version tuple    |
/// | 6      | `raw_crc`        |
/// | 8      | `image_size`     |
/// | 12     | `max_block_size` |
/// | 14     | reserved         |
#[derive(Clone, Copy, Debug, PartialEq, Eq, uDebug)]
pub struct ImageHeader {
    pub valid_mask: u8,
    pub image_id: u8,
    pub version: Version,
    pub raw_crc: u16,
    pub image_size: u32,
    pub max_block_size: u16,
}

impl ImageHeader {
    /// Header as read back from erased flash
    pub const fn blank() -> Self {
        Self {
            valid_mask: 0xFF,
            image_id: 0xFF,
            version: Version::new(0xFF, 0xFF, 0xFF, 0xFF),
            raw_crc: 0xFFFF,
            image_size: 0xFFFF_FFFF,
            max_block_size: 0xFFFF,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid_mask == VALID_MASK
    }

    pub fn from_bytes(raw: &[u8; HEADER_SIZE]) -> Self {
        Self {
            valid_mask: raw[0],
            image_id: raw[1],
            version: Version::new(raw[2], raw[3], raw[4], raw[5]),
            raw_crc: u16::from_le_bytes([raw[6], raw[7]]),
            image_size: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            max_block_size: u16::from_le_bytes([raw[12], raw[13]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0xFFu8; HEADER_SIZE];
        raw[0] = self.valid_mask;
        raw[1] = self.image_id;
        raw[2] = self.version.major;
        raw[3] = self.version.middle;
        raw[4] = self.version.minor;
        raw[5] = self.version.comp;
        raw[6..8].copy_from_slice(&self.raw_crc.to_le_bytes());
        raw[8..12].copy_from_slice(&self.image_size.to_le_bytes());
        raw[12..14].copy_from_slice(&self.max_block_size.to_le_bytes());
        raw
    }

    /// Same image family and version, regardless of checksum.
    pub fn same_release(&self, other: &ImageHeader) -> bool {
        self.image_id == other.image_id && self.version == other.version
    }
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self::blank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erased_flash_is_not_valid() {
        let header = ImageHeader::from_bytes(&[0xFF; HEADER_SIZE]);
        assert_eq!(header, ImageHeader::blank());
        assert!(!header.is_valid());
    }

    #[test]
    fn decodes_little_endian_fields() {
        let raw = [
            0xAA, 0x07, 1, 2, 3, 4, 0x34, 0x12, 0x00, 0xE0, 0x01, 0x00, 0x00, 0x01, 0xFF, 0xFF,
        ];
        let header = ImageHeader::from_bytes(&raw);

        assert!(header.is_valid());
        assert_eq!(header.image_id, 7);
        assert_eq!(header.version, Version::new(1, 2, 3, 4));
        assert_eq!(header.raw_crc, 0x1234);
        assert_eq!(header.image_size, 0x1E000);
        assert_eq!(header.max_block_size, 0x100);
        assert_eq!(header.to_bytes(), raw);
    }

    #[test]
    fn raw_crc_offset_matches_encoding() {
        let header = ImageHeader {
            raw_crc: 0xA55A,
            ..ImageHeader::blank()
        };
        let raw = header.to_bytes();
        let at = RAW_CRC_OFFSET as usize;
        assert_eq!(&raw[at..at + RAW_CRC_SIZE as usize], &[0x5A, 0xA5]);
    }

    #[test]
    fn versions_order_most_significant_first() {
        assert!(Version::new(2, 0, 0, 0) > Version::new(1, 9, 9, 9));
        assert!(Version::new(1, 2, 0, 0) > Version::new(1, 1, 9, 9));
        assert!(Version::new(1, 1, 1, 2) > Version::new(1, 1, 1, 1));
    }
}
