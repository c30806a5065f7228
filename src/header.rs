use crate::checked_file::{CheckedFile, OffsetMode, PHYSICAL_PAGE_SIZE};
use crate::error::Converter;
use crate::{Error, Result};
use std::io::{Read, Seek, Write};

const SIGNATURE: &[u8; 8] = b"ASTM-E57";
const MAJOR_VERSION: u32 = 1;
const MINOR_VERSION: u32 = 0;

/// Represents the file structure from the start of an E57 file.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Header {
    /// File header signature that must be always "ASTM-E57".
    pub signature: [u8; 8],

    /// Major version number of the E57 format of the file.
    pub major: u32,

    /// Minor version number of the E57 format of the file.
    pub minor: u32,

    /// Physical length of the E57 file on disk or in memory.
    pub phys_length: u64,

    /// Physical offset of the XML data inside the file.
    pub phys_xml_offset: u64,

    /// Logical (without CRC bytes) length of the XML data.
    pub xml_length: u64,

    /// Page size of the E57 file.
    pub page_size: u64,
}

impl Header {
    pub const SIZE: usize = 48;

    /// Parses and validates the header bytes.
    pub fn from_bytes(data: &[u8; Self::SIZE]) -> Result<Self> {
        let u32_at = |offset: usize| -> Result<u32> {
            let bytes = data[offset..offset + 4].try_into().internal_err("Bad header offset")?;
            Ok(u32::from_le_bytes(bytes))
        };
        let u64_at = |offset: usize| -> Result<u64> {
            let bytes = data[offset..offset + 8].try_into().internal_err("Bad header offset")?;
            Ok(u64::from_le_bytes(bytes))
        };

        let header = Header {
            signature: data[0..8].try_into().internal_err("Bad header offset")?,
            major: u32_at(8)?,
            minor: u32_at(12)?,
            phys_length: u64_at(16)?,
            phys_xml_offset: u64_at(24)?,
            xml_length: u64_at(32)?,
            page_size: u64_at(40)?,
        };

        if &header.signature != SIGNATURE {
            Err(Error::BadFileSignature {
                reason: format!("Found signature {:?} instead of ASTM-E57", header.signature),
            })?
        }
        if header.major != MAJOR_VERSION || header.minor > MINOR_VERSION {
            Err(Error::UnknownFileVersion {
                reason: format!("Version {}.{} is not supported", header.major, header.minor),
            })?
        }
        if header.page_size != PHYSICAL_PAGE_SIZE {
            Err(Error::BadFileLength {
                reason: format!("Page size {} is not supported", header.page_size),
            })?
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0_u8; Self::SIZE];
        data[0..8].copy_from_slice(&self.signature);
        data[8..12].copy_from_slice(&self.major.to_le_bytes());
        data[12..16].copy_from_slice(&self.minor.to_le_bytes());
        data[16..24].copy_from_slice(&self.phys_length.to_le_bytes());
        data[24..32].copy_from_slice(&self.phys_xml_offset.to_le_bytes());
        data[32..40].copy_from_slice(&self.xml_length.to_le_bytes());
        data[40..48].copy_from_slice(&self.page_size.to_le_bytes());
        data
    }

    /// Reads the header from the start of the file.
    pub(crate) fn read<T: Read + Write + Seek>(file: &mut CheckedFile<T>) -> Result<Self> {
        let mut data = [0_u8; Self::SIZE];
        file.seek(0, OffsetMode::Logical)?;
        file.read(&mut data)?;
        Self::from_bytes(&data)
    }

    /// Writes the header to the start of the file.
    pub(crate) fn write<T: Read + Write + Seek>(&self, file: &mut CheckedFile<T>) -> Result<()> {
        file.seek(0, OffsetMode::Logical)?;
        file.write(&self.to_bytes())
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            signature: *SIGNATURE,
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
            phys_length: 0,
            phys_xml_offset: 0,
            xml_length: 0,
            page_size: PHYSICAL_PAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_header_layout() {
        let header = Header {
            phys_length: 4096,
            phys_xml_offset: 2048,
            xml_length: 777,
            ..Default::default()
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..8], b"ASTM-E57");
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(&bytes[40..48], &1024_u64.to_le_bytes());
        assert_eq!(Header::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn invalid_signature() {
        let mut bytes = Header::default().to_bytes();
        bytes[0] = b'X';
        let err = Header::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::BadFileSignature { .. }));
    }

    #[test]
    fn unknown_version() {
        let mut bytes = Header::default().to_bytes();
        bytes[8] = 2;
        let err = Header::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnknownFileVersion { .. }));
    }

    #[test]
    fn unsupported_page_size() {
        let mut bytes = Header::default().to_bytes();
        bytes[41] = 8;
        let err = Header::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::BadFileLength { .. }));
    }
}
