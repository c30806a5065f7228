use crate::checked_file::{CheckedFile, OffsetMode};
use crate::error::Converter;
use crate::{Error, Result};
use std::io::{Read, Seek, Write};

const SECTION_ID: u8 = 1;

/// Header at the start of each compressed vector binary section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedVectorSectionHeader {
    /// Logical length of the whole section, including this header.
    pub section_length: u64,
    /// Physical offset of the first data packet.
    pub data_offset: u64,
    /// Physical offset of the top index packet, zero if there is no index.
    pub index_offset: u64,
}

impl CompressedVectorSectionHeader {
    pub const SIZE: u64 = 32;

    pub fn from_bytes(buffer: &[u8; Self::SIZE as usize]) -> Result<Self> {
        let u64_at = |offset: usize| -> Result<u64> {
            let bytes = buffer[offset..offset + 8]
                .try_into()
                .internal_err("Bad section header offset")?;
            Ok(u64::from_le_bytes(bytes))
        };

        if buffer[0] != SECTION_ID {
            Err(Error::BadCVHeader {
                reason: format!("Section ID is {} instead of {SECTION_ID}", buffer[0]),
            })?
        }
        if buffer[1..8].iter().any(|b| *b != 0) {
            Err(Error::BadCVHeader {
                reason: String::from("Reserved bytes are not zero"),
            })?
        }
        let header = Self {
            section_length: u64_at(8)?,
            data_offset: u64_at(16)?,
            index_offset: u64_at(24)?,
        };
        if header.section_length % 4 != 0 {
            Err(Error::BadCVHeader {
                reason: format!(
                    "Section length {} is not a multiple of four",
                    header.section_length
                ),
            })?
        }
        if header.section_length < Self::SIZE {
            Err(Error::BadCVHeader {
                reason: format!(
                    "Section length {} is smaller than the header",
                    header.section_length
                ),
            })?
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE as usize] {
        let mut buffer = [0_u8; Self::SIZE as usize];
        buffer[0] = SECTION_ID;
        buffer[8..16].copy_from_slice(&self.section_length.to_le_bytes());
        buffer[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        buffer[24..32].copy_from_slice(&self.index_offset.to_le_bytes());
        buffer
    }

    /// Reads the section header at the given physical offset.
    pub fn read<T: Read + Write + Seek>(file: &mut CheckedFile<T>, offset: u64) -> Result<Self> {
        let mut buffer = [0_u8; Self::SIZE as usize];
        file.seek(offset, OffsetMode::Physical)?;
        file.read(&mut buffer)?;
        Self::from_bytes(&buffer)
    }

    /// Writes the section header at the given physical offset.
    pub fn write<T: Read + Write + Seek>(
        &self,
        file: &mut CheckedFile<T>,
        offset: u64,
    ) -> Result<()> {
        file.seek(offset, OffsetMode::Physical)?;
        file.write(&self.to_bytes())
    }
}

impl Default for CompressedVectorSectionHeader {
    fn default() -> Self {
        Self {
            section_length: Self::SIZE,
            data_offset: 0,
            index_offset: 0,
        }
    }
}
