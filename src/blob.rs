use crate::checked_file::{logical_to_physical, physical_to_logical, CheckedFile, OffsetMode};
use crate::error::Converter;
use crate::node::{Node, NodeId};
use crate::{Error, ImageFile, Result};
use log::debug;
use std::io::{Read, Seek, Write};

const SECTION_ID: u8 = 0;

/// Header at the start of each blob binary section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobSectionHeader {
    /// Logical length of the whole section, including this header.
    pub section_length: u64,
}

impl BlobSectionHeader {
    pub const SIZE: u64 = 16;

    pub fn from_bytes(buffer: &[u8; Self::SIZE as usize]) -> Result<Self> {
        if buffer[0] != SECTION_ID {
            Err(Error::BadCVHeader {
                reason: format!("Blob section ID is {} instead of {SECTION_ID}", buffer[0]),
            })?
        }
        let section_length = u64::from_le_bytes(
            buffer[8..16]
                .try_into()
                .internal_err("Bad blob section header offset")?,
        );
        if section_length < Self::SIZE {
            Err(Error::BadCVHeader {
                reason: format!("Blob section length {section_length} is smaller than its header"),
            })?
        }
        Ok(Self { section_length })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE as usize] {
        let mut buffer = [0_u8; Self::SIZE as usize];
        buffer[0] = SECTION_ID;
        buffer[8..16].copy_from_slice(&self.section_length.to_le_bytes());
        buffer
    }

    fn read<T: Read + Write + Seek>(file: &mut CheckedFile<T>, offset: u64) -> Result<Self> {
        let mut buffer = [0_u8; Self::SIZE as usize];
        file.seek(offset, OffsetMode::Physical)?;
        file.read(&mut buffer)?;
        Self::from_bytes(&buffer)
    }
}

impl<T: Read + Write + Seek> ImageFile<T> {
    /// Allocates a blob section and returns a detached blob node for it.
    pub fn new_blob(&self, length: u64) -> Result<NodeId> {
        self.guard(|| {
            self.check_writable()?;
            let start = self.allocate_space(BlobSectionHeader::SIZE + length, false)?;
            let header = BlobSectionHeader {
                section_length: BlobSectionHeader::SIZE + length,
            };
            let mut file = self.file()?;
            file.seek(start, OffsetMode::Logical)?;
            file.write(&header.to_bytes())?;
            drop(file);

            let section = logical_to_physical(start);
            debug!("Allocated blob section with {length} bytes at offset {section}");
            Ok(self.tree_mut()?.add(Node::Blob { length, section }))
        })
    }

    /// Writes bytes into a blob, starting at the given offset inside the blob.
    pub fn write_blob(&self, blob: NodeId, offset: u64, data: &[u8]) -> Result<()> {
        self.guard(|| {
            self.check_writable()?;
            let start = self.blob_range(blob, offset, data.len())?;
            let mut file = self.file()?;
            file.seek(start, OffsetMode::Logical)?;
            file.write(data)
        })
    }

    /// Reads bytes from a blob, starting at the given offset inside the blob.
    pub fn read_blob(&self, blob: NodeId, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.guard(|| {
            self.check_open()?;
            let start = self.blob_range(blob, offset, buffer.len())?;
            let mut file = self.file()?;
            file.seek(start, OffsetMode::Logical)?;
            file.read(buffer)
        })
    }

    /// Validates the range and returns the logical offset of its first byte.
    fn blob_range(&self, blob: NodeId, offset: u64, count: usize) -> Result<u64> {
        let (length, section) = match self.tree()?.get(blob)? {
            Node::Blob { length, section } => (*length, *section),
            other => Error::bad_api(format!("Expected blob node, found {}", other.type_name()))?,
        };
        let end = offset
            .checked_add(count as u64)
            .internal_err("Blob range overflows")?;
        if end > length {
            Error::bad_api(format!(
                "Range from {offset} to {end} is outside of blob with {length} bytes"
            ))?
        }
        let header = BlobSectionHeader::read(&mut *self.file()?, section)?;
        if header.section_length < BlobSectionHeader::SIZE + length {
            Err(Error::BadCVHeader {
                reason: format!(
                    "Blob section with {} bytes cannot hold {length} bytes",
                    header.section_length
                ),
            })?
        }
        Ok(physical_to_logical(section) + BlobSectionHeader::SIZE + offset)
    }
}
