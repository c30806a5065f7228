use crate::checked_file::{CheckedFile, OffsetMode};
use crate::{Error, Result};
use std::io::{Read, Seek, Write};

/// Maximum size of any packet in bytes.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;
/// Maximum number of entries in a single index packet.
pub const MAX_INDEX_ENTRIES: usize = 2048;
/// Maximum depth of the index packet tree.
pub const MAX_INDEX_LEVEL: u8 = 5;

const INDEX_PACKET: u8 = 0;
const DATA_PACKET: u8 = 1;
const EMPTY_PACKET: u8 = 2;

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buffer = [0_u8; 8];
    buffer.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buffer)
}

fn aligned(length: usize) -> usize {
    (length + 3) & !3
}

/// Checks the framing rules shared by all packet kinds.
fn verify_framing(
    bytes: &[u8],
    expected_type: u8,
    header_size: usize,
    buffer_len: usize,
) -> Result<usize> {
    if bytes.len() < header_size {
        Error::bad_packet(format!(
            "Packet with {} bytes is smaller than its header with {header_size} bytes",
            bytes.len()
        ))?
    }
    if bytes[0] != expected_type {
        Error::bad_packet(format!(
            "Found packet type {} instead of {expected_type}",
            bytes[0]
        ))?
    }
    let packet_length = read_u16(bytes, 2) as usize + 1;
    if packet_length < header_size {
        Error::bad_packet(format!("Packet length {packet_length} is smaller than header"))?
    }
    if packet_length % 4 != 0 {
        Error::bad_packet(format!("Packet length {packet_length} is not a multiple of four"))?
    }
    if buffer_len > 0 && packet_length > buffer_len {
        Error::bad_packet(format!(
            "Packet length {packet_length} exceeds buffer length {buffer_len}"
        ))?
    }
    if packet_length > bytes.len() {
        Error::bad_packet(format!(
            "Packet length {packet_length} exceeds available {} bytes",
            bytes.len()
        ))?
    }
    Ok(packet_length)
}

fn verify_zero_padding(bytes: &[u8], from: usize, to: usize) -> Result<()> {
    if let Some(pos) = bytes[from..to].iter().position(|b| *b != 0) {
        Error::bad_packet(format!("Padding byte at {} is not zero", from + pos))?
    }
    Ok(())
}

/// Decoded fixed part of a data packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataPacketHeader {
    pub compressor_restart: bool,
    pub packet_length: usize,
    pub bytestream_count: u16,
}

impl DataPacketHeader {
    pub const SIZE: usize = 6;

    pub fn from_bytes(bytes: &[u8], buffer_len: usize) -> Result<Self> {
        let packet_length = verify_framing(bytes, DATA_PACKET, Self::SIZE, buffer_len)?;
        let bytestream_count = read_u16(bytes, 4);
        if bytestream_count == 0 {
            Error::bad_packet("A bytestream count of 0 is not allowed")?
        }
        if Self::SIZE + 2 * bytestream_count as usize > packet_length {
            Error::bad_packet(format!(
                "Packet length {packet_length} cannot hold {bytestream_count} bytestream lengths"
            ))?
        }
        Ok(Self {
            compressor_restart: bytes[1] & 1 != 0,
            packet_length,
            bytestream_count,
        })
    }
}

/// Packet carrying one bit-packed bytestream per prototype field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    buffer: Vec<u8>,
}

impl DataPacket {
    /// Assembles a packet from bytestreams, including length table and padding.
    pub fn new(compressor_restart: bool, streams: &[&[u8]]) -> Result<Self> {
        if streams.is_empty() || streams.len() > u16::MAX as usize {
            Error::internal(format!("Invalid bytestream count {}", streams.len()))?
        }
        let payload: usize = streams.iter().map(|s| s.len()).sum();
        let needed = DataPacketHeader::SIZE + 2 * streams.len() + payload;
        let packet_length = aligned(needed);
        if packet_length > MAX_PACKET_SIZE {
            Error::internal(format!("Data packet length {packet_length} exceeds the maximum"))?
        }

        let mut buffer = Vec::with_capacity(packet_length);
        buffer.push(DATA_PACKET);
        buffer.push(if compressor_restart { 1 } else { 0 });
        buffer.extend_from_slice(&((packet_length - 1) as u16).to_le_bytes());
        buffer.extend_from_slice(&(streams.len() as u16).to_le_bytes());
        for stream in streams {
            if stream.len() > u16::MAX as usize {
                Error::internal(format!("Bytestream length {} exceeds 16 bits", stream.len()))?
            }
            buffer.extend_from_slice(&(stream.len() as u16).to_le_bytes());
        }
        for stream in streams {
            buffer.extend_from_slice(stream);
        }
        buffer.resize(packet_length, 0);
        Ok(Self { buffer })
    }

    /// Parses and verifies a packet from raw bytes.
    pub fn from_bytes(mut buffer: Vec<u8>) -> Result<Self> {
        let header = DataPacketHeader::from_bytes(&buffer, buffer.len())?;
        buffer.truncate(header.packet_length);
        let packet = Self { buffer };
        packet.verify(0)?;
        Ok(packet)
    }

    pub fn header(&self) -> Result<DataPacketHeader> {
        DataPacketHeader::from_bytes(&self.buffer, 0)
    }

    /// Checks framing, the length table against the packet length and the padding.
    pub fn verify(&self, buffer_len: usize) -> Result<()> {
        let header = DataPacketHeader::from_bytes(&self.buffer, buffer_len)?;
        let count = header.bytestream_count as usize;
        let payload: usize = (0..count)
            .map(|i| read_u16(&self.buffer, DataPacketHeader::SIZE + 2 * i) as usize)
            .sum();
        let needed = DataPacketHeader::SIZE + 2 * count + payload;
        if needed > header.packet_length || needed + 3 < header.packet_length {
            Error::bad_packet(format!(
                "Bytestreams need {needed} bytes, but packet length is {}",
                header.packet_length
            ))?
        }
        verify_zero_padding(&self.buffer, needed, header.packet_length)
    }

    pub fn compressor_restart(&self) -> bool {
        self.buffer[1] & 1 != 0
    }

    pub fn bytestream_count(&self) -> usize {
        read_u16(&self.buffer, 4) as usize
    }

    /// Returns the payload of the bytestream with the given index.
    pub fn bytestream(&self, index: usize) -> Result<&[u8]> {
        let count = self.bytestream_count();
        if index >= count {
            Error::internal(format!(
                "Bytestream {index} requested, but packet has only {count}"
            ))?
        }
        let table = DataPacketHeader::SIZE;
        let start = table
            + 2 * count
            + (0..index)
                .map(|i| read_u16(&self.buffer, table + 2 * i) as usize)
                .sum::<usize>();
        let end = start + read_u16(&self.buffer, table + 2 * index) as usize;
        if end > self.buffer.len() {
            Error::internal(format!(
                "Bytestream {index} ends at {end} behind packet end at {}",
                self.buffer.len()
            ))?
        }
        Ok(&self.buffer[start..end])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Points at a data packet (level 0) or a lower level index packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Number of the first record in the referenced packet subtree.
    pub record_number: u64,
    /// Physical offset of the referenced packet.
    pub physical_offset: u64,
}

/// Packet holding sorted index entries for random access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexPacket {
    pub level: u8,
    pub entries: Vec<IndexEntry>,
}

impl IndexPacket {
    pub const HEADER_SIZE: usize = 16;
    const ENTRY_SIZE: usize = 16;

    pub fn new(level: u8, entries: Vec<IndexEntry>) -> Result<Self> {
        let packet = Self { level, entries };
        packet.verify(0, 0, 0)?;
        Ok(packet)
    }

    pub fn len(&self) -> usize {
        Self::HEADER_SIZE + Self::ENTRY_SIZE * self.entries.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let length = self.len();
        let mut buffer = Vec::with_capacity(length);
        buffer.push(INDEX_PACKET);
        buffer.push(0);
        buffer.extend_from_slice(&((length - 1) as u16).to_le_bytes());
        buffer.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        buffer.push(self.level);
        buffer.resize(Self::HEADER_SIZE, 0);
        for entry in &self.entries {
            buffer.extend_from_slice(&entry.record_number.to_le_bytes());
            buffer.extend_from_slice(&entry.physical_offset.to_le_bytes());
        }
        buffer
    }

    /// Parses and verifies a packet from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        verify_index(bytes, bytes.len(), 0, 0)?;
        let entry_count = read_u16(bytes, 4) as usize;
        let entries = (0..entry_count)
            .map(|i| {
                let offset = Self::HEADER_SIZE + Self::ENTRY_SIZE * i;
                IndexEntry {
                    record_number: read_u64(bytes, offset),
                    physical_offset: read_u64(bytes, offset + 8),
                }
            })
            .collect();
        Ok(Self {
            level: bytes[6],
            entries,
        })
    }

    /// Checks all structural rules, the entry order and optional upper limits.
    /// Limits with a value of zero are not checked.
    pub fn verify(&self, buffer_len: usize, total_record_count: u64, file_size: u64) -> Result<()> {
        if self.entries.is_empty() || self.entries.len() > MAX_INDEX_ENTRIES {
            Error::bad_packet(format!("Invalid index entry count {}", self.entries.len()))?
        }
        verify_index(&self.to_bytes(), buffer_len, total_record_count, file_size)
    }

    /// Finds the last entry whose record number is not larger than the given record.
    pub fn find(&self, record: u64) -> Option<&IndexEntry> {
        let pos = self.entries.partition_point(|e| e.record_number <= record);
        pos.checked_sub(1).map(|i| &self.entries[i])
    }
}

fn verify_index(
    bytes: &[u8],
    buffer_len: usize,
    total_record_count: u64,
    file_size: u64,
) -> Result<()> {
    let packet_length = verify_framing(bytes, INDEX_PACKET, IndexPacket::HEADER_SIZE, buffer_len)?;
    let entry_count = read_u16(bytes, 4) as usize;
    let level = bytes[6];
    if entry_count == 0 || entry_count > MAX_INDEX_ENTRIES {
        Error::bad_packet(format!("Invalid index entry count {entry_count}"))?
    }
    if level > MAX_INDEX_LEVEL {
        Error::bad_packet(format!("Invalid index level {level}"))?
    }
    if level > 0 && entry_count < 2 {
        Error::bad_packet(format!(
            "Index packet of level {level} needs at least two entries"
        ))?
    }
    if bytes[7..IndexPacket::HEADER_SIZE].iter().any(|b| *b != 0) {
        Error::bad_packet("Reserved bytes of index packet are not zero")?
    }
    let needed = IndexPacket::HEADER_SIZE + IndexPacket::ENTRY_SIZE * entry_count;
    if packet_length < needed {
        Error::bad_packet(format!(
            "Index packet length {packet_length} cannot hold {entry_count} entries"
        ))?
    }
    verify_zero_padding(bytes, needed, packet_length)?;

    let mut previous: Option<(u64, u64)> = None;
    for i in 0..entry_count {
        let offset = IndexPacket::HEADER_SIZE + IndexPacket::ENTRY_SIZE * i;
        let record = read_u64(bytes, offset);
        let physical = read_u64(bytes, offset + 8);
        if total_record_count > 0 && record >= total_record_count {
            Error::bad_packet(format!(
                "Entry {i} references record {record} of only {total_record_count}"
            ))?
        }
        if file_size > 0 && physical >= file_size {
            Error::bad_packet(format!(
                "Entry {i} references offset {physical} behind file size {file_size}"
            ))?
        }
        if let Some((prev_record, prev_physical)) = previous {
            if prev_record >= record || prev_physical >= physical {
                Error::bad_packet(format!("Entry {i} is not strictly increasing"))?
            }
        }
        previous = Some((record, physical));
    }
    Ok(())
}

/// Filler packet without payload semantics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmptyPacket {
    length: usize,
}

impl EmptyPacket {
    pub const HEADER_SIZE: usize = 4;

    pub fn new(length: usize) -> Result<Self> {
        if length < Self::HEADER_SIZE || length % 4 != 0 || length > MAX_PACKET_SIZE {
            Error::internal(format!("Invalid empty packet length {length}"))?
        }
        Ok(Self { length })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let length = verify_framing(bytes, EMPTY_PACKET, Self::HEADER_SIZE, bytes.len())?;
        Ok(Self { length })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0_u8; self.length];
        buffer[0] = EMPTY_PACKET;
        buffer[2..4].copy_from_slice(&((self.length - 1) as u16).to_le_bytes());
        buffer
    }

    pub fn len(&self) -> usize {
        self.length
    }
}

/// Any packet found inside a compressed vector binary section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Index(IndexPacket),
    Empty(EmptyPacket),
}

impl Packet {
    /// Parses and verifies a packet of any kind.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        match bytes.first() {
            Some(&DATA_PACKET) => Ok(Packet::Data(DataPacket::from_bytes(bytes)?)),
            Some(&INDEX_PACKET) => Ok(Packet::Index(IndexPacket::from_bytes(&bytes)?)),
            Some(&EMPTY_PACKET) => Ok(Packet::Empty(EmptyPacket::from_bytes(&bytes)?)),
            Some(other) => Error::bad_packet(format!("Found unknown packet type {other}")),
            None => Error::bad_packet("Cannot parse packet from empty buffer"),
        }
    }

    /// Reads and verifies the packet starting at the given physical offset.
    pub fn read<T: Read + Write + Seek>(
        file: &mut CheckedFile<T>,
        physical_offset: u64,
    ) -> Result<Self> {
        file.seek(physical_offset, OffsetMode::Physical)?;
        let mut prefix = [0_u8; 4];
        file.read(&mut prefix)?;
        let length = read_u16(&prefix, 2) as usize + 1;
        if length < prefix.len() {
            Error::bad_packet(format!("Packet length {length} is too small"))?
        }
        let mut bytes = vec![0_u8; length];
        bytes[..4].copy_from_slice(&prefix);
        file.read(&mut bytes[4..])?;
        Self::from_bytes(bytes)
    }

    pub fn len(&self) -> usize {
        match self {
            Packet::Data(p) => p.len(),
            Packet::Index(p) => p.len(),
            Packet::Empty(p) => p.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(u64, u64)]) -> Vec<IndexEntry> {
        pairs
            .iter()
            .map(|&(record_number, physical_offset)| IndexEntry {
                record_number,
                physical_offset,
            })
            .collect()
    }

    #[test]
    fn data_packet_layout() {
        let packet = DataPacket::new(true, &[&[1, 2, 3], &[4]]).unwrap();
        // 6 header + 2*2 lengths + 4 payload = 14, padded to 16
        assert_eq!(packet.len(), 16);
        let bytes = packet.as_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..4], &15_u16.to_le_bytes());
        assert_eq!(&bytes[4..6], &2_u16.to_le_bytes());
        assert_eq!(&bytes[6..10], &[3, 0, 1, 0]);
        assert_eq!(&bytes[10..14], &[1, 2, 3, 4]);
        assert_eq!(&bytes[14..], &[0, 0]);

        assert_eq!(packet.bytestream(0).unwrap(), &[1, 2, 3]);
        assert_eq!(packet.bytestream(1).unwrap(), &[4]);
        assert!(matches!(
            packet.bytestream(2).unwrap_err(),
            Error::Internal { .. }
        ));
        assert!(packet.compressor_restart());

        let parsed = DataPacket::from_bytes(bytes.to_vec()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn data_packet_size_limit() {
        let big = vec![0_u8; MAX_PACKET_SIZE - 8];
        assert_eq!(DataPacket::new(false, &[&big]).unwrap().len(), MAX_PACKET_SIZE);
        let too_big = vec![0_u8; MAX_PACKET_SIZE - 7];
        assert!(DataPacket::new(false, &[&too_big]).is_err());
    }

    #[test]
    fn data_packet_rejects_bad_padding() {
        let packet = DataPacket::new(false, &[&[9]]).unwrap();
        let mut bytes = packet.as_bytes().to_vec();
        bytes[11] = 1;
        let err = DataPacket::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, Error::BadCVPacket { .. }));
    }

    #[test]
    fn data_packet_rejects_bad_lengths() {
        let packet = DataPacket::new(false, &[&[9, 9, 9, 9, 9]]).unwrap();
        let mut bytes = packet.as_bytes().to_vec();
        // Claims more bytestream data than the packet holds
        bytes[6] = 40;
        assert!(DataPacket::from_bytes(bytes.clone()).is_err());
        // Claims so little data that the slack exceeds three bytes
        bytes[6] = 0;
        assert!(DataPacket::from_bytes(bytes.clone()).is_err());
        // Zero bytestreams
        let mut bytes = packet.as_bytes().to_vec();
        bytes[4] = 0;
        assert!(DataPacket::from_bytes(bytes).is_err());
    }

    #[test]
    fn data_packet_verify_buffer_length() {
        let packet = DataPacket::new(false, &[&[1; 10]]).unwrap();
        packet.verify(0).unwrap();
        packet.verify(packet.len()).unwrap();
        assert!(packet.verify(packet.len() - 4).is_err());
    }

    #[test]
    fn index_packet_layout() {
        let packet = IndexPacket::new(0, entries(&[(0, 100), (500, 2000)])).unwrap();
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[2..4], &47_u16.to_le_bytes());
        assert_eq!(&bytes[4..6], &2_u16.to_le_bytes());
        assert_eq!(bytes[6], 0);
        assert!(bytes[7..16].iter().all(|b| *b == 0));
        assert_eq!(&bytes[32..40], &500_u64.to_le_bytes());
        assert_eq!(IndexPacket::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn index_packet_rules() {
        assert!(IndexPacket::new(0, Vec::new()).is_err());
        assert!(IndexPacket::new(1, entries(&[(0, 100)])).is_err());
        assert!(IndexPacket::new(6, entries(&[(0, 100), (5, 200)])).is_err());
        assert!(IndexPacket::new(0, entries(&[(5, 100), (5, 200)])).is_err());
        assert!(IndexPacket::new(0, entries(&[(5, 100), (6, 100)])).is_err());

        let many: Vec<(u64, u64)> = (0..=MAX_INDEX_ENTRIES as u64).map(|i| (i, i * 4)).collect();
        assert!(IndexPacket::new(0, entries(&many)).is_err());
        let max = &many[..MAX_INDEX_ENTRIES];
        let packet = IndexPacket::new(0, entries(max)).unwrap();
        assert_eq!(packet.len(), 16 + 16 * MAX_INDEX_ENTRIES);
    }

    #[test]
    fn index_packet_limits() {
        let packet = IndexPacket::new(1, entries(&[(0, 100), (500, 2000)])).unwrap();
        packet.verify(0, 501, 2001).unwrap();
        assert!(packet.verify(0, 500, 0).is_err());
        assert!(packet.verify(0, 0, 2000).is_err());
        assert!(packet.verify(40, 0, 0).is_err());
    }

    #[test]
    fn index_packet_reserved_bytes() {
        let packet = IndexPacket::new(0, entries(&[(0, 100)])).unwrap();
        let mut bytes = packet.to_bytes();
        bytes[10] = 1;
        assert!(matches!(
            IndexPacket::from_bytes(&bytes).unwrap_err(),
            Error::BadCVPacket { .. }
        ));
    }

    #[test]
    fn index_find() {
        let packet = IndexPacket::new(0, entries(&[(10, 100), (20, 200), (30, 300)])).unwrap();
        assert_eq!(packet.find(5), None);
        assert_eq!(packet.find(10).unwrap().physical_offset, 100);
        assert_eq!(packet.find(29).unwrap().physical_offset, 200);
        assert_eq!(packet.find(1000).unwrap().physical_offset, 300);
    }

    #[test]
    fn empty_packet() {
        let packet = EmptyPacket::new(12).unwrap();
        let bytes = packet.to_bytes();
        assert_eq!(bytes, vec![2, 0, 11, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(EmptyPacket::from_bytes(&bytes).unwrap(), packet);
        assert!(EmptyPacket::new(6).is_err());
    }

    #[test]
    fn generic_parse() {
        let data = DataPacket::new(false, &[&[1]]).unwrap();
        let index = IndexPacket::new(0, entries(&[(0, 0)])).unwrap();
        let empty = EmptyPacket::new(8).unwrap();
        assert!(matches!(
            Packet::from_bytes(data.as_bytes().to_vec()).unwrap(),
            Packet::Data(_)
        ));
        assert!(matches!(
            Packet::from_bytes(index.to_bytes()).unwrap(),
            Packet::Index(_)
        ));
        assert!(matches!(
            Packet::from_bytes(empty.to_bytes()).unwrap(),
            Packet::Empty(_)
        ));
        let err = Packet::from_bytes(vec![7, 0, 3, 0]).unwrap_err();
        assert!(matches!(err, Error::BadCVPacket { .. }));
    }
}
