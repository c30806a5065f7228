use crate::bitpack::{bind_buffers, FieldBinding};
use crate::bs_read::ByteStreamReadBuffer;
use crate::checked_file::{logical_to_physical, physical_to_logical};
use crate::cv_section::CompressedVectorSectionHeader;
use crate::node::{Node, NodeId};
use crate::packet::{Packet, MAX_INDEX_LEVEL};
use crate::{Error, ImageFile, Result, SourceDestBuffer};
use log::{debug, trace};
use std::io::{Read, Seek, Write};

/// Number of records skipped at once when seeking.
const SKIP_CHUNK: u64 = 1024;

/// Reads blocks of records from a compressed vector.
///
/// Fields without buffer are decoded but skipped.
pub struct CompressedVectorReader<'a, T: Read + Write + Seek> {
    image: &'a ImageFile<T>,
    prototype: NodeId,
    buffers: Vec<SourceDestBuffer>,
    fields: Vec<FieldBinding>,
    streams: Vec<ByteStreamReadBuffer>,
    header: CompressedVectorSectionHeader,
    section_end: u64,
    record_count: u64,
    next_record: u64,
    next_packet: u64,
    open: bool,
}

impl<'a, T: Read + Write + Seek> CompressedVectorReader<'a, T> {
    pub(crate) fn new(
        image: &'a ImageFile<T>,
        node: NodeId,
        buffers: Vec<SourceDestBuffer>,
    ) -> Result<Self> {
        image.guard(|| {
            image.check_open()?;
            let (prototype, record_count, section, fields) = {
                let tree = image.tree()?;
                let (prototype, codecs, record_count, section) = match tree.get(node)? {
                    Node::CompressedVector {
                        prototype,
                        codecs,
                        record_count,
                        section,
                    } => (*prototype, *codecs, *record_count, *section),
                    other => Error::bad_api(format!(
                        "Cannot read from node of type {}",
                        other.type_name()
                    ))?,
                };
                if !tree.get(codecs)?.children().is_empty() {
                    Err(Error::BadCodecs {
                        reason: String::from("Only the default bit-pack codec is supported"),
                    })?
                }
                let fields = bind_buffers(&tree, prototype, &buffers, false)?;
                (prototype, record_count, section, fields)
            };

            let (header, section_end) = match section {
                Some(offset) if record_count > 0 => {
                    let header = CompressedVectorSectionHeader::read(&mut *image.file()?, offset)?;
                    let end = physical_to_logical(offset)
                        .checked_add(header.section_length)
                        .ok_or_else(|| Error::BadCVHeader {
                            reason: format!(
                                "Section length {} at offset {offset} is too large",
                                header.section_length
                            ),
                        })?;
                    (header, end)
                }
                None if record_count > 0 => Err(Error::BadCVHeader {
                    reason: format!("Compressed vector with {record_count} records has no section"),
                })?,
                _ => (CompressedVectorSectionHeader::default(), 0),
            };

            image.begin_reader()?;
            debug!(
                "Opened reader for {record_count} records with {} fields",
                fields.len()
            );
            Ok(Self {
                image,
                prototype,
                buffers,
                streams: vec![ByteStreamReadBuffer::new(); fields.len()],
                fields,
                next_packet: physical_to_logical(header.data_offset),
                header,
                section_end,
                record_count,
                next_record: 0,
                open: true,
            })
        })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Total number of records in the compressed vector.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Number of the record that will be read next.
    pub fn position(&self) -> u64 {
        self.next_record
    }

    pub fn buffers(&self) -> &[SourceDestBuffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [SourceDestBuffer] {
        &mut self.buffers
    }

    /// Fills the buffers with the next records and returns their number.
    /// Returns less records than the buffer capacity only at the end of the data.
    pub fn read(&mut self) -> Result<usize> {
        self.check_state()?;
        let capacity = self.buffers.first().map(|b| b.capacity()).unwrap_or(0) as u64;
        let count = capacity.min(self.record_count - self.next_record) as usize;
        let result = self.decode(count);
        self.fail_on(result)?;
        self.next_record += count as u64;
        Ok(count)
    }

    /// Replaces the buffers and fills them with the next records.
    pub fn read_with(&mut self, buffers: Vec<SourceDestBuffer>) -> Result<usize> {
        self.check_state()?;
        let fields = bind_buffers(&*self.image.tree()?, self.prototype, &buffers, false)?;
        self.fields = fields;
        self.buffers = buffers;
        self.read()
    }

    /// Moves to the given record, seeking to the record count is allowed.
    pub fn seek(&mut self, record: u64) -> Result<()> {
        self.check_state()?;
        if record > self.record_count {
            Error::bad_api(format!(
                "Cannot seek to record {record}, there are only {} records",
                self.record_count
            ))?
        }
        let result = self.seek_to(record);
        self.fail_on(result)
    }

    /// Closing an already closed reader does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.image.end_reader();
        }
        Ok(())
    }

    fn check_state(&self) -> Result<()> {
        self.image.check_open()?;
        if !self.open {
            Err(Error::ReaderNotOpen {
                reason: String::from("Reader is closed"),
            })?
        }
        Ok(())
    }

    /// Closes the reader after errors, since its stream positions are undefined.
    fn fail_on<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            debug!("Compressed vector reader failed: {err}");
            self.image.poison_on(err);
            if self.open {
                self.open = false;
                self.image.end_reader();
            }
        }
        result
    }

    fn decode(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        for i in 0..self.fields.len() {
            let bits = self.fields[i].codec.bits() as u64;
            self.ensure(i, bits * count as u64)?;
            let field = &self.fields[i];
            let stream = &mut self.streams[i];
            match field.buffer {
                Some(index) => {
                    let buffer = &mut self.buffers[index];
                    for record in 0..count {
                        field.codec.decode(stream, buffer, record)?;
                    }
                }
                None => {
                    if !stream.skip(bits * count as u64) {
                        Error::internal("Failed to skip unused field")?
                    }
                }
            }
        }
        Ok(())
    }

    fn seek_to(&mut self, record: u64) -> Result<()> {
        for stream in &mut self.streams {
            stream.clear();
        }
        if record == self.record_count {
            self.next_record = record;
            return Ok(());
        }
        let (packet_offset, first_record) = if self.header.index_offset != 0 {
            self.find_packet(record)?
        } else {
            (self.header.data_offset, 0)
        };
        trace!(
            "Seeking to record {record} from packet at {packet_offset} starting with record {first_record}"
        );
        self.next_packet = physical_to_logical(packet_offset);
        self.skip_records(record - first_record)?;
        self.next_record = record;
        Ok(())
    }

    /// Descends the index tree to the data packet that contains the record.
    fn find_packet(&self, record: u64) -> Result<(u64, u64)> {
        let mut offset = self.header.index_offset;
        let mut first_record = 0;
        for _ in 0..=MAX_INDEX_LEVEL + 1 {
            let packet = self.image.lock_packet(offset)?;
            match &*packet {
                Packet::Data(_) => return Ok((offset, first_record)),
                Packet::Index(index) => {
                    let entry = match index.find(record) {
                        Some(entry) => entry,
                        None => Error::bad_packet(format!(
                            "Index packet at {offset} has no entry for record {record}"
                        ))?,
                    };
                    first_record = entry.record_number;
                    offset = entry.physical_offset;
                }
                Packet::Empty(_) => {
                    Error::bad_packet(format!("Index entry points to empty packet at {offset}"))?
                }
            }
        }
        Error::bad_packet("Index tree is deeper than allowed")
    }

    fn skip_records(&mut self, count: u64) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(SKIP_CHUNK);
            for i in 0..self.fields.len() {
                let bits = self.fields[i].codec.bits() as u64 * chunk;
                self.ensure(i, bits)?;
                if !self.streams[i].skip(bits) {
                    Error::internal("Failed to skip records")?
                }
            }
            remaining -= chunk;
        }
        Ok(())
    }

    /// Loads packets until the stream holds the requested number of bits.
    fn ensure(&mut self, stream: usize, bits: u64) -> Result<()> {
        while self.streams[stream].available() < bits {
            self.load_next_packet()?;
        }
        Ok(())
    }

    fn load_next_packet(&mut self) -> Result<()> {
        loop {
            if self.next_packet >= self.section_end {
                Error::bad_packet("Reached end of section before all records were read")?
            }
            let offset = logical_to_physical(self.next_packet);
            let packet = self.image.lock_packet(offset)?;
            self.next_packet += packet.len() as u64;
            if let Packet::Data(data) = &*packet {
                if data.bytestream_count() != self.streams.len() {
                    Error::bad_packet(format!(
                        "Data packet at {offset} has {} bytestreams instead of {}",
                        data.bytestream_count(),
                        self.streams.len()
                    ))?
                }
                for (i, stream) in self.streams.iter_mut().enumerate() {
                    stream.append(data.bytestream(i)?);
                }
                trace!("Loaded data packet at offset {offset}");
                return Ok(());
            }
        }
    }
}

impl<T: Read + Write + Seek> Drop for CompressedVectorReader<'_, T> {
    fn drop(&mut self) {
        if self.open {
            self.image.end_reader();
        }
    }
}
