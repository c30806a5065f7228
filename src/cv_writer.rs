use crate::bitpack::{bind_buffers, FieldBinding};
use crate::bs_write::ByteStreamWriteBuffer;
use crate::checked_file::{logical_to_physical, OffsetMode};
use crate::cv_index::IndexBuilder;
use crate::cv_section::CompressedVectorSectionHeader;
use crate::error::Converter;
use crate::node::{Node, NodeId};
use crate::packet::{DataPacket, DataPacketHeader, IndexEntry, IndexPacket, MAX_PACKET_SIZE};
use crate::{Error, ImageFile, Result, SourceDestBuffer};
use log::{debug, trace, warn};
use std::io::{Read, Seek, Write};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Failed,
}

/// Appends blocks of records to a compressed vector.
///
/// Records become visible in the metadata only after a successful
/// [`CompressedVectorWriter::close`].
/// A writer that fails or is dropped while open leaves the compressed vector empty.
pub struct CompressedVectorWriter<'a, T: Read + Write + Seek> {
    image: &'a ImageFile<T>,
    node: NodeId,
    prototype: NodeId,
    buffers: Vec<SourceDestBuffer>,
    fields: Vec<FieldBinding>,
    streams: Vec<ByteStreamWriteBuffer>,
    index: IndexBuilder,
    section_start: u64,
    data_offset: Option<u64>,
    records_per_packet: usize,
    pending: usize,
    record_count: u64,
    state: WriterState,
}

impl<'a, T: Read + Write + Seek> CompressedVectorWriter<'a, T> {
    pub(crate) fn new(
        image: &'a ImageFile<T>,
        node: NodeId,
        buffers: Vec<SourceDestBuffer>,
    ) -> Result<Self> {
        image.guard(|| {
            image.check_writable()?;
            let (prototype, fields) = {
                let tree = image.tree()?;
                let (prototype, codecs, section) = match tree.get(node)? {
                    Node::CompressedVector {
                        prototype,
                        codecs,
                        section,
                        ..
                    } => (*prototype, *codecs, *section),
                    other => Error::bad_api(format!(
                        "Cannot write into node of type {}",
                        other.type_name()
                    ))?,
                };
                if !tree.is_attached(node)? {
                    Error::bad_api("Compressed vector must be attached to the root before writing")?
                }
                if section.is_some() {
                    Err(Error::SetTwice {
                        reason: String::from("Compressed vector was already written"),
                    })?
                }
                if !tree.get(codecs)?.children().is_empty() {
                    Err(Error::BadCodecs {
                        reason: String::from("Only the default bit-pack codec is supported"),
                    })?
                }
                (prototype, bind_buffers(&tree, prototype, &buffers, true)?)
            };
            let total_bits = fields.iter().map(|f| f.codec.bits() as u64).sum();
            let records_per_packet = records_per_packet(fields.len(), total_bits)?;

            image.begin_writer()?;
            let section_start = match open_section(image, node) {
                Ok(start) => start,
                Err(err) => {
                    image.end_writer();
                    return Err(err);
                }
            };
            debug!(
                "Opened writer for {} fields with {records_per_packet} records per packet",
                fields.len()
            );
            Ok(Self {
                image,
                node,
                prototype,
                buffers,
                streams: vec![ByteStreamWriteBuffer::new(); fields.len()],
                fields,
                index: IndexBuilder::new(),
                section_start,
                data_offset: None,
                records_per_packet,
                pending: 0,
                record_count: 0,
                state: WriterState::Open,
            })
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == WriterState::Open
    }

    /// Number of records written so far, including records not yet flushed into a packet.
    pub fn record_count(&self) -> u64 {
        self.record_count + self.pending as u64
    }

    pub fn buffers(&self) -> &[SourceDestBuffer] {
        &self.buffers
    }

    /// Gives access to the buffers to refill them between calls of
    /// [`CompressedVectorWriter::write`].
    pub fn buffers_mut(&mut self) -> &mut [SourceDestBuffer] {
        &mut self.buffers
    }

    /// Writes the first records of the current buffers.
    pub fn write(&mut self, record_count: usize) -> Result<()> {
        self.check_state()?;
        let capacity = self.buffers.first().map(|b| b.capacity()).unwrap_or(0);
        if record_count > capacity {
            Error::bad_api(format!(
                "Cannot write {record_count} records from buffers with capacity {capacity}"
            ))?
        }
        let result = self.encode(record_count);
        self.fail_on(result)
    }

    /// Replaces the buffers and writes their first records.
    pub fn write_with(
        &mut self,
        buffers: Vec<SourceDestBuffer>,
        record_count: usize,
    ) -> Result<()> {
        self.check_state()?;
        let fields = bind_buffers(&*self.image.tree()?, self.prototype, &buffers, true)?;
        self.fields = fields;
        self.buffers = buffers;
        self.write(record_count)
    }

    /// Flushes all pending records, completes the index and publishes the record count.
    /// Closing an already closed writer does nothing.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WriterState::Closed => return Ok(()),
            WriterState::Failed => {
                self.state = WriterState::Closed;
                self.image.end_writer();
                Err(Error::WriterNotOpen {
                    reason: String::from("Writer failed earlier, no records were committed"),
                })?
            }
            WriterState::Open => {}
        }
        let result = self.finish();
        self.state = WriterState::Closed;
        self.image.end_writer();
        if let Err(err) = &result {
            self.image.poison_on(err);
        }
        result
    }

    fn check_state(&self) -> Result<()> {
        self.image.check_open()?;
        if self.state != WriterState::Open {
            Err(Error::WriterNotOpen {
                reason: String::from("Writer is closed or failed earlier"),
            })?
        }
        Ok(())
    }

    fn fail_on<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            debug!("Compressed vector writer failed: {err}");
            self.state = WriterState::Failed;
            self.image.poison_on(err);
        }
        result
    }

    fn encode(&mut self, record_count: usize) -> Result<()> {
        let mut done = 0;
        while done < record_count {
            let chunk = (self.records_per_packet - self.pending).min(record_count - done);
            for (field, stream) in self.fields.iter().zip(self.streams.iter_mut()) {
                let index = field.buffer.internal_err("Writer field without buffer")?;
                let buffer = &self.buffers[index];
                for record in done..done + chunk {
                    field.codec.encode(buffer, record, stream)?;
                }
            }
            self.pending += chunk;
            done += chunk;
            if self.pending == self.records_per_packet {
                self.emit_packet()?;
            }
        }
        Ok(())
    }

    fn emit_packet(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let streams: Vec<Vec<u8>> = self.streams.iter_mut().map(|s| s.take_bytes()).collect();
        let slices: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
        let packet = DataPacket::new(true, &slices)?;

        let image = self.image;
        let offset = write_packet(image, packet.as_bytes())?;
        self.data_offset.get_or_insert(offset);
        trace!(
            "Wrote data packet with {} records and {} bytes at offset {offset}",
            self.pending,
            packet.len()
        );
        let entry = IndexEntry {
            record_number: self.record_count,
            physical_offset: offset,
        };
        self.record_count += self.pending as u64;
        self.pending = 0;
        self.index
            .add(entry, &mut |p: &IndexPacket| write_packet(image, &p.to_bytes()))
    }

    fn finish(&mut self) -> Result<()> {
        self.image.check_open()?;
        self.emit_packet()?;

        let image = self.image;
        let index = std::mem::take(&mut self.index);
        let index_offset = index
            .finish(&mut |p: &IndexPacket| write_packet(image, &p.to_bytes()))?
            .unwrap_or(0);

        let header = CompressedVectorSectionHeader {
            section_length: image.unused_logical_start() - self.section_start,
            data_offset: self.data_offset.unwrap_or(0),
            index_offset,
        };
        header.write(&mut *image.file()?, logical_to_physical(self.section_start))?;

        if let Node::CompressedVector { record_count, .. } = image.tree_mut()?.get_mut(self.node)? {
            *record_count = self.record_count;
        }
        debug!(
            "Closed writer with {} records in a section of {} bytes",
            self.record_count, header.section_length
        );
        Ok(())
    }
}

impl<T: Read + Write + Seek> Drop for CompressedVectorWriter<'_, T> {
    fn drop(&mut self) {
        match self.state {
            WriterState::Open => {
                warn!(
                    "Compressed vector writer dropped without closing, {} records are discarded",
                    self.record_count()
                );
                self.image.end_writer();
            }
            WriterState::Failed => self.image.end_writer(),
            WriterState::Closed => {}
        }
    }
}

/// Largest multiple of 8 records that fits into a data packet.
fn records_per_packet(field_count: usize, total_bits: u64) -> Result<usize> {
    let available = MAX_PACKET_SIZE
        .checked_sub(DataPacketHeader::SIZE + 2 * field_count)
        .unwrap_or(0) as u64;
    let records = if total_bits == 0 {
        0
    } else {
        (available * 8 / total_bits) / 8 * 8
    };
    if records < 8 {
        Err(Error::BadPrototype {
            reason: format!(
                "Records with {field_count} fields and {total_bits} bits do not fit into a packet"
            ),
        })?
    }
    Ok(records as usize)
}

/// Allocates the section header and assigns the section to the node.
fn open_section<T: Read + Write + Seek>(image: &ImageFile<T>, node: NodeId) -> Result<u64> {
    let start = image.allocate_space(CompressedVectorSectionHeader::SIZE, true)?;
    let offset = logical_to_physical(start);
    CompressedVectorSectionHeader::default().write(&mut *image.file()?, offset)?;
    if let Node::CompressedVector { section, .. } = image.tree_mut()?.get_mut(node)? {
        *section = Some(offset);
    }
    Ok(start)
}

/// Appends a packet at the end of the file and returns its physical offset.
fn write_packet<T: Read + Write + Seek>(image: &ImageFile<T>, bytes: &[u8]) -> Result<u64> {
    let start = image.allocate_space(bytes.len() as u64, true)?;
    let mut file = image.file()?;
    file.seek(start, OffsetMode::Logical)?;
    file.write(bytes)?;
    Ok(logical_to_physical(start))
}
