use crate::packet::{IndexEntry, IndexPacket, MAX_INDEX_ENTRIES, MAX_INDEX_LEVEL};
use crate::{Error, Result};
use log::debug;

/// Collects index entries of emitted data packets and builds the index packet tree.
///
/// Full levels are written immediately, partial levels when finishing.
/// The sink writes an index packet and returns its physical offset.
#[derive(Debug, Default)]
pub(crate) struct IndexBuilder {
    levels: Vec<Vec<IndexEntry>>,
    written: Vec<bool>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a data packet that starts with the given record.
    pub fn add<F>(&mut self, entry: IndexEntry, sink: &mut F) -> Result<()>
    where
        F: FnMut(&IndexPacket) -> Result<u64>,
    {
        self.push(0, entry, sink)
    }

    /// Writes all remaining entries and returns the offset of the top index packet.
    /// Returns none if no data packet was registered.
    pub fn finish<F>(mut self, sink: &mut F) -> Result<Option<u64>>
    where
        F: FnMut(&IndexPacket) -> Result<u64>,
    {
        let mut level = 0;
        while level < self.levels.len() {
            let entries = std::mem::take(&mut self.levels[level]);
            let Some(first) = entries.first().copied() else {
                level += 1;
                continue;
            };

            let highest = self.levels[level + 1..].iter().all(|l| l.is_empty());
            if highest && !self.written[level] {
                let top = if level > 0 && entries.len() == 1 {
                    first.physical_offset
                } else {
                    self.emit(level, entries, sink)?
                };
                debug!("Finished index with top level {level} at offset {top}");
                return Ok(Some(top));
            }

            // Upper levels need at least two entries, single ones move up unchanged
            if level > 0 && entries.len() == 1 {
                self.push(level + 1, first, sink)?;
            } else {
                let physical_offset = self.emit(level, entries, sink)?;
                let entry = IndexEntry {
                    record_number: first.record_number,
                    physical_offset,
                };
                self.push(level + 1, entry, sink)?;
            }
            level += 1;
        }
        Ok(None)
    }

    fn push<F>(&mut self, level: usize, entry: IndexEntry, sink: &mut F) -> Result<()>
    where
        F: FnMut(&IndexPacket) -> Result<u64>,
    {
        if level > MAX_INDEX_LEVEL as usize {
            Error::internal(format!("Index would exceed maximum level {MAX_INDEX_LEVEL}"))?
        }
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
            self.written.resize(level + 1, false);
        }
        self.levels[level].push(entry);
        if self.levels[level].len() == MAX_INDEX_ENTRIES {
            let entries = std::mem::take(&mut self.levels[level]);
            let record_number = entries[0].record_number;
            let physical_offset = self.emit(level, entries, sink)?;
            let entry = IndexEntry {
                record_number,
                physical_offset,
            };
            self.push(level + 1, entry, sink)?;
        }
        Ok(())
    }

    fn emit<F>(&mut self, level: usize, entries: Vec<IndexEntry>, sink: &mut F) -> Result<u64>
    where
        F: FnMut(&IndexPacket) -> Result<u64>,
    {
        let packet = IndexPacket::new(level as u8, entries)?;
        let offset = sink(&packet)?;
        self.written[level] = true;
        Ok(offset)
    }
}
