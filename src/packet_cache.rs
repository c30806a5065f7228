use crate::checked_file::CheckedFile;
use crate::error::Converter;
use crate::packet::Packet;
use crate::{Error, Result};
use log::trace;
use std::cell::{Cell, Ref, RefCell};
use std::io::{Read, Seek, Write};
use std::ops::Deref;

/// Default number of cached packets.
pub const DEFAULT_CACHE_SLOTS: usize = 8;

struct CacheEntry {
    offset: u64,
    last_used: u64,
    packet: Packet,
}

/// Small LRU cache of verified packets, keyed by physical offset.
///
/// Only one packet can be locked at a time.
pub(crate) struct PacketReadCache {
    slots: RefCell<Vec<Option<CacheEntry>>>,
    lock_count: Cell<usize>,
    use_count: Cell<u64>,
}

impl PacketReadCache {
    pub fn new(slots: usize) -> Self {
        let slots = (0..slots.max(1)).map(|_| None).collect();
        Self {
            slots: RefCell::new(slots),
            lock_count: Cell::new(0),
            use_count: Cell::new(0),
        }
    }

    /// Returns the packet at the physical offset, reading it on a cache miss.
    pub fn lock<T: Read + Write + Seek>(
        &self,
        file: &mut CheckedFile<T>,
        offset: u64,
    ) -> Result<PacketLock<'_>> {
        if self.lock_count.get() > 0 {
            Error::internal(format!(
                "Cannot lock packet at {offset}, another packet is still locked"
            ))?
        }
        let counter = self.use_count.get() + 1;
        self.use_count.set(counter);

        let index = {
            let mut slots = self
                .slots
                .try_borrow_mut()
                .internal_err("Packet cache is borrowed")?;
            let hit = slots
                .iter()
                .position(|s| matches!(s, Some(e) if e.offset == offset));
            match hit {
                Some(index) => {
                    trace!("Packet cache hit for offset {offset} in slot {index}");
                    if let Some(Some(entry)) = slots.get_mut(index) {
                        entry.last_used = counter;
                    }
                    index
                }
                None => {
                    let packet = Packet::read(file, offset)?;
                    let index = Self::victim(&slots);
                    if let Some(Some(old)) = slots.get(index) {
                        trace!("Evicting packet at offset {} from slot {index}", old.offset);
                    }
                    trace!("Packet cache miss for offset {offset}, loaded into slot {index}");
                    slots[index] = Some(CacheEntry {
                        offset,
                        last_used: counter,
                        packet,
                    });
                    index
                }
            }
        };

        let slots = self
            .slots
            .try_borrow()
            .internal_err("Packet cache is borrowed")?;
        let packet = Ref::filter_map(slots, |slots| match slots.get(index) {
            Some(Some(entry)) => Some(&entry.packet),
            _ => None,
        })
        .ok()
        .internal_err("Locked packet cache slot is empty")?;
        self.lock_count.set(self.lock_count.get() + 1);
        Ok(PacketLock {
            packet,
            lock_count: &self.lock_count,
        })
    }

    fn victim(slots: &[Option<CacheEntry>]) -> usize {
        if let Some(free) = slots.iter().position(|s| s.is_none()) {
            return free;
        }
        slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.as_ref().map(|e| e.last_used).unwrap_or(0))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn cached_offsets(&self) -> Vec<u64> {
        self.slots
            .borrow()
            .iter()
            .flatten()
            .map(|e| e.offset)
            .collect()
    }
}

/// Guard for a locked packet, unlocks when dropped.
pub(crate) struct PacketLock<'a> {
    packet: Ref<'a, Packet>,
    lock_count: &'a Cell<usize>,
}

impl Deref for PacketLock<'_> {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        &self.packet
    }
}

impl Drop for PacketLock<'_> {
    fn drop(&mut self) {
        self.lock_count.set(self.lock_count.get().saturating_sub(1));
    }
}
