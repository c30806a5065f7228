/// Consumes bit-packed values of one field, least significant bit first.
///
/// Bytestreams of consecutive data packets are appended to each other,
/// so values can be extracted across packet borders.
#[derive(Clone, Debug, Default)]
pub struct ByteStreamReadBuffer {
    buffer: Vec<u8>,
    offset: u64,
}

impl ByteStreamReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        let consumed = (self.offset / 8) as usize;
        if consumed > 0 {
            self.buffer.drain(..consumed);
            self.offset -= consumed as u64 * 8;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of bits that are not yet consumed.
    pub fn available(&self) -> u64 {
        self.buffer.len() as u64 * 8 - self.offset
    }

    /// Extracts the next value with the given bit width.
    pub fn extract(&mut self, bits: u32) -> Option<u64> {
        if self.available() < bits as u64 {
            return None;
        }
        let mut value = 0_u64;
        let mut done = 0;
        while done < bits {
            let byte = self.buffer[(self.offset / 8) as usize] as u64;
            let bit = (self.offset % 8) as u32;
            let take = (8 - bit).min(bits - done);
            let chunk = (byte >> bit) & ((1_u64 << take) - 1);
            value |= chunk << done;
            done += take;
            self.offset += take as u64;
        }
        Some(value)
    }

    /// Drops the given number of bits, returns false if not enough are available.
    pub fn skip(&mut self, bits: u64) -> bool {
        if self.available() < bits {
            return false;
        }
        self.offset += bits;
        true
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.offset = 0;
    }
}
