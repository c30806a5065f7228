/// Collects bit-packed values of one field, least significant bit first.
#[derive(Clone, Debug, Default)]
pub struct ByteStreamWriteBuffer {
    buffer: Vec<u8>,
    last_byte_bit: u32,
}

impl ByteStreamWriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the lowest `bits` bits of the value.
    pub fn push(&mut self, value: u64, bits: u32) {
        let mut value = if bits < 64 {
            value & ((1_u64 << bits) - 1)
        } else {
            value
        };
        let mut remaining = bits;
        while remaining > 0 {
            if self.last_byte_bit == 0 {
                self.buffer.push(0);
            }
            let take = (8 - self.last_byte_bit).min(remaining);
            let chunk = (value & ((1_u64 << take) - 1)) as u8;
            if let Some(last) = self.buffer.last_mut() {
                *last |= chunk << self.last_byte_bit;
            }
            value >>= take;
            remaining -= take;
            self.last_byte_bit = (self.last_byte_bit + take) % 8;
        }
    }

    /// Number of bytes including a partially filled last byte.
    #[cfg(test)]
    pub fn byte_len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Takes all collected bytes, a partial last byte is padded with zero bits.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        self.last_byte_bit = 0;
        std::mem::take(&mut self.buffer)
    }
}
