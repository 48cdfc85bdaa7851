//! Task-owned copy of domain memory.
//!
//! The receive phase fills the image from the domain, application logic
//! works on it without holding the shared lock, and the send phase hands it
//! back to the domain. Multi-byte values are little-endian, as on the wire.

use crate::binding::ProcessVariableBinding;

/// Process data buffers for one domain.
#[derive(Debug, Clone, Default)]
pub struct ProcessImage {
    data: Vec<u8>,
}

impl ProcessImage {
    /// Create a zeroed image of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for an image without process data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw bytes, mutably (for the receive phase to fill).
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read a byte at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    /// Read a u16 at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a u32 at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = self.data.get(offset..offset + 4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Write a byte. Returns false if the offset is out of range.
    pub fn write_u8(&mut self, offset: usize, value: u8) -> bool {
        match self.data.get_mut(offset) {
            Some(b) => {
                *b = value;
                true
            }
            None => false,
        }
    }

    /// Write a u16. Returns false if the range does not fit.
    pub fn write_u16(&mut self, offset: usize, value: u16) -> bool {
        match self.data.get_mut(offset..offset + 2) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Write a u32. Returns false if the range does not fit.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> bool {
        match self.data.get_mut(offset..offset + 4) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Read the value of a bound variable, honouring sub-byte slots.
    #[must_use]
    pub fn read(&self, binding: &ProcessVariableBinding) -> Option<u32> {
        let bytes = self
            .data
            .get(binding.offset..binding.offset + binding.byte_len())?;
        let mut raw = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            raw |= u64::from(*b) << (8 * i);
        }
        let value = (raw >> binding.bit_position) & mask(binding.bit_len);
        u32::try_from(value).ok()
    }

    /// Write the value of a bound variable, leaving neighbouring bits intact.
    ///
    /// Bits of `value` beyond the slot width are dropped. Returns false if
    /// the slot lies outside the image.
    pub fn write(&mut self, binding: &ProcessVariableBinding, value: u32) -> bool {
        let Some(bytes) = self
            .data
            .get_mut(binding.offset..binding.offset + binding.byte_len())
        else {
            return false;
        };

        let mut raw = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            raw |= u64::from(*b) << (8 * i);
        }
        let field = mask(binding.bit_len) << binding.bit_position;
        raw = (raw & !field) | ((u64::from(value) << binding.bit_position) & field);
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (raw >> (8 * i)) as u8;
        }
        true
    }
}

fn mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}
