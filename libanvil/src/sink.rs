//! The byte buffer everything serializes into. Writes go at the current position, which can be
//! repositioned to overwrite earlier bytes: the serialize pass first writes each section's stale
//! content at its assigned offset, then seeks back and overwrites the ranges that hold rebuilt
//! structures.

use object::Endianness;

pub(crate) struct OutputSink {
    buffer: Vec<u8>,
    position: usize,
    endian: Endianness,
}

impl OutputSink {
    pub(crate) fn new(endian: Endianness) -> Self {
        Self {
            buffer: Vec::new(),
            position: 0,
            endian,
        }
    }

    pub(crate) fn with_capacity(endian: Endianness, capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            position: 0,
            endian,
        }
    }

    pub(crate) fn endian(&self) -> Endianness {
        self.endian
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn seek(&mut self, position: usize) {
        self.position = position;
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn put(&mut self, byte: u8) {
        self.write_bytes(&[byte]);
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    /// Writes a string followed by its NUL terminator.
    pub(crate) fn write_cstr(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
        self.put(0);
    }

    pub(crate) fn write_u16(&mut self, value: u16) {
        match self.endian {
            Endianness::Little => self.write_bytes(&value.to_le_bytes()),
            Endianness::Big => self.write_bytes(&value.to_be_bytes()),
        }
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        match self.endian {
            Endianness::Little => self.write_bytes(&value.to_le_bytes()),
            Endianness::Big => self.write_bytes(&value.to_be_bytes()),
        }
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        match self.endian {
            Endianness::Little => self.write_bytes(&value.to_le_bytes()),
            Endianness::Big => self.write_bytes(&value.to_be_bytes()),
        }
    }

    /// Pads with `fill` until the position is a multiple of `size`.
    pub(crate) fn align(&mut self, size: usize, fill: u8) {
        while self.position % size != 0 {
            self.put(fill);
        }
    }

    /// Pads with zeroes until the buffer is at least `size` bytes long.
    pub(crate) fn pad_to(&mut self, size: usize) {
        if self.buffer.len() < size {
            self.buffer.resize(size, 0);
        }
        self.position = self.position.max(size);
    }

    pub(crate) fn raw(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_preserves_length() {
        let mut sink = OutputSink::new(Endianness::Little);
        sink.write_u32(0xdead_beef);
        sink.write_u32(0x1234_5678);
        sink.seek(0);
        sink.write_u16(0xffff);
        assert_eq!(sink.len(), 8);
        assert_eq!(&sink.raw()[..4], &[0xff, 0xff, 0xad, 0xde]);
    }

    #[test]
    fn endianness_selected_once() {
        let mut sink = OutputSink::new(Endianness::Big);
        sink.write_u32(0x0102_0304);
        assert_eq!(sink.raw(), &[1, 2, 3, 4]);
    }

    #[test]
    fn align_pads_from_position() {
        let mut sink = OutputSink::new(Endianness::Little);
        sink.write_bytes(b"abc");
        sink.align(4, 0);
        assert_eq!(sink.len(), 4);
        sink.write_u16(0x0201);
        assert_eq!(&sink.raw()[3..], &[0, 1, 2]);
    }

    #[test]
    fn seek_past_end_zero_fills() {
        let mut sink = OutputSink::new(Endianness::Little);
        sink.seek(6);
        sink.write_bytes(b"x");
        assert_eq!(sink.raw(), &[0, 0, 0, 0, 0, 0, b'x']);
    }
}
