//! Read accumulator and write staging area of a transfer channel
//!
//! Completion callbacks append to the read side and shrink the write side
//! from the backend's completion thread while the caller drains and stages
//! bytes from its own thread. Each side sits behind its own lock, held only
//! for the copy.

use crate::lock;
use bytes::{Bytes, BytesMut};
use std::sync::Mutex;

/// Initial capacity of each side
const INITIAL_CAPACITY: usize = 4096;

pub struct TransferBuffer {
    read: Mutex<BytesMut>,
    write: Mutex<BytesMut>,
}

impl TransferBuffer {
    pub fn new() -> Self {
        Self {
            read: Mutex::new(BytesMut::with_capacity(INITIAL_CAPACITY)),
            write: Mutex::new(BytesMut::with_capacity(INITIAL_CAPACITY)),
        }
    }

    /// Append received bytes to the read accumulator
    pub fn append_read(&self, data: &[u8]) {
        lock(&self.read).extend_from_slice(data);
    }

    /// Take up to `max` bytes from the front of the read accumulator
    pub fn read(&self, max: usize) -> Bytes {
        let mut read = lock(&self.read);
        let n = max.min(read.len());
        read.split_to(n).freeze()
    }

    /// Take everything in the read accumulator
    pub fn read_all(&self) -> Bytes {
        lock(&self.read).split().freeze()
    }

    pub fn bytes_available(&self) -> usize {
        lock(&self.read).len()
    }

    /// Replace the write staging area with `data`
    pub fn stage_write(&self, data: &[u8]) {
        let mut write = lock(&self.write);
        write.clear();
        write.extend_from_slice(data);
    }

    /// Copy of the bytes still waiting to be sent
    pub fn pending_write(&self) -> Vec<u8> {
        lock(&self.write).to_vec()
    }

    /// Drop `sent` bytes from the front of the staging area
    ///
    /// Returns the number of bytes still to send.
    pub fn consume_written(&self, sent: usize) -> usize {
        let mut write = lock(&self.write);
        let n = sent.min(write.len());
        let _ = write.split_to(n);
        write.len()
    }

    pub fn bytes_to_write(&self) -> usize {
        lock(&self.write).len()
    }

    pub fn clear(&self) {
        lock(&self.read).clear();
        lock(&self.write).clear();
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_drains_in_order() {
        let buffer = TransferBuffer::new();
        buffer.append_read(&[1, 2, 3]);
        buffer.append_read(&[4, 5]);

        assert_eq!(buffer.bytes_available(), 5);
        assert_eq!(&buffer.read(2)[..], &[1, 2]);
        assert_eq!(&buffer.read(10)[..], &[3, 4, 5]);
        assert!(buffer.read(1).is_empty());
    }

    #[test]
    fn test_write_staging_shrinks() {
        let buffer = TransferBuffer::new();
        buffer.stage_write(&[0; 10]);

        assert_eq!(buffer.consume_written(3), 7);
        assert_eq!(buffer.consume_written(5), 2);
        assert_eq!(buffer.pending_write().len(), 2);
        assert_eq!(buffer.consume_written(4), 0);
        assert_eq!(buffer.bytes_to_write(), 0);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        use std::sync::Arc;

        let buffer = Arc::new(TransferBuffer::new());
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    buffer.append_read(&i.to_le_bytes());
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < 4000 {
            received.extend_from_slice(&buffer.read(64));
        }
        producer.join().unwrap();

        let values: Vec<u32> = received
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, (0..1000).collect::<Vec<_>>());
    }
}
