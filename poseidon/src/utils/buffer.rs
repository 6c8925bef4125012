/// A contiguous FIFO of bytes.
///
/// Socket receive and send queues need cheap appends at the tail, a
/// contiguous view of everything pending, and cheap removal of a prefix
/// after a parser or a `send()` call has consumed part of it. A `Vec`
/// plus a head offset gives all three; the storage is compacted once the
/// dead prefix outgrows the live data.
#[derive(Default)]
pub struct ByteQueue {
    buf: Vec<u8>,
    head: usize,
}

// Don't bother memmoving small queues.
const COMPACT_THRESHOLD: usize = 4096;

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            head: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.buf.len()
    }

    /// All pending bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Removes the `n` oldest bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds `len()`.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consuming more bytes than pending");
        self.head += n;

        if self.head >= COMPACT_THRESHOLD && self.head * 2 >= self.buf.len() {
            self.buf.drain(..self.head);
            self.head = 0;
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.head = 0;
    }

    /// Removes and returns all pending bytes.
    pub fn take_all(&mut self) -> Vec<u8> {
        let out = self.buf.split_off(self.head);
        self.buf.clear();
        self.head = 0;
        out
    }

    /// Removes and returns the `n` oldest bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.len(), "taking more bytes than pending");
        let out = self.buf[self.head..self.head + n].to_vec();
        self.consume(n);
        out
    }
}

impl std::fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteQueue")
            .field("len", &self.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = ByteQueue::new();
        q.put(b"hello ");
        q.put(b"world");
        assert_eq!(q.as_slice(), b"hello world");
        assert_eq!(q.len(), 11);

        q.consume(6);
        assert_eq!(q.as_slice(), b"world");

        q.put_u8(b'!');
        assert_eq!(q.take_all(), b"world!");
        assert!(q.is_empty());
    }

    #[test]
    fn test_take_prefix() {
        let mut q = ByteQueue::new();
        q.put(b"abcdef");
        assert_eq!(q.take(2), b"ab");
        assert_eq!(q.as_slice(), b"cdef");
    }

    #[test]
    fn test_compaction_keeps_contents() {
        let mut q = ByteQueue::new();
        let chunk = [0x5Au8; 1024];
        for _ in 0..16 {
            q.put(&chunk);
        }
        // Consume in odd-sized steps across the compaction threshold.
        let mut expected = 16 * 1024;
        while expected > 3000 {
            q.consume(1000);
            expected -= 1000;
            assert_eq!(q.len(), expected);
            assert!(q.as_slice().iter().all(|&b| b == 0x5A));
        }
    }

    #[test]
    #[should_panic]
    fn test_consume_past_end_panics() {
        let mut q = ByteQueue::new();
        q.put(b"ab");
        q.consume(3);
    }
}
