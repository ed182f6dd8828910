use std::cmp::min;

use adbproto::frame::{checksum, MessageHeader};

/// Follow-up work a packet carries through the write pump.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Staged {
    /// Nothing pending beyond the frame itself; release after flushing.
    None,
    /// A service left `len` reply bytes in the buffer. After the current
    /// frame flushes, the pump re-sends the packet as a WRTE carrying them.
    Reply(usize),
    /// Service construction is asynchronous; the OKAY (or CLSE) answering
    /// the OPEN is deferred to the completion callback.
    InitAsync,
}

/// A protocol frame plus in-process bookkeeping. The payload buffer is sized
/// by the pool class it was allocated from; `header.data_length` tracks the
/// valid prefix.
#[derive(Debug)]
pub struct Packet {
    pub header: MessageHeader,
    pub staged: Staged,
    data: Box<[u8]>,
}

impl Packet {
    fn with_capacity(capacity: usize) -> Packet {
        Packet {
            header: MessageHeader::default(),
            staged: Staged::None,
            data: vec![0; capacity].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The valid payload prefix, as declared by the header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.header.data_length as usize]
    }

    /// The whole payload buffer, for staging and socket reads.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies `bytes` into the buffer and marks them as the staged reply.
    /// Truncates at capacity; returns the staged length.
    pub fn stage(&mut self, bytes: &[u8]) -> usize {
        let len = min(bytes.len(), self.data.len());
        self.data[..len].copy_from_slice(&bytes[..len]);
        self.staged = Staged::Reply(len);
        len
    }

    /// Marks the first `len` buffer bytes, already written in place, as the
    /// staged reply.
    pub fn stage_len(&mut self, len: usize) {
        self.staged = Staged::Reply(len);
    }

    /// Stamps checksum and magic for the current header and payload prefix.
    pub fn seal(&mut self) {
        let len = self.header.data_length as usize;
        self.header.data_check = checksum(&self.data[..len]);
        self.header.magic = self.header.command ^ 0xffff_ffff;
    }

    fn reset(&mut self) {
        self.header = MessageHeader::default();
        self.staged = Staged::None;
    }
}

/// Bounded per-connection packet allocator. Two size classes exist: the
/// handshake class (issued until the connection is established, large enough
/// for the banner and key frames) and the stream class used afterwards.
///
/// When allocation fails because `frame_max` packets are in flight, the pool
/// remembers the starvation; the first `release` after that crossing reports
/// it so the owner can kick stalled work exactly once.
#[derive(Debug)]
pub struct PacketPool {
    limit: usize,
    stream_size: usize,
    handshake_size: usize,
    in_flight: usize,
    starved: bool,
    free: Vec<Packet>,
}

impl PacketPool {
    pub fn new(limit: usize, stream_size: usize, handshake_size: usize) -> PacketPool {
        PacketPool {
            limit,
            stream_size,
            handshake_size,
            in_flight: 0,
            starved: false,
            free: Vec::new(),
        }
    }

    /// Hands out a packet, transferring ownership to the caller. Returns
    /// `None` once `frame_max` packets are in flight.
    pub fn allocate(&mut self, pre_connect: bool) -> Option<Packet> {
        if self.in_flight >= self.limit {
            self.starved = true;
            return None;
        }

        let size = if pre_connect {
            self.handshake_size
        } else {
            self.stream_size
        };

        let packet = match self.free.iter().position(|p| p.capacity() == size) {
            Some(idx) => {
                let mut packet = self.free.swap_remove(idx);
                packet.reset();
                packet
            }
            None => Packet::with_capacity(size),
        };

        self.in_flight += 1;
        Some(packet)
    }

    /// Consumes a packet. Returns true when this release crossed out of
    /// saturation and the owner must kick deferred work.
    pub fn release(&mut self, packet: Packet) -> bool {
        if self.in_flight == 0 {
            panic!("packet released into an empty pool");
        }

        self.in_flight -= 1;

        if self.free.len() < self.limit {
            self.free.push(packet);
        }

        let kick = self.starved;
        self.starved = false;
        kick
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_classes() {
        let mut pool = PacketPool::new(2, 40, 1024);

        assert_eq!(pool.allocate(true).unwrap().capacity(), 1024);
        assert_eq!(pool.allocate(false).unwrap().capacity(), 40);
    }

    #[test]
    fn test_allocation_bounded() {
        let mut pool = PacketPool::new(2, 40, 1024);

        let a = pool.allocate(false).unwrap();
        let _b = pool.allocate(false).unwrap();

        assert!(pool.allocate(false).is_none());
        assert_eq!(pool.in_flight(), 2);

        // The failed allocation armed the kick; the next release reports it
        // exactly once.
        assert!(pool.release(a));
        let c = pool.allocate(false).unwrap();
        assert!(!pool.release(c));
    }

    #[test]
    fn test_release_without_starvation_is_quiet() {
        let mut pool = PacketPool::new(2, 40, 1024);

        let a = pool.allocate(false).unwrap();
        assert!(!pool.release(a));
    }

    #[test]
    fn test_reuse_resets_bookkeeping() {
        let mut pool = PacketPool::new(2, 40, 1024);

        let mut a = pool.allocate(false).unwrap();
        a.header.command = 7;
        a.stage(b"xyz");
        pool.release(a);

        let b = pool.allocate(false).unwrap();
        assert_eq!(b.header.command, 0);
        assert_eq!(b.staged, Staged::None);
    }

    #[test]
    #[should_panic(expected = "packet released into an empty pool")]
    fn test_double_release_panics() {
        let mut pool = PacketPool::new(2, 40, 1024);
        let a = pool.allocate(false).unwrap();
        let b = Packet::with_capacity(40);

        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn test_stage_truncates_at_capacity() {
        let mut packet = Packet::with_capacity(4);

        assert_eq!(packet.stage(b"abcdef"), 4);
        assert_eq!(packet.staged, Staged::Reply(4));
        assert_eq!(&packet.data()[..4], b"abcd");
    }

    #[test]
    fn test_seal() {
        let mut packet = Packet::with_capacity(8);
        packet.header.command = adbproto::A_WRTE;
        packet.data_mut()[..3].copy_from_slice(&[1, 2, 3]);
        packet.header.data_length = 3;

        packet.seal();

        assert_eq!(packet.header.data_check, 6);
        assert_eq!(packet.header.magic, adbproto::A_WRTE ^ 0xffff_ffff);
    }
}
