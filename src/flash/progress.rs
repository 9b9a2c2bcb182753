//! Bookkeeping for how much of the request is on flash.

/// What became of one block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockOutcome {
    /// This many bytes of the request were erased/written (or deliberately left erased)
    Committed(u64),

    /// The block was unusable and holds nothing of ours
    Skipped,

    /// The block failed part way through writing; its data must be written again elsewhere
    Rewind,
}

/// Progress through a flashing request.
///
/// The rewind flag is raised by [BlockOutcome::Rewind] and stays up until the next buffer fill
/// takes it, however many unusable blocks come in between.
#[derive(Debug, Clone)]
pub struct WriteProgress {
    length: u64,
    block_offset: u64,
    bytes_done: u64,
    rewind: bool,
}

impl WriteProgress {
    /// Start a request for `length` bytes, beginning with the block at `block_offset`
    pub fn new(block_offset: u64, length: u64) -> Self {
        Self {
            length,
            block_offset,
            bytes_done: 0,
            rewind: false,
        }
    }

    /// Offset of the block being worked on
    pub fn block_offset(&self) -> u64 {
        self.block_offset
    }

    /// Bytes of the request committed so far
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// Bytes of the request still to go
    pub fn remaining(&self) -> u64 {
        self.length - self.bytes_done
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_done >= self.length
    }

    /// Record the outcome of the current block and move on to the next one.
    ///
    /// Committed bytes beyond the end of the request (e.g. the tail of a final partial page) are
    /// not counted.
    pub fn advance(&mut self, outcome: BlockOutcome, block_size: u64) {
        match outcome {
            BlockOutcome::Committed(bytes) => self.bytes_done += bytes.min(self.remaining()),
            BlockOutcome::Skipped => (),
            BlockOutcome::Rewind => self.rewind = true,
        }
        self.block_offset += block_size;
    }

    /// Is the buffer holding data that still has to be written? Clears the flag.
    pub fn take_rewind(&mut self) -> bool {
        std::mem::take(&mut self.rewind)
    }
}

#[test]
fn test_progress() {
    let mut progress = WriteProgress::new(0x20000, 10000);
    assert_eq!(progress.remaining(), 10000);

    progress.advance(BlockOutcome::Committed(8192), 0x20000);
    assert_eq!(progress.block_offset(), 0x40000);
    assert_eq!(progress.bytes_done(), 8192);
    assert!(!progress.is_complete());

    progress.advance(BlockOutcome::Committed(2048), 0x20000);
    assert_eq!(progress.bytes_done(), 10000);
    assert!(progress.is_complete());
}

#[test]
fn test_rewind_survives_skipped_blocks() {
    let mut progress = WriteProgress::new(0, 4096);

    progress.advance(BlockOutcome::Rewind, 8192);
    progress.advance(BlockOutcome::Skipped, 8192);
    assert_eq!(progress.bytes_done(), 0);
    assert_eq!(progress.block_offset(), 16384);

    assert!(progress.take_rewind());
    assert!(!progress.take_rewind());
}
