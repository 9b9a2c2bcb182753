//! This module implements the erase/write loop over a NAND device.
//!
//! The device is walked one erase block at a time, starting with the block containing the start
//! offset. Each good block moves through a small state machine:
//!
//! ```text
//! Erase (if asked to) -> Fill buffer (unless rewinding) -> Write pages -> Finished
//! ```
//!
//! and finishes either with some bytes committed, skipped (it was unusable), or "rewind": writing
//! failed part way, the block was marked bad, and the same buffer must go to the next good block.
//!
//! Bad block policy follows the usual flasher rules: blocks already marked bad are skipped, and
//! any block that fails an erase or program is marked bad so nothing reads it later. If marking it
//! bad fails, nothing further can be trusted and the run stops. With `fail_bad`, the first bad
//! block ends the run instead.

mod progress;

pub use progress::{BlockOutcome, WriteProgress};

use std::io::Read;

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::ecc::{EccEncoder, OobLayout, OOB_SIZE, PAGE_DATA_SIZE};
use crate::image::{BlockBuffer, ImageFeed};
use crate::nand::{Nand, NandBlock, NandLayout};
use crate::{Error, Result};

/// What to do, and where
#[derive(Debug, Default, Copy, Clone)]
pub struct FlashOptions {
    /// Offset of the first byte to write, from the start of the device; must be page aligned
    pub start: u64,

    /// Bytes to write (or erase)
    pub length: u64,

    /// Never touch anything at or above this offset; defaults to the device size
    pub max_offset: Option<u64>,

    /// Erase each block before writing it (or, without an image, only erase)
    pub erase: bool,

    /// Abort on the first bad block rather than skipping it
    pub fail_bad: bool,

    /// Generate ECC in software, writing it to the OOB in this layout
    pub oob_layout: Option<OobLayout>,

    /// Leave trailing all-0xFF pages of each block unprogrammed, so that UBI can write them later
    /// without clashing with our ECC
    pub skip_trailing_erased: bool,
}

/// Totals for a completed run
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FlashSummary {
    /// Bytes of the request erased or written; equals the requested length
    pub bytes_done: u64,

    /// Blocks skipped because they were already marked bad
    pub bad_blocks: u32,

    /// Blocks that failed during this run and were marked bad
    pub retired_blocks: u32,

    /// Pages programmed
    pub pages_written: u32,

    /// Erased pages deliberately left unprogrammed
    pub pages_skipped: u32,
}

/// The state of one good block as it is being processed
enum BlockState<B> {
    Erase(B),
    Fill(B),
    Write(B),
    Finished(BlockOutcome),
}

/// Everything the loop needs, apart from the NAND itself (which the current block borrows)
struct Flasher<R> {
    layout: NandLayout,
    options: FlashOptions,
    max_offset: u64,
    image: Option<ImageFeed<R>>,
    ecc: Option<(EccEncoder, OobLayout)>,
    buffer: BlockBuffer,
    progress: WriteProgress,
    summary: FlashSummary,
    rpt: howudoin::Tx,
}

/// Check that `layout` is the one geometry the ECC layouts are defined for
fn check_geometry(layout: &NandLayout) -> Result<()> {
    if layout.oob_bytes_per_page != OOB_SIZE {
        return Err(Error::Config(format!(
            "oobsize {} not supported",
            layout.oob_bytes_per_page
        )));
    }
    if layout.bytes_per_page != PAGE_DATA_SIZE {
        return Err(Error::Config(format!(
            "writesize {} not supported",
            layout.bytes_per_page
        )));
    }
    Ok(())
}

/// Erase and/or write `options.length` bytes at `options.start`.
///
/// With an `image`, its bytes are written (after erasing each block, if `options.erase`);
/// without, blocks are only erased. Nothing is written to the device until the whole request
/// has been checked against the device geometry and size.
pub fn flash<N: Nand, R: Read>(
    nand: &mut N,
    image: Option<R>,
    options: &FlashOptions,
) -> Result<FlashSummary> {
    let layout = nand.get_layout();
    check_geometry(&layout)?;

    if image.is_none() && !options.erase {
        return Err(Error::Config("must either write or erase".into()));
    }
    if options.start % layout.bytes_per_page as u64 != 0 {
        return Err(Error::Config(format!(
            "start offset must be aligned to page size {:#x}",
            layout.bytes_per_page
        )));
    }

    let mut flasher = Flasher::new(layout, image, options);
    flasher.check_request()?;

    if flasher.image.is_some() && options.oob_layout.is_some() {
        nand.set_raw_mode()?;
    }

    let result = flasher.run(nand);
    flasher.rpt.close();
    result
}

impl<R: Read> Flasher<R> {
    fn new(layout: NandLayout, image: Option<R>, options: &FlashOptions) -> Self {
        let max_offset = match options.max_offset {
            None => layout.size(),
            Some(max) if max > layout.size() => {
                warn!("Max offset truncated to device size: {:#x}", layout.size());
                layout.size()
            }
            Some(max) => max,
        };

        // Only spend time on the field tables if they will be used
        let ecc = options
            .oob_layout
            .filter(|_| image.is_some())
            .map(|oob_layout| (EccEncoder::new(), oob_layout));

        let block_size = layout.block_size();
        let first_block = options.start - options.start % block_size;
        let blocks_needed = (options.start - first_block)
            .saturating_add(options.length)
            .div_ceil(block_size);

        Self {
            layout,
            options: *options,
            max_offset,
            image: image.map(ImageFeed::new),
            ecc,
            buffer: BlockBuffer::new(&layout),
            progress: WriteProgress::new(first_block, options.length),
            summary: FlashSummary::default(),
            rpt: howudoin::new().label("Flashing").set_len(blocks_needed),
        }
    }

    fn page_size(&self) -> u64 {
        self.layout.bytes_per_page as u64
    }

    /// Log everything relevant to why the request doesn't fit
    fn dump_stats(&self) {
        error!(
            device_size = self.layout.size(),
            max_offset = self.max_offset,
            length = self.options.length,
            page_size = self.page_size(),
            pages_needed = self.options.length.div_ceil(self.page_size()),
            image_read = self.image.as_ref().map(ImageFeed::consumed),
            start = self.options.start,
            block_start = self.progress.block_offset(),
            bytes_done = self.progress.bytes_done(),
            "request statistics"
        );
    }

    /// Fail with [Error::NoSpace] if an operation touching everything below `end` is not allowed
    fn check_bounds(&self, end: u64, reason: &'static str) -> Result<()> {
        if end > self.max_offset {
            self.dump_stats();
            return Err(Error::NoSpace(reason));
        }
        Ok(())
    }

    /// Up-front check that the request could fit, if there were no bad blocks
    fn check_request(&self) -> Result<()> {
        // A length too large to round up to whole pages can't fit either
        let room = self.layout.size().saturating_sub(self.options.start);
        let needed = self
            .options
            .length
            .div_ceil(self.page_size())
            .checked_mul(self.page_size())
            .filter(|&needed| needed <= room);

        let Some(needed) = needed else {
            self.dump_stats();
            return Err(Error::NoSpace("Request would pass the end of device"));
        };
        if needed > self.max_offset.saturating_sub(self.options.start) {
            self.dump_stats();
            return Err(Error::NoSpace("Request would exceed max offset limit"));
        }
        Ok(())
    }

    /// The page where the request starts within the block at `block_offset`
    fn start_page(&self, block_offset: u64) -> u32 {
        (self.options.start.saturating_sub(block_offset) / self.page_size()) as u32
    }

    fn run<N: Nand>(&mut self, nand: &mut N) -> Result<FlashSummary> {
        let block_size = self.layout.block_size();

        while !self.progress.is_complete() {
            let offset = self.progress.block_offset();
            self.check_bounds(offset + 1, "No good blocks left below max offset")?;

            let index: u32 = (offset / block_size)
                .try_into()
                .context("block index out of range")?;
            let outcome = match nand.block(index)? {
                None => self.skip_bad_block(offset)?,
                Some(block) => self.process_block(block)?,
            };

            if let BlockOutcome::Committed(_) = outcome {
                self.rpt.inc();
            }
            self.progress.advance(outcome, block_size);
        }

        self.summary.bytes_done = self.progress.bytes_done();
        info!(
            "Done: {:#x} bytes, {} bad blocks skipped, {} blocks marked bad",
            self.summary.bytes_done, self.summary.bad_blocks, self.summary.retired_blocks
        );
        Ok(self.summary)
    }

    fn skip_bad_block(&mut self, offset: u64) -> Result<BlockOutcome> {
        self.summary.bad_blocks += 1;
        if self.options.fail_bad {
            warn!("Bad block at {offset:#x} : ABORT");
            return Err(Error::BadBlock { offset });
        }
        warn!("Bad block at {offset:#x} : skip");
        Ok(BlockOutcome::Skipped)
    }

    /// Run a good block through the state machine
    fn process_block<B: NandBlock>(&mut self, block: B) -> Result<BlockOutcome> {
        let action = match (self.options.erase, self.image.is_some()) {
            (true, true) => "Erase + write",
            (true, false) => "Erase",
            _ => "Write",
        };
        info!("{action} block at {:#x}", block.offset());
        self.rpt.desc(format!("{action} block at {:#x}", block.offset()));

        let mut state = BlockState::Erase(block);
        loop {
            state = match self.step(state)? {
                BlockState::Finished(outcome) => return Ok(outcome),
                next => next,
            };
        }
    }

    /// The transition function of the per-block state machine
    fn step<B: NandBlock>(&mut self, state: BlockState<B>) -> Result<BlockState<B>> {
        match state {
            BlockState::Erase(block) => self.erase_step(block),
            BlockState::Fill(block) => self.fill_step(block),
            BlockState::Write(block) => self.write_step(block),
            finished @ BlockState::Finished(_) => Ok(finished),
        }
    }

    fn erase_step<B: NandBlock>(&mut self, mut block: B) -> Result<BlockState<B>> {
        let offset = block.offset();

        if self.options.erase {
            self.check_bounds(
                offset + self.layout.block_size(),
                "Erasing next block would exceed max offset",
            )?;

            debug!("erase block at {offset:#x}");
            if let Err(error) = block.erase() {
                warn!("Erase block at {offset:#x} failed: {error:#}");
                self.retire(block)?;
                return Ok(BlockState::Finished(BlockOutcome::Skipped));
            }
        }

        if self.image.is_none() {
            // Only erasing: the whole block (from the start page) is done
            let pages = self.layout.pages_per_block - self.start_page(offset);
            let bytes = u64::from(pages) * self.page_size();
            return Ok(BlockState::Finished(BlockOutcome::Committed(bytes)));
        }

        Ok(BlockState::Fill(block))
    }

    fn fill_step<B: NandBlock>(&mut self, block: B) -> Result<BlockState<B>> {
        if self.progress.take_rewind() {
            debug!("rewind: writing the previous block's data again");
            return Ok(BlockState::Write(block));
        }

        let start_page = self.start_page(block.offset());
        let room = self.layout.block_size() - u64::from(start_page) * self.page_size();
        let len = room.min(self.progress.remaining()) as usize;

        let image = self
            .image
            .as_mut()
            .context("BUG: filling a block buffer without an image")?;
        self.buffer.fill(image, start_page, len)?;

        Ok(BlockState::Write(block))
    }

    fn write_step<B: NandBlock>(&mut self, mut block: B) -> Result<BlockState<B>> {
        let offset = block.offset();
        let pages = self.layout.pages_per_block;

        let write_pages = if self.options.skip_trailing_erased {
            pages - self.buffer.trailing_erased_pages()
        } else {
            pages
        };
        if write_pages != pages {
            info!("Skip last {} pages of block", pages - write_pages);
        }

        let mut block_bytes = 0;
        for page in self.buffer.start_page()..pages {
            self.check_bounds(
                offset + u64::from(page + 1) * self.page_size(),
                "Writing this page would exceed max offset",
            )?;

            if page >= write_pages {
                // Still counted as done: the page is erased, which is what the buffer holds
                debug!("Skipping page {page}");
                self.summary.pages_skipped += 1;
            } else if let Err(error) = self.program_page(&mut block, page) {
                warn!("Write block at {offset:#x}, page {page} failed: {error:#}");
                return self.abandon_block(block);
            }

            block_bytes += self.page_size();
            if block_bytes >= self.progress.remaining() {
                break;
            }
        }

        Ok(BlockState::Finished(BlockOutcome::Committed(block_bytes)))
    }

    /// Program one page from the buffer, with its OOB if generating ECC
    fn program_page<B: NandBlock>(&mut self, block: &mut B, page: u32) -> anyhow::Result<()> {
        let data = self.buffer.page(page);
        debug!(
            "{:#x} (#{page:<2} of block)",
            block.offset() + u64::from(page) * self.page_size()
        );

        match &self.ecc {
            Some((encoder, layout)) => {
                let raw = encoder.encode_page(data.try_into()?, *layout);
                let (page_data, oob) = raw.split_at(PAGE_DATA_SIZE);
                block.program(page, page_data)?;
                debug!("OOB");
                block.program_oob(page, oob)?;
            }
            None => block.program(page, data)?,
        }

        self.summary.pages_written += 1;
        Ok(())
    }

    /// A write into this block failed: get rid of it, and arrange for its data to go elsewhere
    fn abandon_block<B: NandBlock>(&mut self, mut block: B) -> Result<BlockState<B>> {
        let offset = block.offset();

        if let Err(error) = block.erase() {
            // Not so important, as the block is about to be marked bad anyway
            warn!("Erase block at {offset:#x} failed: {error:#}");
        }
        self.retire(block)?;

        if self.options.fail_bad {
            return Err(Error::BadBlock { offset });
        }
        Ok(BlockState::Finished(BlockOutcome::Rewind))
    }

    /// Mark a block bad. Failing to is fatal: the block could later be mistaken for a good one.
    fn retire<B: NandBlock>(&mut self, block: B) -> Result<()> {
        let offset = block.offset();
        warn!("mark block bad at {offset:#x}");
        block
            .mark_bad()
            .with_context(|| format!("Marking block bad at {offset:#x} failed"))?;
        self.summary.retired_blocks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::nand::{PageUtil, SimNand, SimOp};
    use pretty_assertions::assert_eq;

    const PAGE: u64 = 2048;
    const BLOCK: u64 = 4 * PAGE;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 8,
        pages_per_block: 4,
        bytes_per_page: 2048,
        oob_bytes_per_page: 64,
    };

    /// Test image content; no page of it is ever all-0xFF
    fn pattern(len: u64) -> Vec<u8> {
        (0..len as usize).map(|i| (i * 7 + i / 251) as u8 & 0x7F).collect()
    }

    fn options(length: u64) -> FlashOptions {
        FlashOptions {
            length,
            ..Default::default()
        }
    }

    /// Every page of `image`, in order, as found at the given device pages
    fn assert_pages(nand: &SimNand, image: &[u8], pages: &[(u32, u32)]) {
        for (chunk, &(block, page)) in image.chunks(PAGE as usize).zip(pages) {
            let stored = nand.page_data(block, page);
            assert_eq!(&stored[..chunk.len()], chunk, "block {block}, page {page}");
            assert!(stored[chunk.len()..].is_erased());
        }
    }

    #[test]
    fn test_three_pages_no_ecc() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(3 * PAGE);

        let summary = flash(&mut nand, Some(&image[..]), &options(3 * PAGE))?;

        assert_eq!(summary.bytes_done, 6144);
        assert_eq!(summary.pages_written, 3);
        assert_eq!(
            nand.ops(),
            &[
                SimOp::Program(0),
                SimOp::Program(2048),
                SimOp::Program(4096)
            ]
        );
        assert!(!nand.raw_mode());
        assert_pages(&nand, &image, &[(0, 0), (0, 1), (0, 2)]);
        Ok(())
    }

    #[test]
    fn test_three_pages_legacy_ecc() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(3 * PAGE);
        let opts = FlashOptions {
            oob_layout: Some(OobLayout::Legacy),
            ..options(3 * PAGE)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        assert_eq!(summary.bytes_done, 6144);
        assert!(nand.raw_mode());
        assert_eq!(
            nand.ops(),
            &[
                SimOp::Program(0),
                SimOp::ProgramOob(0),
                SimOp::Program(2048),
                SimOp::ProgramOob(2048),
                SimOp::Program(4096),
                SimOp::ProgramOob(4096),
            ]
        );

        // Reassemble each raw page and check each subpage against the codeword generator alone
        let encoder = EccEncoder::new();
        for (page, data) in image.chunks(PAGE as usize).enumerate() {
            let mut raw = nand.page_data(0, page as u32).to_vec();
            raw.extend_from_slice(nand.page_oob(0, page as u32));

            for n in 0..4 {
                let subpage = data[n * 512..][..512].try_into()?;
                assert_eq!(&raw[n * 528..][..512], &data[n * 512..][..512]);
                assert_eq!(&raw[n * 528 + 512..][..6], &[0xFF; 6]);
                assert_eq!(raw[n * 528 + 518..][..10], encoder.subpage_ecc(subpage));
            }
        }

        // The unwritten page keeps its erased OOB
        assert!(nand.page_oob(0, 3).is_erased());
        Ok(())
    }

    #[test]
    fn test_dm365_ecc() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(PAGE);
        let opts = FlashOptions {
            oob_layout: Some(OobLayout::Dm365Rbl),
            ..options(PAGE)
        };

        flash(&mut nand, Some(&image[..]), &opts)?;

        let encoder = EccEncoder::new();
        let expected = encoder.encode_page(image[..].try_into()?, OobLayout::Dm365Rbl);
        assert_eq!(nand.page_data(0, 0), &image[..]);
        assert_eq!(nand.page_oob(0, 0), &expected[2048..]);
        Ok(())
    }

    #[test]
    fn test_bad_block_skipped() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_bad(0);
        let image = pattern(3 * PAGE);
        let opts = FlashOptions {
            erase: true,
            ..options(3 * PAGE)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        assert_eq!(summary.bytes_done, 6144);
        assert_eq!(summary.bad_blocks, 1);
        assert_eq!(
            nand.ops(),
            &[
                SimOp::Erase(BLOCK),
                SimOp::Program(BLOCK),
                SimOp::Program(BLOCK + 2048),
                SimOp::Program(BLOCK + 4096)
            ]
        );
        assert_pages(&nand, &image, &[(1, 0), (1, 1), (1, 2)]);
        Ok(())
    }

    #[test]
    fn test_bad_block_strict() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_bad(1);
        let image = pattern(2 * BLOCK);
        let opts = FlashOptions {
            fail_bad: true,
            ..options(2 * BLOCK)
        };

        let err = flash(&mut nand, Some(&image[..]), &opts).unwrap_err();

        assert!(matches!(err, Error::BadBlock { offset: BLOCK }));
        assert_eq!(err.exit_code(), 2);
        // Block 0 went out before the bad block was seen; nothing after it
        assert_eq!(nand.ops().len(), 4);
        assert_eq!(nand.ops().last(), Some(&SimOp::Program(3 * PAGE)));
    }

    #[test]
    fn test_write_failure_rewinds() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_program(0, 2);
        let image = pattern(2 * BLOCK);

        let summary = flash(&mut nand, Some(&image[..]), &options(2 * BLOCK))?;

        assert_eq!(summary.bytes_done, 2 * BLOCK);
        assert_eq!(summary.retired_blocks, 1);
        assert!(nand.is_marked_bad(0));
        assert_eq!(
            nand.ops()[..5],
            [
                SimOp::Program(0),
                SimOp::Program(2048),
                SimOp::Program(4096),
                SimOp::Erase(0),
                SimOp::MarkBad(0),
            ]
        );

        // The first block's data went, unchanged, to the next block
        assert_pages(
            &nand,
            &image,
            &[
                (1, 0),
                (1, 1),
                (1, 2),
                (1, 3),
                (2, 0),
                (2, 1),
                (2, 2),
                (2, 3),
            ],
        );
        Ok(())
    }

    #[test]
    fn test_write_failure_strict() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_program(0, 1);
        let image = pattern(2 * BLOCK);
        let opts = FlashOptions {
            fail_bad: true,
            ..options(2 * BLOCK)
        };

        let err = flash(&mut nand, Some(&image[..]), &opts).unwrap_err();

        assert_eq!(err.exit_code(), 2);
        assert!(nand.is_marked_bad(0));
        assert_eq!(
            nand.ops(),
            &[
                SimOp::Program(0),
                SimOp::Program(2048),
                SimOp::Erase(0),
                SimOp::MarkBad(0),
            ]
        );
    }

    #[test]
    fn test_mark_bad_failure_is_fatal() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_program(0, 1);
        nand.fail_mark_bad(0);
        let image = pattern(2 * BLOCK);

        let err = flash(&mut nand, Some(&image[..]), &options(2 * BLOCK)).unwrap_err();

        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("Marking block bad at 0x0 failed"));
        assert_eq!(nand.ops().last(), Some(&SimOp::MarkBad(0)));
    }

    #[test]
    fn test_erase_failure() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_erase(0);
        let image = pattern(PAGE);
        let opts = FlashOptions {
            erase: true,
            ..options(PAGE)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        assert_eq!(summary.retired_blocks, 1);
        assert_eq!(
            nand.ops(),
            &[
                SimOp::Erase(0),
                SimOp::MarkBad(0),
                SimOp::Erase(BLOCK),
                SimOp::Program(BLOCK),
            ]
        );
        assert_pages(&nand, &image, &[(1, 0)]);
        Ok(())
    }

    #[test]
    fn test_erase_failure_unmarkable() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_erase(0);
        nand.fail_mark_bad(0);
        let opts = FlashOptions {
            erase: true,
            ..options(BLOCK)
        };

        let err = flash(&mut nand, None::<&[u8]>, &opts).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(nand.ops(), &[SimOp::Erase(0), SimOp::MarkBad(0)]);
    }

    #[test]
    fn test_skip_trailing_erased() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut image = pattern(BLOCK);
        image[2 * PAGE as usize..].fill(0xFF);
        let opts = FlashOptions {
            skip_trailing_erased: true,
            oob_layout: Some(OobLayout::Legacy),
            ..options(BLOCK)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        assert_eq!(summary.bytes_done, BLOCK);
        assert_eq!(summary.pages_written, 2);
        assert_eq!(summary.pages_skipped, 2);
        assert_eq!(
            nand.ops(),
            &[
                SimOp::Program(0),
                SimOp::ProgramOob(0),
                SimOp::Program(2048),
                SimOp::ProgramOob(2048),
            ]
        );
        assert!(nand.page_oob(0, 2).is_erased());
        assert!(nand.page_oob(0, 3).is_erased());
        Ok(())
    }

    #[test]
    fn test_skip_whole_erased_block() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut image = pattern(2 * BLOCK);
        image[..BLOCK as usize].fill(0xFF);
        let opts = FlashOptions {
            skip_trailing_erased: true,
            oob_layout: Some(OobLayout::Dm365Rbl),
            ..options(2 * BLOCK)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        // The first block is committed without a single program
        assert_eq!(summary.bytes_done, 2 * BLOCK);
        assert_eq!(summary.pages_skipped, 4);
        assert_eq!(summary.pages_written, 4);
        assert_eq!(nand.ops()[0], SimOp::Program(BLOCK));
        assert_eq!(nand.ops().len(), 8);
        for page in 0..4 {
            assert!(nand.page_data(0, page).is_erased());
            assert!(nand.page_oob(0, page).is_erased());
        }
        Ok(())
    }

    #[test]
    fn test_skip_trailing_erased_counts_padding() -> anyhow::Result<()> {
        // Padding after the end of a short request is never visited, so it isn't "skipped"
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(BLOCK + PAGE);
        let opts = FlashOptions {
            skip_trailing_erased: true,
            ..options(BLOCK + PAGE)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        assert_eq!(summary.bytes_done, BLOCK + PAGE);
        assert_eq!(summary.pages_written, 5);
        assert_eq!(summary.pages_skipped, 0);
        Ok(())
    }

    #[test]
    fn test_unaligned_start() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(3 * PAGE);
        let opts = FlashOptions {
            start: 2 * PAGE,
            ..options(3 * PAGE)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        assert_eq!(summary.bytes_done, 3 * PAGE);
        assert_eq!(
            nand.ops(),
            &[
                SimOp::Program(2 * PAGE),
                SimOp::Program(3 * PAGE),
                SimOp::Program(BLOCK),
            ]
        );
        assert_pages(&nand, &image, &[(0, 2), (0, 3), (1, 0)]);
        Ok(())
    }

    #[test]
    fn test_rewind_keeps_start_page() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_program(0, 3);
        let image = pattern(3 * PAGE);
        let opts = FlashOptions {
            start: 2 * PAGE,
            ..options(3 * PAGE)
        };

        let summary = flash(&mut nand, Some(&image[..]), &opts)?;

        assert_eq!(summary.bytes_done, 3 * PAGE);
        assert!(nand.is_marked_bad(0));
        assert_pages(&nand, &image, &[(1, 2), (1, 3), (2, 0)]);
        assert!(nand.page_data(1, 0).is_erased());
        assert!(nand.page_data(1, 1).is_erased());
        Ok(())
    }

    #[test]
    fn test_partial_last_page() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(5000);

        let summary = flash(&mut nand, Some(&image[..]), &options(5000))?;

        assert_eq!(summary.bytes_done, 5000);
        assert_eq!(summary.pages_written, 3);
        assert_pages(&nand, &image, &[(0, 0), (0, 1), (0, 2)]);
        Ok(())
    }

    #[test]
    fn test_erase_only() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_bad(1);
        let opts = FlashOptions {
            start: PAGE,
            erase: true,
            ..options(BLOCK + PAGE)
        };

        let summary = flash(&mut nand, None::<&[u8]>, &opts)?;

        assert_eq!(summary.bytes_done, BLOCK + PAGE);
        assert_eq!(
            nand.ops(),
            &[SimOp::Erase(0), SimOp::Erase(2 * BLOCK)]
        );
        Ok(())
    }

    #[test]
    fn test_erase_before_write() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let opts = FlashOptions {
            erase: true,
            ..options(PAGE)
        };

        // Writing twice only works thanks to the erase in between
        flash(&mut nand, Some(&pattern(PAGE)[..]), &opts)?;
        flash(&mut nand, Some(&[0x11; PAGE as usize][..]), &opts)?;
        assert_eq!(nand.page_data(0, 0), &[0x11; PAGE as usize][..]);

        // Without it, the page can't be programmed, and the block is given up on
        let summary = flash(&mut nand, Some(&pattern(PAGE)[..]), &options(PAGE))?;
        assert_eq!(summary.retired_blocks, 1);
        assert!(nand.is_marked_bad(0));
        assert_eq!(nand.page_data(1, 0), &pattern(PAGE)[..]);
        Ok(())
    }

    #[test]
    fn test_request_past_device_end() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(8 * BLOCK);
        let opts = FlashOptions {
            start: PAGE,
            ..options(8 * BLOCK)
        };

        let err = flash(&mut nand, Some(&image[..]), &opts).unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
        assert_eq!(err.exit_code(), 3);
        assert!(nand.ops().is_empty());
    }

    #[test]
    fn test_huge_length() {
        let mut nand = SimNand::new(TEST_LAYOUT);

        for (start, length) in [(PAGE, u64::MAX), (0, u64::MAX - 10)] {
            let opts = FlashOptions {
                start,
                erase: true,
                ..options(length)
            };

            let err = flash(&mut nand, None::<&[u8]>, &opts).unwrap_err();
            assert!(matches!(err, Error::NoSpace(_)));
            assert_eq!(err.exit_code(), 3);
        }
        assert!(nand.ops().is_empty());
    }

    #[test]
    fn test_request_past_max_offset() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(3 * BLOCK);
        let opts = FlashOptions {
            max_offset: Some(2 * BLOCK),
            ..options(3 * BLOCK)
        };

        let err = flash(&mut nand, Some(&image[..]), &opts).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(nand.ops().is_empty());
    }

    #[test]
    fn test_bad_blocks_exhaust_space() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_bad(1);
        let image = pattern(2 * BLOCK);
        let opts = FlashOptions {
            max_offset: Some(2 * BLOCK),
            ..options(2 * BLOCK)
        };

        let err = flash(&mut nand, Some(&image[..]), &opts).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(nand.ops().len(), 4);
    }

    #[test]
    fn test_bad_blocks_exhaust_device() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_bad(7);
        let image = pattern(8 * BLOCK);

        let err = flash(&mut nand, Some(&image[..]), &options(8 * BLOCK)).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_max_offset_clamped() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(PAGE);
        let opts = FlashOptions {
            max_offset: Some(1 << 40),
            ..options(PAGE)
        };

        assert_eq!(flash(&mut nand, Some(&image[..]), &opts)?.bytes_done, PAGE);
        Ok(())
    }

    #[test]
    fn test_truncated_image() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let image = pattern(BLOCK + 100);

        let err = flash(&mut nand, Some(&image[..]), &options(2 * BLOCK)).unwrap_err();
        assert!(matches!(err, Error::ImageTruncated { .. }));
        assert_eq!(err.exit_code(), 1);

        // What was written stays written
        assert_eq!(nand.ops().len(), 4);
    }

    #[test]
    fn test_unsupported_geometry() {
        let mut nand = SimNand::new(NandLayout {
            bytes_per_page: 4096,
            oob_bytes_per_page: 128,
            ..TEST_LAYOUT
        });

        let err = flash(&mut nand, Some(&pattern(PAGE)[..]), &options(PAGE)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.exit_code(), 1);
        assert!(nand.ops().is_empty());
    }

    #[test]
    fn test_bad_requests() {
        let mut nand = SimNand::new(TEST_LAYOUT);

        let opts = FlashOptions {
            start: 100,
            ..options(PAGE)
        };
        let err = flash(&mut nand, Some(&pattern(PAGE)[..]), &opts).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = flash(&mut nand, None::<&[u8]>, &options(PAGE)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        assert!(nand.ops().is_empty());
    }

    #[test]
    fn test_empty_request() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let summary = flash(&mut nand, Some(&[0u8; 0][..]), &options(0))?;
        assert_eq!(summary, FlashSummary::default());
        assert!(nand.ops().is_empty());
        Ok(())
    }
}
