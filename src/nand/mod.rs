//! Abstractions and code to access NAND flash

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_bytes_per_page: usize,
}

impl NandLayout {
    /// Bytes of in-band data per erase block
    pub fn block_size(&self) -> u64 {
        u64::from(self.pages_per_block) * self.bytes_per_page as u64
    }

    /// Bytes of in-band data on the whole device
    pub fn size(&self) -> u64 {
        u64::from(self.blocks) * self.block_size()
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTES+OOB"
///
/// Without an explicit OOB size, the usual 1/32 of the page size is assumed.
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (s, oob) = match s.split_once('+') {
            Some((s, oob)) => (s, Some(oob.parse()?)),
            None => (s, None),
        };

        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#[+#]"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let oob_bytes_per_page = oob.unwrap_or(bytes_per_page / 32);

        ensure!(
            blocks > 0 && pages_per_block > 0 && bytes_per_page > 0 && oob_bytes_per_page > 0,
            "NAND layout dimensions must be nonzero"
        );

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Stop the driver from applying its own ECC, so that pages and OOB are programmed exactly as
    /// given. Required before any [NandBlock::program_oob] call.
    fn set_raw_mode(&mut self) -> anyhow::Result<()>;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Byte offset of the block's first page on the device
    fn offset(&self) -> u64;

    /// Write the specified content, beginning at the specified page
    ///
    /// `content` must be a whole number of pages.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Write the OOB (spare) area of one page
    fn program_oob(&mut self, page: u32, oob: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a program() results in error.
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A device operation recorded by [SimNand], identified by byte offset
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimOp {
    Erase(u64),
    Program(u64),
    ProgramOob(u64),
    MarkBad(u64),
}

/// A simulated in-memory NAND flash, for testing purposes and dry runs
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,

    /// Has the "driver" been told to stop doing its own ECC?
    raw_mode: bool,

    /// Every mutating operation issued, in order
    ops: Vec<SimOp>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// In-band bytes of every page
    data: Vec<u8>,

    /// OOB bytes of every page
    oob: Vec<u8>,

    /// Which pages have had their data or OOB programmed since the last erase
    programmed: Vec<(bool, bool)>,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Failures to inject
    fail_erase: bool,
    fail_program: Option<u32>,
    fail_mark_bad: bool,
}

/// The fill byte for blocks marked bad, in saved images
const SIM_BAD_FILL: u8 = 0xBD;

impl SimNand {
    /// Create an empty (fully erased) SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            raw_mode: false,
            ops: Vec::new(),
        }
    }

    /// Bytes per block in the raw (data + OOB) image format of `load`/`save`
    fn raw_block_size(&self) -> usize {
        (self.layout.bytes_per_page + self.layout.oob_bytes_per_page)
            * self.layout.pages_per_block as usize
    }

    /// Initialize the NAND contents from a raw image: every page's data followed by its OOB.
    ///
    /// Blocks consisting entirely of the bad-block fill byte are marked bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.raw_block_size()];
        let page_size = self.layout.bytes_per_page;

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            *block = SimBlock::new(self.layout);

            if buf.iter().all(|&x| x == SIM_BAD_FILL) {
                block.marked_bad = true;
                continue;
            }

            let raw_pages = buf.chunks_exact(page_size + self.layout.oob_bytes_per_page);
            for (page, raw) in raw_pages.enumerate() {
                let (data, oob) = raw.split_at(page_size);
                block.data[page * page_size..][..page_size].copy_from_slice(data);
                block.oob[page * oob.len()..][..oob.len()].copy_from_slice(oob);
                block.programmed[page] = (!data.is_erased(), !oob.is_erased());
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File), in
    /// the format understood by `load`
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let page_size = self.layout.bytes_per_page;
        let oob_size = self.layout.oob_bytes_per_page;
        let mut buf = Vec::with_capacity(self.raw_block_size());

        for block in self.blocks.iter() {
            buf.clear();
            if block.marked_bad {
                buf.resize(self.raw_block_size(), SIM_BAD_FILL);
            } else {
                for (data, oob) in block
                    .data
                    .chunks_exact(page_size)
                    .zip(block.oob.chunks_exact(oob_size))
                {
                    buf.extend_from_slice(data);
                    buf.extend_from_slice(oob);
                }
            }

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// All operations issued so far
    pub fn ops(&self) -> &[SimOp] {
        &self.ops
    }

    /// Has the raw mode been requested?
    pub fn raw_mode(&self) -> bool {
        self.raw_mode
    }

    fn sim_block(&mut self, index: u32) -> &mut SimBlock {
        &mut self.blocks[index as usize]
    }

    /// Mark a block bad, as if from the factory
    pub fn set_bad(&mut self, index: u32) {
        self.sim_block(index).marked_bad = true;
    }

    /// Make every erase of this block fail
    pub fn fail_erase(&mut self, index: u32) {
        self.sim_block(index).fail_erase = true;
    }

    /// Make programming the given page of this block fail
    pub fn fail_program(&mut self, index: u32, page: u32) {
        self.sim_block(index).fail_program = Some(page);
    }

    /// Make marking this block bad fail
    pub fn fail_mark_bad(&mut self, index: u32) {
        self.sim_block(index).fail_mark_bad = true;
    }

    pub fn is_marked_bad(&self, index: u32) -> bool {
        self.blocks[index as usize].marked_bad
    }

    /// The in-band data of a page
    pub fn page_data(&self, index: u32, page: u32) -> &[u8] {
        let size = self.layout.bytes_per_page;
        &self.blocks[index as usize].data[page as usize * size..][..size]
    }

    /// The OOB bytes of a page
    pub fn page_oob(&self, index: u32, page: u32) -> &[u8] {
        let size = self.layout.oob_bytes_per_page;
        &self.blocks[index as usize].oob[page as usize * size..][..size]
    }
}

impl SimBlock {
    /// Construct an erased block within the given layout
    fn new(layout: NandLayout) -> Self {
        let pages = layout.pages_per_block as usize;
        Self {
            data: vec![0xFF; pages * layout.bytes_per_page],
            oob: vec![0xFF; pages * layout.oob_bytes_per_page],
            programmed: vec![(false, false); pages],
            marked_bad: false,
            fail_erase: false,
            fail_program: None,
            fail_mark_bad: false,
        }
    }
}

/// Programming NAND can only clear bits
fn program_bits(cells: &mut [u8], content: &[u8]) {
    for (cell, &byte) in cells.iter_mut().zip(content) {
        *cell &= byte;
    }
}

/// A handle on one good block of a [SimNand]
#[derive(Debug)]
pub struct SimBlockHandle<'a> {
    block: &'a mut SimBlock,
    ops: &'a mut Vec<SimOp>,
    layout: NandLayout,
    raw_mode: bool,
    index: u32,
}

impl SimBlockHandle<'_> {
    fn page_offset(&self, page: u32) -> u64 {
        self.offset() + u64::from(page) * self.layout.bytes_per_page as u64
    }

    fn write_page(&mut self, page: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size(), "content not page-sized");
        ensure!(page < self.page_count(), "page index out of bounds");
        ensure!(
            !self.block.programmed[page as usize].0,
            "write in already-written page"
        );

        self.ops.push(SimOp::Program(self.page_offset(page)));
        if self.block.fail_program == Some(page) {
            bail!("program failure at block {}, page {page}", self.index);
        }

        let begin = page as usize * self.page_size();
        program_bits(&mut self.block.data[begin..][..content.len()], content);
        self.block.programmed[page as usize].0 = true;

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = SimBlockHandle<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        let block = self
            .blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))?;

        if block.marked_bad {
            return Ok(None);
        }

        Ok(Some(SimBlockHandle {
            block,
            ops: &mut self.ops,
            layout: self.layout,
            raw_mode: self.raw_mode,
            index,
        }))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn set_raw_mode(&mut self) -> anyhow::Result<()> {
        self.raw_mode = true;
        Ok(())
    }
}

impl NandBlock for SimBlockHandle<'_> {
    fn page_count(&self) -> u32 {
        self.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.layout.bytes_per_page
    }
    fn offset(&self) -> u64 {
        u64::from(self.index) * self.layout.block_size()
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size()) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn program_oob(&mut self, page: u32, oob: &[u8]) -> anyhow::Result<()> {
        let oob_size = self.layout.oob_bytes_per_page;
        ensure!(self.raw_mode, "OOB write without raw mode would clash with driver ECC");
        ensure!(oob.len() == oob_size, "content not OOB-sized");
        ensure!(page < self.page_count(), "page index out of bounds");
        ensure!(
            !self.block.programmed[page as usize].1,
            "write in already-written OOB"
        );

        self.ops.push(SimOp::ProgramOob(self.page_offset(page)));
        program_bits(&mut self.block.oob[page as usize * oob_size..][..oob_size], oob);
        self.block.programmed[page as usize].1 = true;

        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        self.ops.push(SimOp::Erase(self.offset()));
        if self.block.fail_erase {
            bail!("erase failure at block {}", self.index);
        }

        self.block.data.fill(0xFF);
        self.block.oob.fill(0xFF);
        self.block.programmed.fill((false, false));
        Ok(())
    }

    fn mark_bad(mut self) -> anyhow::Result<()> {
        self.ops.push(SimOp::MarkBad(self.offset()));
        if self.block.fail_mark_bad {
            bail!("could not mark block {} bad", self.index);
        }

        self.block.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    oob_bytes_per_page: 8,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
    assert_eq!(nand.block(3).unwrap().unwrap().offset(), 3 * 16 * 256);
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
    assert!(nand.is_marked_bad(0));

    nand.set_bad(1);
    assert!(nand.block(1).unwrap().is_none());

    nand.fail_mark_bad(2);
    assert!(nand.block(2).unwrap().unwrap().mark_bad().is_err());
    assert!(nand.block(2).unwrap().is_some());
}

#[test]
fn test_sim_program() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(2, &data_in).is_err());
    assert!(block.program(0, &data_in[1..]).is_err());

    // OOB writes need raw mode
    assert!(block.program_oob(2, &[0x12; 8]).is_err());
    nand.set_raw_mode().unwrap();
    let mut block = nand.block(0).unwrap().unwrap();
    block.program_oob(2, &[0x12; 8]).unwrap();
    assert!(block.program_oob(2, &[0x12; 8]).is_err());

    assert!(nand.page_data(0, 1).is_erased());
    assert_eq!(nand.page_data(0, 2), &data_in[..]);
    assert_eq!(nand.page_oob(0, 2), &[0x12; 8]);
    assert!(nand.page_oob(0, 3).is_erased());

    assert_eq!(
        nand.ops(),
        &[SimOp::Program(512), SimOp::ProgramOob(512)]
    );
}

#[test]
fn test_sim_program_ands_bits() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut block = nand.block(1).unwrap().unwrap();
    let mut page = vec![0xFF; 256];
    page[0] = 0xF0;
    block.program(0, &page).unwrap();
    block.erase().unwrap();
    page[0] = 0x3C;
    block.program(0, &page).unwrap();
    assert_eq!(nand.page_data(1, 0)[0], 0x3C);

    // Content programmed without an erase in between can only lose bits
    let mut cells = [0xF0];
    program_bits(&mut cells, &[0x3C]);
    assert_eq!(cells, [0x30]);
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.fail_erase(0);
    nand.fail_program(1, 3);

    assert!(nand.block(0).unwrap().unwrap().erase().is_err());

    let page = vec![0u8; 256];
    let mut block = nand.block(1).unwrap().unwrap();
    block.program(0, &page).unwrap();
    assert!(block.program(3, &page).is_err());
    assert!(nand.page_data(1, 3).is_erased());
}

#[test]
fn test_sim_save_load() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.set_raw_mode()?;
    let mut block = nand.block(2)?.unwrap();
    block.program(1, &[0x55; 256])?;
    block.program_oob(1, &[0x66; 8])?;
    nand.block(5)?.unwrap().mark_bad()?;

    let mut image = Vec::new();
    nand.save(&mut image)?;
    assert_eq!(image.len(), 8 * 16 * (256 + 8));

    let mut loaded = SimNand::new(TEST_LAYOUT);
    loaded.load(&mut &image[..])?;
    assert_eq!(loaded.page_data(2, 1), &[0x55; 256]);
    assert_eq!(loaded.page_oob(2, 1), &[0x66; 8]);
    assert!(loaded.page_data(2, 0).is_erased());
    assert!(loaded.is_marked_bad(5));
    assert!(!loaded.is_marked_bad(4));

    // Loaded pages count as programmed
    assert!(loaded.block(2)?.unwrap().program(1, &[0x55; 256]).is_err());
    Ok(())
}

#[test]
fn test_layout_from_str() {
    let layout: NandLayout = "64x64x2048".parse().unwrap();
    assert_eq!(
        layout,
        NandLayout {
            blocks: 64,
            pages_per_block: 64,
            bytes_per_page: 2048,
            oob_bytes_per_page: 64,
        }
    );
    assert_eq!(layout.block_size(), 128 * 1024);
    assert_eq!(layout.size(), 8 * 1024 * 1024);

    let layout: NandLayout = "4x2x512+16".parse().unwrap();
    assert_eq!(layout.oob_bytes_per_page, 16);

    assert!("4x2".parse::<NandLayout>().is_err());
    assert!("0x2x512".parse::<NandLayout>().is_err());
    assert!("4x2x512+z".parse::<NandLayout>().is_err());
}
