//! Reading the source image into per-block buffers.

use std::io::Read;

use tracing::debug;

use crate::nand::{NandLayout, PageUtil};
use crate::util::ReadExt;
use crate::{Error, Result};

/// The source image, consumed strictly in order
#[derive(Debug)]
pub struct ImageFeed<R> {
    reader: R,
    consumed: u64,
}

impl<R: Read> ImageFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            consumed: 0,
        }
    }

    /// Fill `buf` completely from the image. Running out of image first is an error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = self.reader.read_up_to(buf)?;
        self.consumed += got as u64;
        debug!("read {got:#x} ({got}) bytes of image");

        if got < buf.len() {
            return Err(Error::ImageTruncated {
                wanted: buf.len(),
                got,
            });
        }
        Ok(())
    }

    /// Total bytes taken from the image so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// One erase block's worth of page data, as it should be programmed.
///
/// Bytes outside the range filled from the image are 0xFF, the erased state. The buffer remembers
/// the page its image data starts at, so that a retry in another block puts the data at the same
/// page indices.
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    data: Vec<u8>,
    page_size: usize,
    start_page: u32,
}

impl BlockBuffer {
    /// An erased buffer sized for one block of `layout`
    pub fn new(layout: &NandLayout) -> Self {
        Self {
            data: vec![0xFF; layout.pages_per_block as usize * layout.bytes_per_page],
            page_size: layout.bytes_per_page,
            start_page: 0,
        }
    }

    /// Refill from the image: pages before `start_page` are padding, then `len` bytes of image
    /// data, then padding up to the end of the block.
    pub fn fill<R: Read>(
        &mut self,
        feed: &mut ImageFeed<R>,
        start_page: u32,
        len: usize,
    ) -> Result<()> {
        let begin = start_page as usize * self.page_size;
        let end = begin + len;
        assert!(end <= self.data.len(), "BUG: image data overruns the block buffer");

        debug!("want {len} bytes at buffer offset {begin:#x}");
        self.start_page = start_page;
        self.data[..begin].fill(0xFF);
        self.data[end..].fill(0xFF);
        feed.read(&mut self.data[begin..end])
    }

    /// The first page holding image data
    pub fn start_page(&self) -> u32 {
        self.start_page
    }

    /// The content of one page
    pub fn page(&self, page: u32) -> &[u8] {
        &self.data[page as usize * self.page_size..][..self.page_size]
    }

    /// Number of whole pages at the end of the buffer that are entirely 0xFF
    pub fn trailing_erased_pages(&self) -> u32 {
        let pages = self
            .data
            .rchunks_exact(self.page_size)
            .take_while(|page| page.is_erased())
            .count() as u32;
        debug!("{pages} trailing erased pages");
        pages
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 4,
        pages_per_block: 4,
        bytes_per_page: 16,
        oob_bytes_per_page: 2,
    };

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn test_fill_pads_both_ends() -> anyhow::Result<()> {
        let source = image(64);
        let mut feed = ImageFeed::new(&source[..]);
        let mut buf = BlockBuffer::new(&TEST_LAYOUT);

        buf.fill(&mut feed, 1, 20)?;
        assert_eq!(buf.start_page(), 1);
        assert!(buf.page(0).is_erased());
        assert_eq!(&buf.as_slice()[16..36], &source[..20]);
        assert!(buf.as_slice()[36..].is_erased());
        assert_eq!(feed.consumed(), 20);

        // The next fill continues where the image left off, and clears old contents
        buf.fill(&mut feed, 0, 8)?;
        assert_eq!(&buf.as_slice()[..8], &source[20..28]);
        assert!(buf.as_slice()[8..].is_erased());
        Ok(())
    }

    #[test]
    fn test_fill_truncated_image() {
        let source = image(10);
        let mut feed = ImageFeed::new(&source[..]);
        let mut buf = BlockBuffer::new(&TEST_LAYOUT);

        let err = buf.fill(&mut feed, 0, 32).unwrap_err();
        assert!(matches!(err, Error::ImageTruncated { wanted: 32, got: 10 }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_trailing_erased_pages() -> anyhow::Result<()> {
        let mut buf = BlockBuffer::new(&TEST_LAYOUT);
        assert_eq!(buf.trailing_erased_pages(), 4);

        // A single non-FF byte in the last page means nothing can be skipped
        let mut source = vec![0xFF; 64];
        source[63] = 0xFE;
        buf.fill(&mut ImageFeed::new(&source[..]), 0, 64)?;
        assert_eq!(buf.trailing_erased_pages(), 0);

        // FF bytes from the image itself count just like padding
        let mut source = vec![0xFF; 40];
        source[17] = 0;
        buf.fill(&mut ImageFeed::new(&source[..]), 0, 40)?;
        assert_eq!(buf.trailing_erased_pages(), 2);

        // A partially-FF page is not skippable
        buf.fill(&mut ImageFeed::new(&image(33)[..]), 0, 33)?;
        assert_eq!(buf.trailing_erased_pages(), 1);
        Ok(())
    }
}
