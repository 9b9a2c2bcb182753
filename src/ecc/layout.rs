//! Placement of data and ECC within a raw (data + OOB) page.
//!
//! Both layouts protect each 512-byte subpage with 10 ECC bytes, preceded by 6 bytes of 0xFF in
//! the OOB. They differ in where those 16-byte OOB chunks physically live:
//!
//! ```text
//! Legacy:     | data 0 | oob 0 | data 1 | oob 1 | data 2 | oob 2 | data 3 | oob 3 |
//! DM365 RBL:  | data 0 | data 1 | data 2 | data 3 | oob 0 | oob 1 | oob 2 | oob 3 |
//! ```
//!
//! Either way, the first [PAGE_DATA_SIZE] bytes of the raw page are programmed as the page and the
//! remaining [OOB_SIZE] bytes as its OOB.

use super::codeword::{ECC_SIZE, SUBPAGE_SIZE};
use super::EccEncoder;

/// In-band bytes per page; the only page size supported
pub const PAGE_DATA_SIZE: usize = 2048;

/// Out-of-band bytes per page; the only OOB size supported
pub const OOB_SIZE: usize = 64;

/// A page as it is laid out on the medium
pub const RAW_PAGE_SIZE: usize = PAGE_DATA_SIZE + OOB_SIZE;

const SUBPAGES: usize = PAGE_DATA_SIZE / SUBPAGE_SIZE;
const OOB_CHUNK_SIZE: usize = OOB_SIZE / SUBPAGES;
const OOB_SPARE_SIZE: usize = OOB_CHUNK_SIZE - ECC_SIZE;

/// The OOB layouts understood by the boot loaders of the DaVinci family
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OobLayout {
    /// Each subpage is immediately followed by its OOB chunk
    Legacy,

    /// All data first, then all OOB chunks, as the DM365 ROM boot loader expects
    Dm365Rbl,
}

impl TryFrom<u8> for OobLayout {
    type Error = anyhow::Error;

    /// Convert from the numeric layout selectors used by the TI flash utilities
    fn try_from(value: u8) -> anyhow::Result<Self> {
        match value {
            1 => Ok(Self::Legacy),
            2 => Ok(Self::Dm365Rbl),
            _ => anyhow::bail!("BUG: bad layout value {value}"),
        }
    }
}

impl EccEncoder {
    /// Lay out one page of data together with its ECC.
    pub fn encode_page(
        &self,
        data: &[u8; PAGE_DATA_SIZE],
        layout: OobLayout,
    ) -> [u8; RAW_PAGE_SIZE] {
        let mut raw = [0xFF; RAW_PAGE_SIZE];

        match layout {
            OobLayout::Legacy => {
                let stride = SUBPAGE_SIZE + OOB_CHUNK_SIZE;
                for (chunk, subpage) in raw
                    .chunks_exact_mut(stride)
                    .zip(data.chunks_exact(SUBPAGE_SIZE))
                {
                    let (chunk_data, oob) = chunk.split_at_mut(SUBPAGE_SIZE);
                    chunk_data.copy_from_slice(subpage);
                    self.fill_oob_chunk(oob, subpage);
                }
            }

            OobLayout::Dm365Rbl => {
                let (page, oob) = raw.split_at_mut(PAGE_DATA_SIZE);
                page.copy_from_slice(data);
                for (oob_chunk, subpage) in oob
                    .chunks_exact_mut(OOB_CHUNK_SIZE)
                    .zip(data.chunks_exact(SUBPAGE_SIZE))
                {
                    self.fill_oob_chunk(oob_chunk, subpage);
                }
            }
        }

        raw
    }

    /// Write one 16-byte OOB chunk: the spare bytes stay 0xFF, the rest is the subpage's ECC
    fn fill_oob_chunk(&self, oob: &mut [u8], subpage: &[u8]) {
        let subpage: &[u8; SUBPAGE_SIZE] = subpage
            .try_into()
            .expect("subpages are split with chunks_exact");
        oob[..OOB_SPARE_SIZE].fill(0xFF);
        oob[OOB_SPARE_SIZE..].copy_from_slice(&self.subpage_ecc(subpage));
    }
}
