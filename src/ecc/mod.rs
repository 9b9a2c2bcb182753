//! Software generation of the 4-bit Reed-Solomon ECC used by TI DaVinci NAND controllers.
//!
//! The ROM boot loader (and older TI flashing utilities) expect this ECC in the OOB area, but the
//! in-kernel driver can't always produce it in the required layout, so we compute it here and
//! program pages in raw mode.

pub mod codeword;
pub mod gf;
pub mod layout;

pub use codeword::{ECC_SIZE, SUBPAGE_SIZE};
pub use layout::{OobLayout, OOB_SIZE, PAGE_DATA_SIZE, RAW_PAGE_SIZE};

use codeword::generate_subpage_ecc;
use gf::GaloisField;

/// Produces ECC for subpages and whole pages.
///
/// This owns the field tables, so build one and reuse it for the whole session.
#[derive(Debug, Default)]
pub struct EccEncoder {
    field: GaloisField,
}

impl EccEncoder {
    pub fn new() -> Self {
        Self {
            field: GaloisField::new(),
        }
    }

    /// ECC bytes for one 512-byte subpage
    pub fn subpage_ecc(&self, data: &[u8; SUBPAGE_SIZE]) -> [u8; ECC_SIZE] {
        generate_subpage_ecc(&self.field, data)
    }
}
