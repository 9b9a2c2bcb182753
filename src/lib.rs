//! Erase and write raw NAND flash through Linux MTD, with optional software-generated
//! Reed-Solomon ECC in the OOB area, in the layouts expected by TI DaVinci boot ROMs.

pub mod ecc;
pub mod error;
pub mod flash;
pub mod image;
pub mod nand;
pub mod util;

pub use error::{Error, Result};
