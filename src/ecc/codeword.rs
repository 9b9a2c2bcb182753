//! Parity generation for a single 512-byte subpage.

use super::gf::{multiply, Element, GaloisField, PARITY_SYMBOLS};

/// Data bytes covered by one codeword
pub const SUBPAGE_SIZE: usize = 512;

/// Bytes of packed parity per subpage
pub const ECC_SIZE: usize = 10;

/// Coefficients in a full codeword: data plus parity
const CODEWORD_LEN: usize = SUBPAGE_SIZE + PARITY_SYMBOLS;

/// Bits in one field element, as stored on flash
const ELEMENT_BITS: u32 = 10;

/// Compute the 10 ECC bytes protecting `data`.
///
/// The subpage, last byte first, forms the high-order coefficients of a polynomial whose
/// `PARITY_SYMBOLS` low-order coefficients start out zero. Dividing by the generator polynomial
/// leaves the remainder in those low-order slots, which is the parity.
pub fn generate_subpage_ecc(field: &GaloisField, data: &[u8; SUBPAGE_SIZE]) -> [u8; ECC_SIZE] {
    let gp = field.generator();

    let mut poly: [Element; CODEWORD_LEN] = [0; CODEWORD_LEN];
    for (coeff, &byte) in poly[PARITY_SYMBOLS..].iter_mut().zip(data.iter().rev()) {
        *coeff = Element::from(byte);
    }

    // Long division
    for i in (PARITY_SYMBOLS..CODEWORD_LEN).rev() {
        let lead = poly[i];
        if lead == 0 {
            continue;
        }
        for j in 1..=PARITY_SYMBOLS {
            poly[i - j] ^= multiply(lead, gp[PARITY_SYMBOLS - j]);
        }
        poly[i] = 0;
    }

    pack_parity(&poly[..PARITY_SYMBOLS])
}

/// Pack 10-bit parity symbols into bytes: each run of four symbols becomes 40 bits, little-endian,
/// with the first symbol in the lowest bits.
fn pack_parity(parity: &[Element]) -> [u8; ECC_SIZE] {
    let mut ecc = [0; ECC_SIZE];

    for (out, group) in ecc.chunks_exact_mut(5).zip(parity.chunks_exact(4)) {
        let bits = group
            .iter()
            .rev()
            .fold(0u64, |acc, &symbol| (acc << ELEMENT_BITS) | u64::from(symbol & 0x3FF));
        out.copy_from_slice(&bits.to_le_bytes()[..5]);
    }

    ecc
}
