//! Arithmetic over GF(2^10), the field underlying the NAND ECC.
//!
//! Field elements are 10-bit binary polynomials, stored in a `u16`. Addition and subtraction are
//! both XOR; multiplication is carry-less, reduced modulo [FIELD_POLY].

/// Number of elements in the field
pub const FIELD_ORDER: usize = 1 << 10;

/// Order of the multiplicative group: `alpha(i)` repeats with this period
const CYCLE: usize = FIELD_ORDER - 1;

/// The irreducible polynomial defining the field: x^10 + x^3 + 1
const FIELD_POLY: u32 = 0x409;

/// The element whose powers fill the `alpha` table
const PRIMITIVE_ELEMENT: Element = 2;

/// The maximum number of symbol errors correctable per subpage
pub const MAX_CORRECTABLE: usize = 4;

/// Number of parity symbols per subpage
pub const PARITY_SYMBOLS: usize = 2 * MAX_CORRECTABLE;

/// A single field element; only the low 10 bits are ever set
pub type Element = u16;

/// Index of the highest set bit, or 0 for both 0 and 1
fn order(x: u32) -> u32 {
    x.checked_ilog2().unwrap_or(0)
}

/// Reduce `x` modulo `y`, treating both as binary polynomials
fn modulo(mut x: u32, y: u32) -> u32 {
    let ord_y = order(y);
    for bit in (ord_y..=order(x)).rev() {
        if x & (1 << bit) != 0 {
            x ^= y << (bit - ord_y);
        }
    }
    x
}

/// Multiply two field elements.
///
/// Only the low 16 bits of `x` take part in the product, which is more than any element uses.
pub fn multiply(x: Element, y: Element) -> Element {
    let y = u32::from(y);
    let product = (0..16)
        .filter(|bit| x & (1 << bit) != 0)
        .fold(0u32, |acc, bit| acc ^ (y << bit));

    // The remainder has a lower degree than FIELD_POLY, so it fits in 10 bits.
    modulo(product, FIELD_POLY) as Element
}

/// The power and log tables of the field, plus the generator polynomial of the code built on it.
///
/// Construction is deterministic; the tables never change afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct GaloisField {
    alpha: [Element; FIELD_ORDER],
    log: [u16; FIELD_ORDER],
    generator: [Element; PARITY_SYMBOLS + 1],
}

impl GaloisField {
    pub fn new() -> Self {
        let mut alpha = [0; FIELD_ORDER];
        let mut log = [0; FIELD_ORDER];

        alpha[0] = 1;
        for i in 1..FIELD_ORDER {
            alpha[i] = multiply(alpha[i - 1], PRIMITIVE_ELEMENT);
        }
        for (i, &element) in alpha.iter().enumerate().take(CYCLE) {
            log[usize::from(element)] = i as u16;
        }

        let mut field = Self {
            alpha,
            log,
            generator: [0; PARITY_SYMBOLS + 1],
        };
        field.generator = field.build_generator();
        field
    }

    /// Expand the product of `(x - alpha^i)` for i in 1..=PARITY_SYMBOLS.
    ///
    /// Coefficients are stored lowest degree first; the leading coefficient is 1.
    fn build_generator(&self) -> [Element; PARITY_SYMBOLS + 1] {
        let mut gp = [0; PARITY_SYMBOLS + 1];

        gp[0] = 1;
        for i in 1..=PARITY_SYMBOLS {
            gp[i] = 1;
            for j in (1..i).rev() {
                gp[j] = gp[j - 1] ^ multiply(self.alpha(i), gp[j]);
            }
            // alpha^1 * alpha^2 * ... * alpha^i
            gp[0] = self.alpha(i * (i + 1) / 2);
        }

        gp
    }

    /// `alpha^i`, for any `i`
    pub fn alpha(&self, i: usize) -> Element {
        self.alpha[i % CYCLE]
    }

    /// The discrete logarithm of `element`, i.e. the `i` in `0..1023` with `alpha(i) == element`.
    ///
    /// # Panics
    ///
    /// Zero has no logarithm, and values past the field order are not elements. Asking for either
    /// is a bug in the caller.
    pub fn log(&self, element: Element) -> usize {
        assert!(
            element != 0 && usize::from(element) < FIELD_ORDER,
            "BUG: log of {element:#x} is undefined in GF(2^10)"
        );
        usize::from(self.log[usize::from(element)])
    }

    /// The generator polynomial, lowest degree coefficient first
    pub fn generator(&self) -> &[Element; PARITY_SYMBOLS + 1] {
        &self.generator
    }
}

impl Default for GaloisField {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GaloisField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The tables are 4 KiB each; only the generator is interesting to look at.
        f.debug_struct("GaloisField")
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}
