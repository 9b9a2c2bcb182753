//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Tries to fill `buf` completely, like `read_exact`, but unlike `read_exact`, is forgiving of
    /// unexpected EOF.
    ///
    /// Returns the number of bytes read, which is `buf.len()` unless an EOF was encountered.
    fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                // This is an EOF; it means the final read size is `cursor`
                Ok(0) => break,

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }
        Ok(cursor)
    }
}

/// Parse an integer the way `strtoull(s, NULL, 0)` would: "0x" prefix for hex, leading "0" for
/// octal, decimal otherwise.
pub fn parse_int(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let result = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8)
    } else {
        s.parse()
    };

    result.map_err(|e| anyhow::anyhow!("bad integer argument {s:?}: {e}"))
}

#[test]
fn test_read_up_to() -> io::Result<()> {
    let mut buf = [0u8; 4];
    assert_eq!(io::repeat(0xAA).read_up_to(&mut buf)?, 4);
    assert_eq!(buf, [0xAA; 4]);

    assert_eq!((&[1, 2, 3][..]).read_up_to(&mut buf)?, 3);
    assert_eq!(buf, [1, 2, 3, 0xAA]);

    // Short reads are stitched together
    let mut chained = (&[4u8][..]).chain(&[5u8, 6][..]);
    assert_eq!(chained.read_up_to(&mut buf[..3])?, 3);
    assert_eq!(buf, [4, 5, 6, 0xAA]);

    assert_eq!(io::empty().read_up_to(&mut buf)?, 0);
    Ok(())
}

#[test]
fn test_parse_int() {
    assert_eq!(parse_int("0").unwrap(), 0);
    assert_eq!(parse_int("2048").unwrap(), 2048);
    assert_eq!(parse_int("0x800").unwrap(), 0x800);
    assert_eq!(parse_int("0X20000").unwrap(), 0x20000);
    assert_eq!(parse_int("0400").unwrap(), 0o400);

    assert!(parse_int("").is_err());
    assert!(parse_int("0x").is_err());
    assert!(parse_int("12k").is_err());
    assert!(parse_int("09").is_err());
    assert!(parse_int("-1").is_err());
}
