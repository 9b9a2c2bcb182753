//! The ways a flashing run can end early, and the exit codes they map to.

use std::io;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A bad block was found, or a block went bad, while bad blocks are not tolerated
    #[error("bad block at {offset:#x}")]
    BadBlock { offset: u64 },

    /// The request does not fit below the device size or max offset, either from the outset or
    /// because bad blocks used up the slack
    #[error("{0}")]
    NoSpace(&'static str),

    /// The image ran out before the requested length was read
    #[error("unexpected EOF reading input file: wanted {wanted} bytes, got {got}")]
    ImageTruncated { wanted: usize, got: usize },

    /// The device or the request cannot be handled as configured
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl Error {
    /// The process exit status to report for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::BadBlock { .. } => 2,
            Error::NoSpace(_) => 3,
            Error::ImageTruncated { .. }
            | Error::Config(_)
            | Error::Io(_)
            | Error::Fatal(_) => 1,
        }
    }
}

#[test]
fn test_exit_codes() {
    assert_eq!(Error::BadBlock { offset: 0x20000 }.exit_code(), 2);
    assert_eq!(Error::NoSpace("full").exit_code(), 3);
    assert_eq!(Error::ImageTruncated { wanted: 2, got: 1 }.exit_code(), 1);
    assert_eq!(Error::from(anyhow::anyhow!("boom")).exit_code(), 1);
    assert_eq!(Error::from(io::Error::other("boom")).exit_code(), 1);
    assert_eq!(
        Error::BadBlock { offset: 0x20000 }.to_string(),
        "bad block at 0x20000"
    );
}
