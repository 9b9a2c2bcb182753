//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{Nand, NandBlock, NandLayout};

use anyhow::{ensure, Context};

use std::fs::File;
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| path.display().to_string())?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr()).context("MEMGETINFO")?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.layout.blocks, "block {index} out of range");

        let block_base: u64 = self.layout.block_size() * u64::from(index);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base) }
            .context("MEMGETBADBLOCK")?;
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn set_raw_mode(&mut self) -> anyhow::Result<()> {
        unsafe {
            ioctl::mtdfilemode(self.file.as_raw_fd(), ioctl::MTD_FILE_MODE_RAW)
                .context("MTDFILEMODE")?;
        }
        tracing::debug!("set MTD_FILE_MODE_RAW");
        Ok(())
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    /// Ensure that the byte count and starting page range is valid, and compute the /dev/mtdX
    /// offset for the page
    fn offset_for(&self, start_page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let end_page = start_page + (bytes / self.page_size()) as u32;
        ensure!(
            end_page <= self.page_count(),
            "block {0}, page range {start_page}..{end_page} out of bounds",
            self.index
        );

        Ok(self.offset() + self.page_size() as u64 * u64::from(start_page))
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }
    fn offset(&self) -> u64 {
        self.nand.layout.block_size() * u64::from(self.index)
    }
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.write_all_at(content, offset)?)
    }
    fn program_oob(&mut self, page: u32, oob: &[u8]) -> anyhow::Result<()> {
        ensure!(
            oob.len() == self.nand.layout.oob_bytes_per_page,
            "buffer not OOB-sized"
        );
        let offset = self.offset_for(page, self.page_size())?;

        // The ioctl only reads through `ptr`, despite the mutable pointer type.
        let mut oob_buf = ioctl::mtd_oob_buf {
            start: offset.try_into()?,
            length: oob.len().try_into()?,
            ptr: oob.as_ptr().cast_mut(),
        };
        unsafe {
            ioctl::memwriteoob(self.nand.file.as_raw_fd(), &mut oob_buf).context("MEMWRITEOOB")?;
        }
        Ok(())
    }
    fn erase(&mut self) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: self.offset().try_into()?,
            length: self.nand.layout.block_size().try_into()?,
        };
        unsafe {
            ioctl::memerase(self.nand.file.as_raw_fd(), &erase_info).context("MEMERASE")?;
        }
        Ok(())
    }
    fn mark_bad(self) -> anyhow::Result<()> {
        let block_base: u64 = self.offset();
        unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &block_base)
                .context("MEMSETBADBLOCK")?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::libc::c_int;
    use nix::{
        ioctl_read, ioctl_readwrite, ioctl_write_int_bad, ioctl_write_ptr, request_code_none,
    };

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(
                self.erasesize != 0 && self.writesize != 0,
                "MTD reports zero-sized erase blocks or pages"
            );
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;
            let oob_bytes_per_page = self.oobsize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
                oob_bytes_per_page,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    #[repr(C)]
    pub struct mtd_oob_buf {
        pub start: u32,
        pub length: u32,
        pub ptr: *mut u8,
    }
    ioctl_readwrite!(memwriteoob, MTD_IOC_MAGIC, 3, mtd_oob_buf);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    /// `enum mtd_file_modes`: program pages without the driver's ECC
    pub const MTD_FILE_MODE_RAW: c_int = 3;
    ioctl_write_int_bad!(mtdfilemode, request_code_none!(MTD_IOC_MAGIC, 19));
}
