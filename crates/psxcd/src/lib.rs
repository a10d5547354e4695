//! # PSX CD-ROM sector layer
//!
//! Low-level support for PlayStation-style disc images: Mode 2 Form 1/2
//! sector encoding with EDC/ECC checksums, a memory-mapped image writer with
//! streaming per-range sector views, and an ISO 9660 / CD-XA image reader.
//!
//! ## Example
//!
//! ```no_run
//! use psxcd::{EdcEccForm, ImageWriter, WriterOptions, SUBHEADER_DATA};
//!
//! let mut writer = ImageWriter::create("out.bin", 32, WriterOptions::default())?;
//! let mut view = writer.view_m2f1(18, 1, EdcEccForm::Form1);
//! view.set_subheader(SUBHEADER_DATA);
//! view.write_memory(b"hello");
//! view.finish();
//! # Ok::<(), psxcd::CdError>(())
//! ```

pub mod codec;
pub mod msf;
pub mod reader;
pub mod writer;

pub use codec::SectorCodec;
pub use msf::Msf;
pub use reader::{
    DirRecord, ImageReader, InferredKind, PathTableEntry, VolumeDescriptor, XaAttributes, XaFlags,
};
pub use writer::{EdcEccForm, ImageWriter, RawSectorView, SectorView, WriterOptions};

/// Raw sector size in bytes.
pub const SECTOR_SIZE: usize = 2352;

/// User data per Mode 2 Form 1 sector.
pub const FORM1_DATA_SIZE: usize = 2048;

/// User data per Mode 2 Form 2 sector (excluding the subheader).
pub const FORM2_DATA_SIZE: usize = 2324;

/// Subheader + user data + EDC region of a Form 2 sector.
pub const FORM2_PAYLOAD_SIZE: usize = 2336;

/// Sector addresses on a disc start 150 sectors (two seconds) before LBA 0.
pub const PREGAP_SECTORS: u32 = 150;

/// Logical subheader for plain data sectors (submode `Data`).
pub const SUBHEADER_DATA: u32 = 0x0008_0000;

/// Logical subheader for data-only STR sectors (channel 1, `Data | RealTime`).
pub const SUBHEADER_STR: u32 = 0x0048_0100;

/// Logical subheader marking the end of a logical record (`Data | EOR`).
pub const SUBHEADER_EOL: u32 = 0x0009_0000;

/// Logical subheader marking the final sector of a file (`Data | EOF`).
pub const SUBHEADER_EOF: u32 = 0x0089_0000;

/// Logical subheader with only the Form 2 submode flag set.
pub const SUBHEADER_FORM2: u32 = 0x0020_0000;

/// Common error type for psxcd
#[derive(Debug, thiserror::Error)]
pub enum CdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image is not sector aligned: {0} bytes")]
    NotSectorAligned(u64),

    #[error("sector {0} is out of image bounds")]
    SectorOutOfBounds(u32),

    #[error("invalid ISO 9660 descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Common result type for psxcd
pub type Result<T> = std::result::Result<T, CdError>;
