//! # PSX ISO filesystem generator and extractor
//!
//! Builds PlayStation `.bin`/`.cue` disc images from a declarative project
//! description, and disassembles existing images back into loose files plus a
//! project sufficient to rebuild a byte-identical copy.
//!
//! The heavy lifting for raw sectors (EDC/ECC, memory-mapped output, image
//! reading) lives in the [`psxcd`] crate; this crate owns the ISO 9660
//! filesystem model, the layout planner, the volume and directory-record
//! writers, payload packing, cue sheets and the project frontend.
//!
//! ## Example
//!
//! ```no_run
//! use psxiso::{build, project::Project, BuildOptions};
//!
//! let text = std::fs::read_to_string("game.json")?;
//! let project = Project::from_json(&text)?;
//! build::build(&project, &BuildOptions::default())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod attr;
pub mod build;
pub mod cue;
pub mod datestamp;
pub mod extract;
pub mod layout;
pub mod model;
pub mod pack;
pub mod project;
pub mod records;
pub mod volume;

use std::path::PathBuf;

pub use build::BuildOptions;
pub use datestamp::IsoDate;
pub use model::{DirTree, Entry, EntryId, EntryKind};

/// Common error type for psxiso
#[derive(Debug, thiserror::Error)]
pub enum IsoError {
    #[error("source file not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("source file {path} has an invalid size: {reason}")]
    SourceSizeInvalid { path: PathBuf, reason: String },

    #[error("duplicate identifier in directory: {0}")]
    DuplicateIdentifier(String),

    #[error("identifier too long (over 31 characters): {0}")]
    IdentifierTooLong(String),

    #[error("directory nesting deeper than 8 levels at {0}")]
    PathTooDeep(String),

    #[error("full path longer than 255 bytes: {0}")]
    PathTooLong(String),

    #[error("audio tracks require a cue sheet")]
    NoCueForAudioTrack,

    #[error("no audio track resolves trackid {0:?}")]
    UnresolvedTrack(String),

    #[error("output image already exists: {0}")]
    ImageExists(PathBuf),

    #[error("I/O error: {0}")]
    OutputIo(#[from] std::io::Error),

    #[error("malformed project: {0}")]
    MalformedProject(String),

    #[error("audio decode failed: {0}")]
    DecoderFailure(#[from] hound::Error),

    #[error("image is truncated or not a Mode 2 disc image")]
    ImageTruncated,

    #[error(transparent)]
    Cd(#[from] psxcd::CdError),
}

/// Common result type for psxiso
pub type Result<T> = std::result::Result<T, IsoError>;
