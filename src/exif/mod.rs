//! Capture-time and GPS metadata reading and writing.
//!
//! - [`write_metadata`]: embed capture time and GPS, degrading through the
//!   fallback chain until something sticks (never fails the caller)
//! - [`read_exif`]: read the tags back from an exported JPEG or WebP
//!
//! JPEG gets `DateTimeOriginal`, `CreateDate`, `ModifyDate` and GPS. WebP gets
//! `DateTimeOriginal` and GPS in an `EXIF` chunk, upgrading simple files to the
//! extended `VP8X` layout first.

mod fallback;
mod reader;
mod webp;
mod writer;

pub use fallback::{
    ExifBackend, FallbackStep, TagBackend, WriteOutcome, write_metadata, write_metadata_with,
};
pub use reader::{ExifData, read_exif};
pub use writer::{TagScope, TagSet, build_tags, set_file_time, transcode_to_jpeg, write_tags};
