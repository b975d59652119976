use std::fmt;
use std::path::{Path, PathBuf};

use super::writer::{self, TagScope, TagSet};
use crate::error::Result;
use crate::pipeline::ImageKind;

/// The strategy that finally succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStep {
    FullTags,
    MinimalTags,
    TranscodedToJpeg,
    TimestampOnly,
}

impl fmt::Display for FallbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullTags => "full tags",
            Self::MinimalTags => "minimal tags",
            Self::TranscodedToJpeg => "transcoded to JPEG",
            Self::TimestampOnly => "file time only",
        };
        f.write_str(s)
    }
}

/// Result of [`write_metadata`]. The path may differ from the input after a
/// transcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { path: PathBuf, step: FallbackStep },
    Failed { path: PathBuf },
}

impl WriteOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Written { path, .. } | Self::Failed { path } => path,
        }
    }

    pub fn step(&self) -> Option<FallbackStep> {
        match self {
            Self::Written { step, .. } => Some(*step),
            Self::Failed { .. } => None,
        }
    }
}

/// The four write strategies, in fallback order.
///
/// [`ExifBackend`] is the real implementation; the trait exists so the chain
/// can be driven against a scripted backend.
pub trait TagBackend {
    fn write_full(&self, path: &Path, kind: ImageKind, tags: &TagSet) -> Result<()>;
    fn write_minimal(&self, path: &Path, kind: ImageKind, tags: &TagSet) -> Result<()>;
    fn transcode_to_jpeg(&self, path: &Path, tags: &TagSet) -> Result<PathBuf>;
    fn set_file_time(&self, path: &Path, tags: &TagSet) -> Result<()>;
}

/// little_exif + img-parts backed writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExifBackend;

impl TagBackend for ExifBackend {
    fn write_full(&self, path: &Path, kind: ImageKind, tags: &TagSet) -> Result<()> {
        writer::write_tags(path, kind, tags, TagScope::Full)
    }

    fn write_minimal(&self, path: &Path, kind: ImageKind, tags: &TagSet) -> Result<()> {
        writer::write_tags(path, kind, tags, TagScope::Minimal)
    }

    fn transcode_to_jpeg(&self, path: &Path, tags: &TagSet) -> Result<PathBuf> {
        writer::transcode_to_jpeg(path, tags)
    }

    fn set_file_time(&self, path: &Path, tags: &TagSet) -> Result<()> {
        writer::set_file_time(path, tags.utc)
    }
}

/// Write capture time and GPS into `path`, degrading until something sticks.
///
/// Never returns an error: every failure is logged and the next strategy is
/// tried. See [`write_metadata_with`].
pub fn write_metadata(path: &Path, tags: &TagSet) -> WriteOutcome {
    write_metadata_with(&ExifBackend, path, tags)
}

/// Run the fallback chain against a specific backend:
///
/// 1. full tag set merged into existing EXIF
/// 2. minimal tag set in a fresh EXIF block
/// 3. transcode to JPEG and write the full set there
/// 4. file modification time only
pub fn write_metadata_with<B: TagBackend + ?Sized>(
    backend: &B,
    path: &Path,
    tags: &TagSet,
) -> WriteOutcome {
    let written = |path: &Path, step| {
        log::debug!("Metadata for {} written ({step})", path.display());
        WriteOutcome::Written {
            path: path.to_path_buf(),
            step,
        }
    };

    match ImageKind::detect(path).or_else(|| ImageKind::from_path(path)) {
        Some(kind) => {
            match backend.write_full(path, kind, tags) {
                Ok(()) => return written(path, FallbackStep::FullTags),
                Err(e) => log::debug!("Full tag write failed for {}: {e}", path.display()),
            }
            match backend.write_minimal(path, kind, tags) {
                Ok(()) => return written(path, FallbackStep::MinimalTags),
                Err(e) => log::debug!("Minimal tag write failed for {}: {e}", path.display()),
            }
        }
        None => log::debug!("{} is not a taggable format", path.display()),
    }

    match backend.transcode_to_jpeg(path, tags) {
        Ok(new_path) => {
            log::info!(
                "Converted {} to JPEG to hold metadata",
                path.file_name().unwrap_or_default().to_string_lossy()
            );
            return written(&new_path, FallbackStep::TranscodedToJpeg);
        }
        Err(e) => log::debug!("Transcode failed for {}: {e}", path.display()),
    }

    match backend.set_file_time(path, tags) {
        Ok(()) => {
            log::warn!(
                "Only the file time could be set for {}",
                path.display()
            );
            written(path, FallbackStep::TimestampOnly)
        }
        Err(e) => {
            log::error!("Could not write any metadata to {}: {e}", path.display());
            WriteOutcome::Failed {
                path: path.to_path_buf(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use crate::exif::read_exif;
    use chrono::{DateTime, TimeZone, Utc};
    use std::cell::RefCell;
    use tempfile::TempDir;

    fn tags() -> TagSet {
        let utc = Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap();
        TagSet {
            local: utc.naive_utc() - chrono::Duration::hours(4),
            utc,
            gps: None,
        }
    }

    /// Backend that fails the first `fail_count` strategies and records calls.
    struct Scripted {
        fail_count: usize,
        calls: RefCell<Vec<&'static str>>,
    }

    impl Scripted {
        fn new(fail_count: usize) -> Self {
            Self {
                fail_count,
                calls: RefCell::new(Vec::new()),
            }
        }

        fn step(&self, name: &'static str) -> Result<()> {
            let mut calls = self.calls.borrow_mut();
            calls.push(name);
            if calls.len() <= self.fail_count {
                Err(ExportError::MetadataWrite(format!("{name} refused")))
            } else {
                Ok(())
            }
        }
    }

    impl TagBackend for Scripted {
        fn write_full(&self, _: &Path, _: ImageKind, _: &TagSet) -> Result<()> {
            self.step("full")
        }
        fn write_minimal(&self, _: &Path, _: ImageKind, _: &TagSet) -> Result<()> {
            self.step("minimal")
        }
        fn transcode_to_jpeg(&self, path: &Path, _: &TagSet) -> Result<PathBuf> {
            self.step("transcode")?;
            Ok(path.with_extension("jpg"))
        }
        fn set_file_time(&self, _: &Path, _: &TagSet) -> Result<()> {
            self.step("timestamp")
        }
    }

    fn unsupported(what: &str) -> ExportError {
        ExportError::MetadataWrite(format!("{what} not supported"))
    }

    /// Real backend whose EXIF writes always fail.
    struct NoExif;

    impl TagBackend for NoExif {
        fn write_full(&self, _: &Path, _: ImageKind, _: &TagSet) -> Result<()> {
            Err(unsupported("EXIF"))
        }
        fn write_minimal(&self, _: &Path, _: ImageKind, _: &TagSet) -> Result<()> {
            Err(unsupported("EXIF"))
        }
        fn transcode_to_jpeg(&self, path: &Path, tags: &TagSet) -> Result<PathBuf> {
            ExifBackend.transcode_to_jpeg(path, tags)
        }
        fn set_file_time(&self, path: &Path, tags: &TagSet) -> Result<()> {
            ExifBackend.set_file_time(path, tags)
        }
    }

    // ── chain order ──────────────────────────────────────────────────

    #[test]
    fn first_success_wins() {
        let backend = Scripted::new(0);
        let out = write_metadata_with(&backend, Path::new("a.jpg"), &tags());
        assert_eq!(out.step(), Some(FallbackStep::FullTags));
        assert_eq!(*backend.calls.borrow(), ["full"]);
    }

    #[test]
    fn minimal_is_tried_before_transcoding() {
        let backend = Scripted::new(1);
        let out = write_metadata_with(&backend, Path::new("a.webp"), &tags());
        assert_eq!(out.step(), Some(FallbackStep::MinimalTags));
        assert_eq!(out.path(), Path::new("a.webp"));
        assert_eq!(*backend.calls.borrow(), ["full", "minimal"]);
    }

    #[test]
    fn transcode_changes_the_path() {
        let backend = Scripted::new(2);
        let out = write_metadata_with(&backend, Path::new("dir/a.webp"), &tags());
        assert_eq!(
            out,
            WriteOutcome::Written {
                path: PathBuf::from("dir/a.jpg"),
                step: FallbackStep::TranscodedToJpeg
            }
        );
        assert_eq!(*backend.calls.borrow(), ["full", "minimal", "transcode"]);
    }

    #[test]
    fn all_strategies_failing_is_reported_not_raised() {
        let backend = Scripted::new(4);
        let out = write_metadata_with(&backend, Path::new("a.webp"), &tags());
        assert_eq!(out, WriteOutcome::Failed { path: PathBuf::from("a.webp") });
        assert_eq!(
            *backend.calls.borrow(),
            ["full", "minimal", "transcode", "timestamp"]
        );
    }

    #[test]
    fn unknown_format_skips_tag_strategies() {
        let backend = Scripted::new(0);
        let out = write_metadata_with(&backend, Path::new("a.gif"), &tags());
        assert_eq!(out.step(), Some(FallbackStep::TranscodedToJpeg));
        assert_eq!(*backend.calls.borrow(), ["transcode"]);
    }

    // ── real files ───────────────────────────────────────────────────

    #[test]
    fn jpeg_gets_full_tags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jpg");
        image::RgbImage::new(8, 8)
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .unwrap();

        let out = write_metadata(&path, &tags());
        assert_eq!(out.step(), Some(FallbackStep::FullTags));
        assert_eq!(read_exif(&path).unwrap().date_time_original, Some(tags().local));
    }

    #[test]
    fn webp_gets_exif_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.webp");
        image::RgbaImage::new(8, 8)
            .save_with_format(&path, image::ImageFormat::WebP)
            .unwrap();

        let out = write_metadata(&path, &tags());
        assert!(matches!(
            out.step(),
            Some(FallbackStep::FullTags | FallbackStep::MinimalTags)
        ));
        let bytes = std::fs::read(&path).unwrap();
        let tiff = crate::exif::webp::exif_payload(&bytes).unwrap();
        assert!(tiff.windows(19).any(|w| w == b"2023:06:15 08:00:00"));
    }

    #[test]
    fn exif_failure_falls_back_to_jpeg() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.webp");
        image::RgbaImage::new(8, 8)
            .save_with_format(&path, image::ImageFormat::WebP)
            .unwrap();

        let out = write_metadata_with(&NoExif, &path, &tags());
        assert_eq!(out.step(), Some(FallbackStep::TranscodedToJpeg));
        assert_eq!(out.path(), dir.path().join("a.jpg"));
        assert!(!path.exists());
    }

    #[test]
    fn undecodable_file_gets_file_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.webp");
        std::fs::write(&path, b"RIFF\0\0\0\0WEBPjunk").unwrap();

        let out = write_metadata(&path, &tags());
        assert_eq!(out.step(), Some(FallbackStep::TimestampOnly));
        assert!(path.exists());
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(DateTime::<Utc>::from(modified), tags().utc);
    }
}
