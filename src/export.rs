use std::path::{Path, PathBuf};

use crate::error::ExportError;
use crate::exif::{TagSet, write_metadata};
use crate::pipeline::ImageKind;

/// Archive sub-folders searched, in order, when a record path does not
/// resolve directly.
const SOURCE_FOLDERS: &[&str] = &["Photos/post", "Photos/bereal", "Photos/realmoji"];

/// A file now present in the output tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedImage {
    /// Final path. Its extension matches the encoded format whenever the
    /// format could be detected.
    pub path: PathBuf,
    pub detected_format: Option<ImageKind>,
}

/// What happened to one requested output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Exported(ExportedImage),
    /// Output already present from an earlier run.
    Skipped(PathBuf),
    /// Source image missing from the archive.
    NotFound(String),
    Failed(PathBuf),
}

impl ExportOutcome {
    /// Path of the output file, if one exists after this step.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Exported(img) => Some(&img.path),
            Self::Skipped(path) => Some(path),
            Self::NotFound(_) | Self::Failed(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Resolve a record's image path against the archive root.
///
/// Tries the path as given, then relative to the root, then by file name in
/// each of the known photo folders.
pub fn locate_source(root: &Path, raw: &str) -> Option<PathBuf> {
    let literal = Path::new(raw);
    if literal.is_file() {
        return Some(literal.to_path_buf());
    }

    let relative = root.join(raw.trim_start_matches('/'));
    if relative.is_file() {
        return Some(relative);
    }

    let name = literal.file_name()?;
    SOURCE_FOLDERS
        .iter()
        .map(|folder| root.join(folder).join(name))
        .find(|candidate| candidate.is_file())
}

/// The output file if it exists, under its own extension or the other
/// supported one.
pub fn existing_output(dest: &Path) -> Option<PathBuf> {
    if dest.exists() {
        return Some(dest.to_path_buf());
    }
    let kind = ImageKind::from_path(dest)?;
    let sibling = dest.with_extension(kind.other().extension());
    sibling.exists().then_some(sibling)
}

/// Copy one archive image to `dest`, fix its extension and tag it.
///
/// Never fails the caller; problems are logged and reported in the outcome.
pub fn export_image(root: &Path, source: &str, dest: &Path, tags: &TagSet) -> ExportOutcome {
    if let Some(existing) = existing_output(dest) {
        log::debug!("Already exported, skipping: {}", existing.display());
        return ExportOutcome::Skipped(existing);
    }

    let Some(src) = locate_source(root, source) else {
        log::warn!("{}", ExportError::NotFound(PathBuf::from(source)));
        return ExportOutcome::NotFound(source.to_string());
    };

    log::debug!("Exporting {} to {}", src.display(), dest.display());
    match tags.gps {
        Some(gps) => log::debug!("Location data available: {}, {}", gps.latitude, gps.longitude),
        None => log::debug!("No location data for {}", dest.display()),
    }

    if let Some(parent) = dest.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            log::error!("Could not create {}: {e}", parent.display());
            return ExportOutcome::Failed(dest.to_path_buf());
        }
    }
    if let Err(e) = std::fs::copy(&src, dest) {
        log::error!("Could not copy {} to {}: {e}", src.display(), dest.display());
        return ExportOutcome::Failed(dest.to_path_buf());
    }

    let detected = ImageKind::detect(dest);
    let mut path = dest.to_path_buf();
    match detected {
        Some(kind) if ImageKind::from_path(dest) != Some(kind) => {
            let corrected = dest.with_extension(kind.extension());
            log::debug!(
                "{} is actually {kind:?}, renaming to {}",
                dest.display(),
                corrected.display()
            );
            if let Err(e) = std::fs::rename(dest, &corrected) {
                log::error!("Could not rename {}: {e}", dest.display());
                return ExportOutcome::Failed(dest.to_path_buf());
            }
            path = corrected;
        }
        Some(_) => {}
        None => log::warn!("Could not detect image format of {}", dest.display()),
    }

    let outcome = write_metadata(&path, tags);
    let path = outcome.path().to_path_buf();
    ExportOutcome::Exported(ExportedImage {
        detected_format: ImageKind::from_path(&path).filter(|_| detected.is_some()),
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exif::read_exif;
    use chrono::{TimeZone, Utc};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    fn tags() -> TagSet {
        let utc = Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap();
        TagSet {
            local: utc.naive_utc() - chrono::Duration::hours(4),
            utc,
            gps: None,
        }
    }

    fn save(path: &Path, format: ImageFormat) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(16, 12, Rgb([9, 99, 199]))
            .save_with_format(path, format)
            .unwrap();
    }

    // ── locate_source ────────────────────────────────────────────────

    #[test]
    fn locate_relative_to_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Photos/abc/post/x.webp");
        save(&file, ImageFormat::WebP);

        assert_eq!(
            locate_source(dir.path(), "/Photos/abc/post/x.webp"),
            Some(file.clone())
        );
        assert_eq!(locate_source(dir.path(), "Photos/abc/post/x.webp"), Some(file));
    }

    #[test]
    fn locate_falls_back_to_known_folders() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Photos/bereal/y.webp");
        save(&file, ImageFormat::WebP);

        assert_eq!(
            locate_source(dir.path(), "/Photos/someuser/bereal/y.webp"),
            Some(file)
        );
        assert_eq!(locate_source(dir.path(), "nowhere/z.webp"), None);
    }

    // ── existing_output ──────────────────────────────────────────────

    #[test]
    fn sibling_extension_counts_as_existing() {
        let dir = TempDir::new().unwrap();
        let webp = dir.path().join("a.webp");
        assert_eq!(existing_output(&webp), None);

        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        assert_eq!(existing_output(&webp), Some(dir.path().join("a.jpg")));
    }

    // ── export_image ─────────────────────────────────────────────────

    #[test]
    fn jpeg_behind_webp_name_is_renamed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("archive");
        save(&root.join("Photos/post/p.webp"), ImageFormat::Jpeg);
        let dest = dir.path().join("out/2023-06-15_08-00-00_main-view.webp");

        let outcome = export_image(&root, "Photos/post/p.webp", &dest, &tags());

        let ExportOutcome::Exported(img) = outcome else {
            panic!("expected export, got {outcome:?}");
        };
        assert_eq!(img.path, dir.path().join("out/2023-06-15_08-00-00_main-view.jpg"));
        assert_eq!(img.detected_format, Some(ImageKind::Jpeg));
        assert!(!dest.exists());
        assert_eq!(read_exif(&img.path).unwrap().date_time_original, Some(tags().local));
    }

    #[test]
    fn webp_keeps_its_name() {
        let dir = TempDir::new().unwrap();
        save(&dir.path().join("Photos/post/p.webp"), ImageFormat::WebP);
        let dest = dir.path().join("out/x.webp");

        let outcome = export_image(dir.path(), "Photos/post/p.webp", &dest, &tags());
        assert_eq!(outcome.path(), Some(dest.as_path()));
        assert_eq!(ImageKind::detect(&dest), Some(ImageKind::WebP));
    }

    #[test]
    fn rerun_is_a_noop() {
        let dir = TempDir::new().unwrap();
        save(&dir.path().join("Photos/post/p.webp"), ImageFormat::Jpeg);
        let dest = dir.path().join("out/x.webp");

        let first = export_image(dir.path(), "Photos/post/p.webp", &dest, &tags());
        let written = first.path().unwrap().to_path_buf();
        let bytes = fs::read(&written).unwrap();

        let second = export_image(dir.path(), "Photos/post/p.webp", &dest, &tags());
        assert_eq!(second, ExportOutcome::Skipped(written.clone()));
        assert_eq!(fs::read(&written).unwrap(), bytes);
    }

    #[test]
    fn missing_source_produces_nothing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out/x.webp");
        let outcome = export_image(dir.path(), "Photos/post/gone.webp", &dest, &tags());
        assert_eq!(outcome, ExportOutcome::NotFound("Photos/post/gone.webp".into()));
        assert!(!dest.exists());
        assert!(!dir.path().join("out").exists());
    }
}
