use chrono::{DateTime, NaiveDateTime, Utc};
use img_parts::jpeg::Jpeg;
use img_parts::{Bytes, ImageEXIF};
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use little_exif::rational::uR64;
use std::panic::{self, AssertUnwindSafe};
use std::fs::{File, FileTimes};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::webp;
use crate::composite::{JPEG_QUALITY, encode_jpeg, flatten_on_white, open_image};
use crate::error::{ExportError, Result};
use crate::pipeline::ImageKind;
use crate::time::{CaptureTime, EXIF_DATETIME_FORMAT, Location};

// IFD0 pointer to the GPS IFD
const TAG_GPS_INFO: u16 = 0x8825;

// little_exif as_u8_vec(JPEG) returns: [APP1 marker 2B][length 2B][Exif\0\0 6B][TIFF data]
// img-parts set_exif() and the WebP EXIF chunk both take just the TIFF data
const JPEG_EXIF_OVERHEAD: usize = 10;

// Denominator for GPS seconds, 1/10000 arc-second
const GPS_SECONDS_SCALE: u32 = 10_000;

/// Metadata to embed for one exported file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TagSet {
    /// Local wall-clock capture time, written to the `DateTime*` tags.
    pub local: NaiveDateTime,
    /// Capture instant, used when only the file time can be set.
    pub utc: DateTime<Utc>,
    pub gps: Option<Location>,
}

impl TagSet {
    pub fn new(capture: &CaptureTime, gps: Option<Location>) -> Self {
        Self {
            local: capture.local,
            utc: capture.utc,
            gps: gps.filter(Location::is_valid),
        }
    }
}

/// Which tag subset to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScope {
    /// All date tags the format carries, merged into any existing EXIF.
    Full,
    /// `DateTimeOriginal` and GPS only, in a fresh EXIF block.
    Minimal,
}

/// Build the EXIF tags for a format and scope.
///
/// JPEG gets `DateTimeOriginal`, `CreateDate` and `ModifyDate`; WebP and the
/// minimal scope get `DateTimeOriginal` only. GPS is added whenever present.
pub fn build_tags(tags: &TagSet, kind: ImageKind, scope: TagScope) -> Vec<ExifTag> {
    let stamp = tags.local.format(EXIF_DATETIME_FORMAT).to_string();

    let mut out = vec![ExifTag::DateTimeOriginal(stamp.clone())];
    if scope == TagScope::Full && kind == ImageKind::Jpeg {
        out.push(ExifTag::CreateDate(stamp.clone()));
        out.push(ExifTag::ModifyDate(stamp));
    }

    if let Some(gps) = tags.gps {
        collect_gps_tags(&mut out, &gps);
    }

    out
}

/// Write capture time and GPS into `path` in place.
pub fn write_tags(path: &Path, kind: ImageKind, tags: &TagSet, scope: TagScope) -> Result<()> {
    let mut metadata = match scope {
        TagScope::Full => load_existing_metadata(path).unwrap_or_else(Metadata::new),
        TagScope::Minimal => Metadata::new(),
    };

    let new_tags = build_tags(tags, kind, scope);
    log::debug!(
        "Writing {} tags ({scope:?}) to {}",
        new_tags.len(),
        path.display()
    );
    for tag in new_tags {
        metadata.set_tag(tag);
    }

    let tiff = encode_tiff(&metadata)?;
    if tags.gps.is_some() && !has_gps_ifd(&tiff) {
        return Err(ExportError::MetadataWrite(
            "GPS tags missing from the encoded EXIF block".into(),
        ));
    }
    match kind {
        ImageKind::Jpeg => embed_in_jpeg(path, tiff),
        ImageKind::WebP => embed_in_webp(path, &tiff),
    }
}

/// Re-encode `path` as a JPEG next to it, tag it, and remove the original.
///
/// Alpha is flattened onto white. Returns the path of the new `.jpg`.
pub fn transcode_to_jpeg(path: &Path, tags: &TagSet) -> Result<PathBuf> {
    let img = open_image(path)?;
    let rgb = flatten_on_white(&img);
    let bytes = encode_jpeg(&rgb, JPEG_QUALITY)?;

    let target = path.with_extension(ImageKind::Jpeg.extension());
    std::fs::write(&target, bytes)?;
    let tagged = write_tags(&target, ImageKind::Jpeg, tags, TagScope::Full);
    if target == path {
        return tagged.map(|()| target);
    }

    discard_on_err(&target, tagged)?;
    std::fs::remove_file(path)?;
    Ok(target)
}

/// Remove a half-written `path` when `result` is an error.
fn discard_on_err<T>(path: &Path, result: Result<T>) -> Result<T> {
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(path) {
            log::debug!("Could not remove {}: {e}", path.display());
        }
    }
    result
}

/// Set the file modification time to the capture instant.
pub fn set_file_time(path: &Path, utc: DateTime<Utc>) -> Result<()> {
    let file = File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_modified(SystemTime::from(utc)))?;
    Ok(())
}

/// Load existing EXIF metadata from a file path using little_exif.
/// Returns None if it can't parse so the caller starts from a fresh block.
///
/// The panic hook is left alone: swapping it is process-global and races
/// with the worker pool.
fn load_existing_metadata(path: &Path) -> Option<Metadata> {
    match panic::catch_unwind(AssertUnwindSafe(|| Metadata::new_from_path(path))) {
        Ok(Ok(m)) => {
            log::debug!("little_exif loaded existing EXIF from {}", path.display());
            Some(m)
        }
        Ok(Err(e)) => {
            log::debug!("little_exif could not parse EXIF: {e:?}");
            None
        }
        Err(_) => {
            log::debug!("little_exif panicked parsing EXIF");
            None
        }
    }
}

/// Serialize metadata into bare TIFF data.
fn encode_tiff(metadata: &Metadata) -> Result<Vec<u8>> {
    let exif_bytes = metadata
        .as_u8_vec(FileExtension::JPEG)
        .map_err(|e| ExportError::MetadataWrite(format!("little_exif encode: {e:?}")))?;
    if exif_bytes.len() <= JPEG_EXIF_OVERHEAD {
        return Err(ExportError::MetadataWrite(
            "little_exif produced an empty EXIF block".into(),
        ));
    }
    Ok(exif_bytes[JPEG_EXIF_OVERHEAD..].to_vec())
}

/// Replace the EXIF segment of a JPEG, keeping every other segment.
fn embed_in_jpeg(path: &Path, tiff: Vec<u8>) -> Result<()> {
    let file_bytes = std::fs::read(path)?;
    let mut jpeg = Jpeg::from_bytes(Bytes::from(file_bytes))
        .map_err(|e| ExportError::MetadataWrite(format!("Failed to parse JPEG: {e}")))?;

    let orig_exif_pos = find_exif_segment_pos(&jpeg);
    jpeg.set_exif(Some(Bytes::from(tiff)));

    // set_exif() inserts at position 3; keep EXIF where it was, or right after APP0
    if let Some(new_pos) = find_exif_segment_pos(&jpeg) {
        let target_pos = orig_exif_pos.unwrap_or(1);
        if target_pos < new_pos {
            let segments = jpeg.segments_mut();
            let seg = segments.remove(new_pos);
            segments.insert(target_pos, seg);
        }
    }

    let output = jpeg.encoder().bytes();
    std::fs::write(path, &output)?;
    Ok(())
}

fn embed_in_webp(path: &Path, tiff: &[u8]) -> Result<()> {
    let file_bytes = std::fs::read(path)?;
    let output = webp::embed_exif(&file_bytes, tiff)?;
    std::fs::write(path, output)?;
    Ok(())
}

/// Find the position of the EXIF APP1 segment in a JPEG.
fn find_exif_segment_pos(jpeg: &Jpeg) -> Option<usize> {
    const EXIF_PREFIX: &[u8] = b"Exif\0\0";
    jpeg.segments()
        .iter()
        .position(|s| s.marker() == 0xE1 && s.contents().starts_with(EXIF_PREFIX))
}

/// Split a decimal coordinate into whole degrees, whole minutes and
/// seconds scaled by [`GPS_SECONDS_SCALE`].
fn to_dms(value: f64) -> (u32, u32, u32) {
    let abs = value.abs();
    let degrees = abs.floor();
    let minutes = ((abs - degrees) * 60.0).floor();
    let seconds = (abs - degrees - minutes / 60.0) * 3600.0;
    let scaled = (seconds * GPS_SECONDS_SCALE as f64).round().max(0.0) as u32;
    (degrees as u32, minutes as u32, scaled)
}

/// Degrees, minutes and seconds as the three EXIF rationals.
fn dms_rationals(value: f64) -> Vec<uR64> {
    let (degrees, minutes, seconds) = to_dms(value);
    vec![
        uR64 {
            nominator: degrees,
            denominator: 1,
        },
        uR64 {
            nominator: minutes,
            denominator: 1,
        },
        uR64 {
            nominator: seconds,
            denominator: GPS_SECONDS_SCALE,
        },
    ]
}

/// Collect GPS tags into the tag list.
fn collect_gps_tags(tags: &mut Vec<ExifTag>, gps: &Location) {
    let lat_ref = if gps.latitude >= 0.0 { "N" } else { "S" };
    let lon_ref = if gps.longitude >= 0.0 { "E" } else { "W" };

    tags.push(ExifTag::GPSLatitudeRef(lat_ref.to_string()));
    tags.push(ExifTag::GPSLatitude(dms_rationals(gps.latitude)));
    tags.push(ExifTag::GPSLongitudeRef(lon_ref.to_string()));
    tags.push(ExifTag::GPSLongitude(dms_rationals(gps.longitude)));
}

/// Whether IFD0 of a bare TIFF block points at a GPS IFD.
fn has_gps_ifd(tiff: &[u8]) -> bool {
    let big_endian = match tiff.get(0..2) {
        Some(b"II") => false,
        Some(b"MM") => true,
        _ => return false,
    };
    let u16_at = |at: usize| {
        let b: [u8; 2] = tiff.get(at..at + 2)?.try_into().ok()?;
        Some(if big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
    };
    let u32_at = |at: usize| {
        let b: [u8; 4] = tiff.get(at..at + 4)?.try_into().ok()?;
        Some(if big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
    };

    let Some(ifd0) = u32_at(4).map(|o| o as usize) else {
        return false;
    };
    let Some(count) = u16_at(ifd0) else {
        return false;
    };
    (0..count as usize).any(|i| u16_at(ifd0 + 2 + i * 12) == Some(TAG_GPS_INFO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exif::read_exif;
    use chrono::TimeZone;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn sample_tags(gps: Option<Location>) -> TagSet {
        let utc = Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap();
        TagSet {
            local: utc.naive_utc() - chrono::Duration::hours(4),
            utc,
            gps,
        }
    }

    fn write_jpeg(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let img = RgbImage::from_pixel(32, 24, Rgb([120, 60, 200]));
        std::fs::write(&path, encode_jpeg(&img, 90).unwrap()).unwrap();
        path
    }

    // ── tag building ─────────────────────────────────────────────────

    #[test]
    fn jpeg_full_scope_has_three_dates() {
        let tags = build_tags(&sample_tags(None), ImageKind::Jpeg, TagScope::Full);
        assert_eq!(tags.len(), 3);
        assert!(matches!(&tags[0], ExifTag::DateTimeOriginal(s) if s == "2023:06:15 08:00:00"));
        assert!(matches!(&tags[1], ExifTag::CreateDate(_)));
        assert!(matches!(&tags[2], ExifTag::ModifyDate(_)));
    }

    #[test]
    fn webp_and_minimal_scope_have_original_date_only() {
        let gps = Some(Location::new(40.7, -74.0));
        assert_eq!(build_tags(&sample_tags(None), ImageKind::WebP, TagScope::Full).len(), 1);
        assert_eq!(build_tags(&sample_tags(None), ImageKind::Jpeg, TagScope::Minimal).len(), 1);
        assert_eq!(build_tags(&sample_tags(gps), ImageKind::WebP, TagScope::Full).len(), 5);
    }

    #[test]
    fn invalid_location_is_dropped_from_tag_set() {
        let utc = Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap();
        let capture = crate::time::localize(utc, None, chrono_tz::UTC);
        let tags = TagSet::new(&capture, Some(Location::new(95.0, 10.0)));
        assert!(tags.gps.is_none());
    }

    #[test]
    fn gps_tags_are_named_gps_entries() {
        let tags = build_tags(
            &sample_tags(Some(Location::new(40.7, -74.0))),
            ImageKind::WebP,
            TagScope::Full,
        );
        assert!(matches!(&tags[1], ExifTag::GPSLatitudeRef(r) if r == "N"));
        assert!(matches!(&tags[2], ExifTag::GPSLatitude(v) if v.len() == 3));
        assert!(matches!(&tags[3], ExifTag::GPSLongitudeRef(r) if r == "W"));
        assert!(matches!(&tags[4], ExifTag::GPSLongitude(v) if v.len() == 3));
    }

    #[test]
    fn gps_ifd_pointer_detection() {
        // II*\0, IFD0 at 8, one entry
        let mut tiff = b"II*\0\x08\0\0\0\x01\0".to_vec();
        let mut entry = [0u8; 12];
        entry[..2].copy_from_slice(&TAG_GPS_INFO.to_le_bytes());
        tiff.extend_from_slice(&entry);
        assert!(has_gps_ifd(&tiff));

        tiff[10..12].copy_from_slice(&0x0132u16.to_le_bytes());
        assert!(!has_gps_ifd(&tiff));
        assert!(!has_gps_ifd(b"II*\0\xff\0\0\0"));
        assert!(!has_gps_ifd(b"junk"));
    }

    #[test]
    fn dms_split() {
        assert_eq!(to_dms(40.5), (40, 30, 0));
        assert_eq!(to_dms(-74.0), (74, 0, 0));
        let (d, m, s) = to_dms(48.8566);
        assert_eq!((d, m), (48, 51));
        assert!((s as f64 / 10_000.0 - 23.76).abs() < 0.01);
    }

    // ── JPEG ─────────────────────────────────────────────────────────

    #[test]
    fn full_write_round_trips_through_reader() {
        let dir = TempDir::new().unwrap();
        let path = write_jpeg(dir.path(), "a.jpg");
        let tags = sample_tags(Some(Location::new(40.7, -74.0)));

        write_tags(&path, ImageKind::Jpeg, &tags, TagScope::Full).unwrap();

        let data = read_exif(&path).unwrap();
        assert_eq!(data.date_time_original, Some(tags.local));
        assert_eq!(data.create_date, Some(tags.local));
        let lat = data.gps_latitude.unwrap();
        let lon = data.gps_longitude.unwrap();
        assert!((lat - 40.7).abs() < 1e-4, "lat {lat}");
        assert!((lon + 74.0).abs() < 1e-4, "lon {lon}");

        // still a decodable image
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (32, 24));
    }

    #[test]
    fn encoded_block_carries_gps_ifd() {
        let mut metadata = Metadata::new();
        for tag in build_tags(
            &sample_tags(Some(Location::new(48.8566, 2.3522))),
            ImageKind::Jpeg,
            TagScope::Minimal,
        ) {
            metadata.set_tag(tag);
        }
        assert!(has_gps_ifd(&encode_tiff(&metadata).unwrap()));
    }

    #[test]
    fn webp_gps_round_trips_through_reader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.webp");
        image::RgbaImage::from_pixel(16, 16, image::Rgba([9, 9, 9, 255]))
            .save_with_format(&path, image::ImageFormat::WebP)
            .unwrap();
        let tags = sample_tags(Some(Location::new(-33.8688, 151.2093)));

        write_tags(&path, ImageKind::WebP, &tags, TagScope::Full).unwrap();

        let data = read_exif(&path).unwrap();
        assert_eq!(data.date_time_original, Some(tags.local));
        assert!(data.has_gps);
        assert!((data.gps_latitude.unwrap() + 33.8688).abs() < 1e-4);
        assert!((data.gps_longitude.unwrap() - 151.2093).abs() < 1e-4);
    }

    #[test]
    fn rewriting_replaces_previous_dates() {
        let dir = TempDir::new().unwrap();
        let path = write_jpeg(dir.path(), "b.jpg");
        let first = sample_tags(None);
        write_tags(&path, ImageKind::Jpeg, &first, TagScope::Full).unwrap();

        let mut second = first;
        second.local += chrono::Duration::days(1);
        write_tags(&path, ImageKind::Jpeg, &second, TagScope::Minimal).unwrap();

        let data = read_exif(&path).unwrap();
        assert_eq!(data.date_time_original, Some(second.local));
    }

    #[test]
    fn garbage_jpeg_is_a_metadata_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jpg");
        std::fs::write(&path, b"not a jpeg at all").unwrap();
        let err = write_tags(&path, ImageKind::Jpeg, &sample_tags(None), TagScope::Minimal);
        assert!(matches!(err, Err(ExportError::MetadataWrite(_))));
    }

    // ── transcode / file time ────────────────────────────────────────

    #[test]
    fn transcode_replaces_source_with_tagged_jpeg() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("t.webp");
        let rgba = image::RgbaImage::from_pixel(16, 16, image::Rgba([0, 0, 0, 0]));
        image::DynamicImage::ImageRgba8(rgba)
            .save_with_format(&src, image::ImageFormat::WebP)
            .unwrap();

        let tags = sample_tags(None);
        let out = transcode_to_jpeg(&src, &tags).unwrap();

        assert_eq!(out, dir.path().join("t.jpg"));
        assert!(!src.exists());
        let img = image::open(&out).unwrap().to_rgb8();
        // fully transparent pixels flatten to white
        assert!(img.pixels().all(|p| p.0.iter().all(|&c| c > 240)));
        assert_eq!(read_exif(&out).unwrap().date_time_original, Some(tags.local));
    }

    #[test]
    fn failed_transcode_leaves_no_jpeg_behind() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("broken.webp");
        std::fs::write(&src, b"RIFF\0\0\0\0WEBPjunk").unwrap();

        assert!(transcode_to_jpeg(&src, &sample_tags(None)).is_err());
        assert!(src.exists());
        assert!(!dir.path().join("broken.jpg").exists());
    }

    #[test]
    fn untaggable_transcode_output_is_removed() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("half.jpg");
        std::fs::write(&target, b"untagged").unwrap();

        let failed: Result<()> = Err(ExportError::MetadataWrite("refused".into()));
        assert!(discard_on_err(&target, failed).is_err());
        assert!(!target.exists());

        std::fs::write(&target, b"tagged").unwrap();
        discard_on_err(&target, Ok(())).unwrap();
        assert!(target.exists());
    }

    #[test]
    fn file_time_is_capture_instant() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"x").unwrap();
        let tags = sample_tags(None);

        set_file_time(&path, tags.utc).unwrap();

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(DateTime::<Utc>::from(modified), tags.utc);
    }
}
