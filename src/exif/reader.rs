use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime};
use nom_exif::*;
use serde::Serialize;
use std::io::Cursor;
use std::path::Path;

use super::webp;
use crate::time::EXIF_DATETIME_FORMAT;

/// Capture metadata read back from an exported file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExifData {
    pub date_time_original: Option<NaiveDateTime>,
    pub create_date: Option<NaiveDateTime>,
    pub modify_date: Option<NaiveDateTime>,
    pub has_gps: bool,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
}

/// Read capture time and GPS from a JPEG or WebP file.
pub fn read_exif(path: &Path) -> Result<ExifData> {
    let mut parser = MediaParser::new();

    let parsed = if is_webp(path)? {
        // nom-exif has no RIFF support, but the EXIF chunk is a bare TIFF block
        let bytes = std::fs::read(path).context("Failed to read image file")?;
        let Some(tiff) = webp::exif_payload(&bytes) else {
            log::debug!("No EXIF chunk in {}", path.display());
            return Ok(ExifData::default());
        };
        let ms = MediaSource::seekable(Cursor::new(tiff)).context("Failed to open WebP EXIF")?;
        parser.parse(ms)
    } else {
        let ms = MediaSource::file_path(path).context("Failed to open image file")?;
        parser.parse(ms)
    };

    let iter: ExifIter = match parsed {
        Ok(iter) => iter,
        Err(e) => {
            log::debug!("No EXIF data read from {}: {e}", path.display());
            return Ok(ExifData::default());
        }
    };

    // Parse GPS info before converting to Exif (consumes the iterator)
    let gps_info = iter.parse_gps_info().ok().flatten();
    let exif: Exif = iter.into();

    let mut data = ExifData {
        date_time_original: exif.get(ExifTag::DateTimeOriginal).and_then(entry_to_datetime),
        create_date: exif.get(ExifTag::CreateDate).and_then(entry_to_datetime),
        modify_date: exif.get(ExifTag::ModifyDate).and_then(entry_to_datetime),
        ..ExifData::default()
    };

    if let Some(gps) = gps_info {
        data.has_gps = true;
        data.gps_latitude = Some(latlng_to_decimal(&gps.latitude, gps.latitude_ref));
        data.gps_longitude = Some(latlng_to_decimal(&gps.longitude, gps.longitude_ref));
    }

    Ok(data)
}

fn is_webp(path: &Path) -> Result<bool> {
    use std::io::Read;
    let mut head = [0u8; 12];
    let mut file = std::fs::File::open(path).context("Failed to open image file")?;
    let n = file.read(&mut head).context("Failed to read image file")?;
    Ok(n == 12 && &head[0..4] == b"RIFF" && &head[8..12] == b"WEBP")
}

/// Interpret a date entry, whether nom-exif decoded it or left it as text.
fn entry_to_datetime(val: &EntryValue) -> Option<NaiveDateTime> {
    let s = val.to_string();
    let s = s.trim().trim_matches('"').trim_end_matches('\0');
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    [EXIF_DATETIME_FORMAT, "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Convert a nom-exif LatLng (3 URationals: deg, min, sec) to decimal degrees.
fn latlng_to_decimal(latlng: &LatLng, reference: char) -> f64 {
    let degrees = latlng.0.0 as f64 / latlng.0.1 as f64;
    let minutes = latlng.1.0 as f64 / latlng.1.1 as f64;
    let seconds = latlng.2.0 as f64 / latlng.2.1 as f64;

    let coord = degrees + minutes / 60.0 + seconds / 3600.0;

    if reference == 'S' || reference == 'W' {
        -coord
    } else {
        coord
    }
}
