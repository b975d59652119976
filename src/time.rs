//! Capture-time resolution.
//!
//! Archive timestamps are UTC. Photo viewers read `DateTimeOriginal` as wall
//! clock time with no zone attached, so every timestamp is shifted into the
//! zone where the photo was taken before it is embedded or used in a filename.
//! The zone comes from the record's coordinates when present, otherwise from
//! the configured default zone.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tzf_rs::DefaultFinder;

use crate::error::{ExportError, Result};

/// Zone used when a record has no coordinates or the lookup finds nothing.
pub const DEFAULT_TIME_ZONE: Tz = chrono_tz::America::New_York;

/// Textual timestamp encodings seen in archive exports, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%S.000Z",
    "%Y-%m-%dT%H:%M:%SZ",
];

/// Filename stem format shared by every exported file.
pub const FILE_STEM_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// EXIF `DateTime*` tag format.
pub const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

static FINDER: LazyLock<DefaultFinder> = LazyLock::new(DefaultFinder::new);

/// GPS coordinates attached to a memory or post.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether the coordinates are finite and inside the WGS84 range.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A capture instant together with its local wall-clock rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureTime {
    /// The instant as recorded in the archive.
    pub utc: DateTime<Utc>,
    /// Wall-clock time in `zone`, with the zone stripped.
    pub local: NaiveDateTime,
    pub zone: Tz,
}

impl CaptureTime {
    /// `YYYY-MM-DD_HH-MM-SS` in local time.
    pub fn file_stem(&self) -> String {
        self.local.format(FILE_STEM_FORMAT).to_string()
    }

    /// `YYYY:MM:DD HH:MM:SS` in local time, as EXIF expects.
    pub fn exif_string(&self) -> String {
        self.local.format(EXIF_DATETIME_FORMAT).to_string()
    }
}

/// Parse an archive timestamp into a UTC instant.
///
/// Accepts ISO-8601 UTC strings with or without fractional seconds, and raw
/// numeric epochs in seconds (fractional allowed).
///
/// ```rust
/// use bereal_export::time::parse_timestamp;
///
/// let ts = parse_timestamp("2023-06-15T12:00:00.000Z").unwrap();
/// assert_eq!(ts.timestamp(), 1_686_830_400);
/// assert_eq!(parse_timestamp("1686830400").unwrap(), ts);
/// ```
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();

    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(epoch) = trimmed.parse::<f64>() {
        if epoch.is_finite() {
            let secs = epoch.floor();
            let nanos = ((epoch - secs) * 1e9).round().min(999_999_999.0) as u32;
            if let Some(instant) = DateTime::from_timestamp(secs as i64, nanos) {
                return Ok(instant);
            }
        }
    }

    Err(ExportError::Parse(raw.to_string()))
}

/// Find the IANA zone for a location, falling back to `default_zone`.
pub fn zone_for(location: Option<&Location>, default_zone: Tz) -> Tz {
    let Some(loc) = location else {
        log::debug!("No GPS location, using {default_zone}");
        return default_zone;
    };

    if !loc.is_valid() {
        log::debug!(
            "Ignoring out-of-range location {}, {}; using {default_zone}",
            loc.latitude,
            loc.longitude
        );
        return default_zone;
    }

    // tzf takes longitude first
    let name = FINDER.get_tz_name(loc.longitude, loc.latitude);
    if name.is_empty() {
        log::debug!("Time zone lookup found nothing, using {default_zone}");
        return default_zone;
    }

    match name.parse::<Tz>() {
        Ok(tz) => {
            log::debug!("Using time zone {name} from GPS location");
            tz
        }
        Err(_) => {
            log::debug!("Unknown time zone {name:?}, using {default_zone}");
            default_zone
        }
    }
}

/// Shift a UTC instant into the local zone of `location`.
pub fn localize(utc: DateTime<Utc>, location: Option<&Location>, default_zone: Tz) -> CaptureTime {
    let zone = zone_for(location, default_zone);
    CaptureTime {
        utc,
        local: utc.with_timezone(&zone).naive_local(),
        zone,
    }
}

/// Parse and localize in one step.
pub fn resolve(raw: &str, location: Option<&Location>, default_zone: Tz) -> Result<CaptureTime> {
    Ok(localize(parse_timestamp(raw)?, location, default_zone))
}
