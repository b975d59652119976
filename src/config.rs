use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the exporter.
///
/// Everything here can also be set from the command line; CLI flags win.
///
/// # Loading
///
/// ```rust,no_run
/// use bereal_export::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.export.max_workers = 8;
/// config.export.default_time_zone = "Europe/Berlin".into();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the archive is read from and the export is written to.
    pub paths: PathsConfig,
    /// Which categories to export and how.
    pub export: ExportOptions,
    /// How conversation image pairs are resolved.
    pub pairing: PairingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the unpacked archive, directly or one level down.
    pub input_path: PathBuf,
    pub out_path: PathBuf,
}

/// Category toggles and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Upper bound on parallel memory/post exports.
    pub max_workers: usize,
    /// IANA zone used when a record carries no usable location.
    pub default_time_zone: String,
    pub memories: bool,
    pub posts: bool,
    pub realmojis: bool,
    pub conversations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub mode: PairingMode,
    /// Seconds the local chooser page waits for a click before skipping.
    pub chooser_timeout_secs: u64,
}

/// How the background/overlay roles of a conversation pair are decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    /// Filename and aspect-ratio heuristics, no interaction.
    #[default]
    Heuristic,
    /// Open both images in the system viewer and ask on the terminal.
    Prompt,
    /// Serve a chooser page on the loopback interface.
    Web,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("./input"),
            out_path: PathBuf::from("./output"),
        }
    }
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            default_time_zone: "America/New_York".to_string(),
            memories: true,
            posts: true,
            realmojis: true,
            conversations: true,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            mode: PairingMode::Heuristic,
            chooser_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Resolve the config file path: `config.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// Freeze the configuration into the immutable settings of one run.
    pub fn to_run_context(&self, time_span: TimeSpan) -> Result<RunContext> {
        let default_zone: Tz = self
            .export
            .default_time_zone
            .parse()
            .ok()
            .with_context(|| {
                format!("Unknown time zone {:?}", self.export.default_time_zone)
            })?;

        if self.export.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }

        Ok(RunContext {
            input_path: self.paths.input_path.clone(),
            out_path: self.paths.out_path.clone(),
            time_span,
            default_zone,
            max_workers: self.export.max_workers,
            categories: Categories {
                memories: self.export.memories,
                posts: self.export.posts,
                realmojis: self.export.realmojis,
                conversations: self.export.conversations,
            },
            pairing: self.pairing.mode,
            chooser_timeout: Duration::from_secs(self.pairing.chooser_timeout_secs),
            show_progress: true,
        })
    }
}

/// Enabled export categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Categories {
    pub memories: bool,
    pub posts: bool,
    pub realmojis: bool,
    pub conversations: bool,
}

impl Categories {
    pub fn all() -> Self {
        Self {
            memories: true,
            posts: true,
            realmojis: true,
            conversations: true,
        }
    }

    pub fn conversations_only() -> Self {
        Self {
            memories: false,
            posts: false,
            realmojis: false,
            conversations: true,
        }
    }
}

/// Immutable settings shared by every record of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub input_path: PathBuf,
    pub out_path: PathBuf,
    pub time_span: TimeSpan,
    pub default_zone: Tz,
    pub max_workers: usize,
    pub categories: Categories,
    pub pairing: PairingMode,
    pub chooser_timeout: Duration,
    /// Draw progress bars. Off for `--json` and in tests.
    pub show_progress: bool,
}

impl RunContext {
    /// Defaults rooted at the given directories, with progress bars off.
    pub fn new(input_path: impl Into<PathBuf>, out_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            out_path: out_path.into(),
            time_span: TimeSpan::default(),
            default_zone: crate::time::DEFAULT_TIME_ZONE,
            max_workers: 4,
            categories: Categories::all(),
            pairing: PairingMode::Heuristic,
            chooser_timeout: Duration::from_secs(300),
            show_progress: false,
        }
    }
}

/// Inclusive UTC window a record's capture time must fall in.
///
/// Either bound may be open. Dates cover the whole day, so the end bound is
/// the last second of the end date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpan {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

const SPAN_DATE_FORMAT: &str = "%d.%m.%Y";

impl TimeSpan {
    /// Parse `DD.MM.YYYY-DD.MM.YYYY`, either side may be `*`.
    ///
    /// ```rust
    /// use bereal_export::config::TimeSpan;
    ///
    /// let span = TimeSpan::parse("01.01.2023-*").unwrap();
    /// assert!(span.start.is_some());
    /// assert!(span.end.is_none());
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let Some((start, end)) = text.trim().split_once('-') else {
            bail!("Invalid timespan {text:?}. Use 'DD.MM.YYYY-DD.MM.YYYY'.");
        };

        let parse_side = |side: &str| -> Result<Option<NaiveDate>> {
            let side = side.trim();
            if side == "*" {
                return Ok(None);
            }
            NaiveDate::parse_from_str(side, SPAN_DATE_FORMAT)
                .map(Some)
                .with_context(|| {
                    format!("Invalid timespan date {side:?}. Use 'DD.MM.YYYY-DD.MM.YYYY'.")
                })
        };

        let span = Self::from_dates(parse_side(start)?, parse_side(end)?);
        if let (Some(s), Some(e)) = (span.start, span.end) {
            if s > e {
                bail!("Timespan starts after it ends: {text:?}");
            }
        }
        Ok(span)
    }

    /// January 1st through December 31st of `year`.
    pub fn year(year: i32) -> Result<Self> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1).with_context(|| format!("Invalid year {year}"))?;
        let end = NaiveDate::from_ymd_opt(year, 12, 31).with_context(|| format!("Invalid year {year}"))?;
        Ok(Self::from_dates(Some(start), Some(end)))
    }

    /// Pick the window from the two CLI options. The timespan wins.
    pub fn resolve(timespan: Option<&str>, year: Option<i32>) -> Result<Self> {
        match (timespan, year) {
            (Some(text), Some(_)) => {
                log::info!("Both --timespan and --year given; the timespan will be used");
                Self::parse(text)
            }
            (Some(text), None) => Self::parse(text),
            (None, Some(year)) => Self::year(year),
            (None, None) => Ok(Self::default()),
        }
    }

    fn from_dates(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        Self {
            start: start.map(|d| d.and_time(NaiveTime::MIN)),
            end: end.map(|d| d.and_time(last_second)),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let naive = instant.naive_utc();
        self.start.is_none_or(|s| naive >= s) && self.end.is_none_or(|e| naive <= e)
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |d: Option<NaiveDateTime>| {
            d.map(|d| d.format(SPAN_DATE_FORMAT).to_string())
                .unwrap_or_else(|| "*".to_string())
        };
        write!(f, "{}-{}", side(self.start), side(self.end))
    }
}
