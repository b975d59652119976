use chrono::{DateTime, Utc};
use image::ImageFormat;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::archive::{Archive, Conversation, ImageGroup, ImageRecord, Realmoji};
use crate::composite::{CompositeSpec, synthesize};
use crate::config::RunContext;
use crate::error::Result;
use crate::exif::TagSet;
use crate::export::{ExportOutcome, existing_output, export_image};
use crate::pairing::{PairChoice, PairChooser, PairRequest};
use crate::time;

/// Encoded format of an archive image.
///
/// The archive only ever contains JPEG and WebP. File names are not
/// trusted: [`ImageKind::detect`] reads the magic bytes, while
/// [`ImageKind::from_path`] only looks at the extension.
///
/// # Example
///
/// ```rust
/// use bereal_export::pipeline::ImageKind;
/// use std::path::Path;
///
/// assert_eq!(ImageKind::from_path(Path::new("a.JPEG")), Some(ImageKind::Jpeg));
/// assert_eq!(ImageKind::from_path(Path::new("a.png")), None);
/// assert_eq!(ImageKind::WebP.extension(), "webp");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// JPEG: full EXIF date set plus GPS
    Jpeg,
    /// WebP: `DateTimeOriginal` plus GPS in the RIFF `EXIF` chunk
    WebP,
}

impl ImageKind {
    /// Determine the image kind from a file path extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn from_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::WebP => Some(Self::WebP),
            _ => None,
        }
    }

    /// Sniff the encoded format from the file contents. The extension is
    /// never consulted.
    pub fn detect(path: &Path) -> Option<Self> {
        let mut head = Vec::with_capacity(32);
        std::fs::File::open(path)
            .and_then(|f| f.take(32).read_to_end(&mut head))
            .ok()?;
        image::guess_format(&head).ok().and_then(Self::from_format)
    }

    /// Canonical extension for exported files.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Jpeg => Self::WebP,
            Self::WebP => Self::Jpeg,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }
}

// ── Reports ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Memories,
    Posts,
    Realmojis,
    Conversations,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memories => "memories",
            Self::Posts => "posts",
            Self::Realmojis => "realmojis",
            Self::Conversations => "conversations",
        };
        f.write_str(name)
    }
}

/// How one record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// At least one new file was written.
    Exported,
    /// Every output already existed.
    Skipped,
    /// Nothing usable was produced.
    Failed,
}

impl RecordStatus {
    fn of(outcomes: &[&ExportOutcome]) -> Self {
        if outcomes.iter().any(|o| matches!(o, ExportOutcome::Exported(_))) {
            Self::Exported
        } else if !outcomes.is_empty() && outcomes.iter().all(|o| o.is_skipped()) {
            Self::Skipped
        } else {
            Self::Failed
        }
    }
}

/// Per-category counts; `total` counts records inside the time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    pub total: usize,
    pub exported: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Set when the category's JSON could not be decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CategoryReport {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            total: 0,
            exported: 0,
            skipped: 0,
            failed: 0,
            error: None,
        }
    }

    fn record(&mut self, status: RecordStatus) {
        self.total += 1;
        match status {
            RecordStatus::Exported => self.exported += 1,
            RecordStatus::Skipped => self.skipped += 1,
            RecordStatus::Failed => self.failed += 1,
        }
    }

    fn tally(category: Category, statuses: impl IntoIterator<Item = RecordStatus>) -> Self {
        let mut report = Self::new(category);
        for status in statuses {
            report.record(status);
        }
        report
    }
}

impl fmt::Display for CategoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} total, {} exported, {} skipped, {} failed",
            self.category, self.total, self.exported, self.skipped, self.failed
        )?;
        if let Some(ref err) = self.error {
            write!(f, " ({err})")?;
        }
        Ok(())
    }
}

// ── Run ─────────────────────────────────────────────────────────────

/// Export every enabled category of the archive under `ctx.input_path`.
///
/// Only a missing archive fails the run. Everything else is logged and
/// counted in the returned reports, one per enabled category that had data.
pub fn run(ctx: &RunContext, chooser: &dyn PairChooser) -> Result<Vec<CategoryReport>> {
    let archive = Archive::discover(&ctx.input_path)?;
    log::info!("Found archive export at: {}", archive.root().display());
    if ctx.time_span.start.is_some() || ctx.time_span.end.is_some() {
        log::info!("Exporting {}", ctx.time_span);
    }

    let mut reports = Vec::new();

    if ctx.categories.memories {
        reports.extend(pair_category(ctx, &archive, Category::Memories, archive.load_memories()));
    }
    if ctx.categories.posts {
        reports.extend(pair_category(ctx, &archive, Category::Posts, archive.load_posts()));
    }
    if ctx.categories.realmojis {
        match archive.load_realmojis() {
            Ok(Some(realmojis)) => reports.push(export_realmojis(ctx, &archive, &realmojis)),
            Ok(None) => {}
            Err(e) => reports.push(decode_failure(Category::Realmojis, e)),
        }
    }
    if ctx.categories.conversations {
        reports.push(export_conversations(ctx, &archive, chooser));
    }

    Ok(reports)
}

fn decode_failure(category: Category, err: crate::error::ExportError) -> CategoryReport {
    log::error!("Skipping {category}: {err}");
    CategoryReport {
        error: Some(err.to_string()),
        ..CategoryReport::new(category)
    }
}

fn progress_bar(ctx: &RunContext, len: usize, unit: &str, message: &str) -> ProgressBar {
    if !ctx.show_progress {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let template = format!("{{spinner:.green}} {{msg}} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {unit} ({{eta}})");
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Parse each record's timestamp and keep those inside the window.
/// Unparseable records come back as `Err` so they can be counted.
fn in_window<T>(
    ctx: &RunContext,
    items: impl IntoIterator<Item = T>,
    timestamp: impl Fn(&T) -> Result<DateTime<Utc>>,
) -> Vec<std::result::Result<(T, DateTime<Utc>), ()>> {
    items
        .into_iter()
        .filter_map(|item| match timestamp(&item) {
            Ok(utc) if ctx.time_span.contains(utc) => Some(Ok((item, utc))),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Skipping record: {e}");
                Some(Err(()))
            }
        })
        .collect()
}

// ── Memories & posts ────────────────────────────────────────────────

fn pair_category(
    ctx: &RunContext,
    archive: &Archive,
    category: Category,
    loaded: Result<Option<Vec<ImageRecord>>>,
) -> Option<CategoryReport> {
    let records = match loaded {
        Ok(Some(records)) => records,
        Ok(None) => return None,
        Err(e) => return Some(decode_failure(category, e)),
    };

    let jobs = in_window(ctx, records, |r| r.taken_at.parse());
    if jobs.is_empty() {
        log::info!("No {category} found in the specified time range");
        return Some(CategoryReport::new(category));
    }
    log::info!(
        "Processing {} {category} with {} workers (saving to posts folder)...",
        jobs.len(),
        ctx.max_workers
    );

    let out_dir = ctx.out_path.join("posts");
    let pb = progress_bar(ctx, jobs.len(), "records", &format!("Exporting {category}"));
    let work = || -> Vec<RecordStatus> {
        jobs.par_iter()
            .map(|job| {
                let status = match job {
                    Ok((record, utc)) => export_record(ctx, archive.root(), &out_dir, record, *utc),
                    Err(()) => RecordStatus::Failed,
                };
                pb.inc(1);
                status
            })
            .collect()
    };

    let statuses = match rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.max_workers)
        .build()
    {
        Ok(pool) => pool.install(work),
        Err(e) => {
            log::warn!("Could not build worker pool, using the global one: {e}");
            work()
        }
    };
    pb.finish_and_clear();

    let report = CategoryReport::tally(category, statuses);
    log::info!("Completed {report}");
    Some(report)
}

/// Main view, selfie view and composite for one memory or post.
pub fn export_record(
    ctx: &RunContext,
    root: &Path,
    out_dir: &Path,
    record: &ImageRecord,
    utc: DateTime<Utc>,
) -> RecordStatus {
    let capture = time::localize(utc, record.location.as_ref(), ctx.default_zone);
    let tags = TagSet::new(&capture, record.location);
    let stem = capture.file_stem();

    let main = export_image(
        root,
        &record.primary,
        &out_dir.join(format!("{stem}_main-view.webp")),
        &tags,
    );
    let selfie = export_image(
        root,
        &record.secondary,
        &out_dir.join(format!("{stem}_selfie-view.webp")),
        &tags,
    );

    let composite = match (main.path(), selfie.path()) {
        (Some(background), Some(overlay)) => synthesize(
            &CompositeSpec {
                background: background.to_path_buf(),
                overlay: overlay.to_path_buf(),
                output: out_dir.join(format!("{stem}_composited.webp")),
            },
            &tags,
        ),
        _ => {
            log::warn!("Skipping composite for {stem}: missing source image");
            ExportOutcome::Failed(out_dir.join(format!("{stem}_composited.webp")))
        }
    };

    RecordStatus::of(&[&main, &selfie, &composite])
}

// ── Realmojis ───────────────────────────────────────────────────────

fn export_realmojis(ctx: &RunContext, archive: &Archive, realmojis: &[Realmoji]) -> CategoryReport {
    let jobs = in_window(ctx, realmojis, |r| r.posted_at.parse());
    if jobs.is_empty() {
        log::info!("No realmojis found in the specified time range");
    }

    let out_dir = ctx.out_path.join("realmojis");
    let pb = progress_bar(ctx, jobs.len(), "realmojis", "Exporting realmojis");
    let statuses: Vec<_> = jobs
        .iter()
        .map(|job| {
            let status = match job {
                Ok((realmoji, utc)) => {
                    let capture = time::localize(*utc, None, ctx.default_zone);
                    let tags = TagSet::new(&capture, None);
                    let dest = out_dir.join(format!("{}.webp", capture.file_stem()));
                    RecordStatus::of(&[&export_image(archive.root(), &realmoji.media.path, &dest, &tags)])
                }
                Err(()) => RecordStatus::Failed,
            };
            pb.inc(1);
            status
        })
        .collect();
    pb.finish_and_clear();

    CategoryReport::tally(Category::Realmojis, statuses)
}

// ── Conversations ───────────────────────────────────────────────────

/// One chat message's images with the instant they are filed under.
struct MessageJob<'a> {
    conversation: &'a Conversation,
    group: ImageGroup,
    utc: DateTime<Utc>,
    user_suffix: String,
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn plan_conversation<'a>(ctx: &RunContext, conversation: &'a Conversation) -> (Vec<MessageJob<'a>>, usize) {
    let chat_log = conversation.chat_log();
    let mut jobs = Vec::new();
    let mut failed = 0;

    for group in conversation.image_groups() {
        let message = chat_log.get(&group.file_id);
        let from_log = message
            .and_then(|m| m.created_at.as_ref())
            .and_then(|ts| ts.parse().ok());
        let utc = match from_log {
            Some(utc) => utc,
            None => {
                log::debug!(
                    "No chat log entry for ID {} in {}, using file modification time",
                    group.file_id,
                    conversation.id
                );
                match group.files.first().and_then(|f| modified_time(f)) {
                    Some(utc) => utc,
                    None => {
                        log::warn!("No usable time for message {} in {}", group.file_id, conversation.id);
                        failed += 1;
                        continue;
                    }
                }
            }
        };
        if !ctx.time_span.contains(utc) {
            continue;
        }
        jobs.push(MessageJob {
            conversation,
            user_suffix: message.map(|m| m.user_suffix()).unwrap_or_default(),
            group,
            utc,
        });
    }
    (jobs, failed)
}

fn export_conversations(ctx: &RunContext, archive: &Archive, chooser: &dyn PairChooser) -> CategoryReport {
    let conversations = archive.conversations();
    let mut report = CategoryReport::new(Category::Conversations);

    let mut jobs = Vec::new();
    for conversation in &conversations {
        let (planned, failed) = plan_conversation(ctx, conversation);
        jobs.extend(planned);
        for _ in 0..failed {
            report.record(RecordStatus::Failed);
        }
    }

    let total_pairs = jobs.iter().filter(|j| j.group.files.len() == 2).count();
    let interactive = chooser.is_interactive();
    if interactive && total_pairs > 0 {
        log::info!("{total_pairs} conversation pairs need a choice");
    }

    let pb = progress_bar(ctx, jobs.len(), "messages", "Exporting conversations");
    let mut asked = 0;
    for job in &jobs {
        let progress = if interactive && job.group.files.len() == 2 {
            Some((asked + 1, total_pairs))
        } else {
            None
        };
        let (status, prompted) = pb.suspend(|| export_message(ctx, archive.root(), job, chooser, progress));
        if prompted {
            asked += 1;
        }
        report.record(status);
        pb.inc(1);
    }
    pb.finish_and_clear();

    log::info!("Completed {report}");
    report
}

/// Export one message's images and, for a pair, its composite. The second
/// value tells whether the chooser was consulted.
fn export_message(
    ctx: &RunContext,
    root: &Path,
    job: &MessageJob<'_>,
    chooser: &dyn PairChooser,
    progress: Option<(usize, usize)>,
) -> (RecordStatus, bool) {
    let capture = time::localize(job.utc, None, ctx.default_zone);
    let tags = TagSet::new(&capture, None);
    let stem = capture.file_stem();
    let file_id = &job.group.file_id;
    let suffix = &job.user_suffix;
    let out_dir = ctx.out_path.join("conversations").join(&job.conversation.id);

    let mut outcomes = Vec::new();
    let mut exported: Vec<PathBuf> = Vec::new();
    for (i, file) in job.group.files.iter().enumerate() {
        let original = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = out_dir.join(format!("{stem}_id{file_id}_{}{suffix}_{original}.webp", i + 1));
        let outcome = export_image(root, &file.to_string_lossy(), &dest, &tags);
        if let Some(path) = outcome.path() {
            exported.push(path.to_path_buf());
        }
        outcomes.push(outcome);
    }

    let mut prompted = false;
    if job.group.files.len() == 2 && exported.len() == 2 {
        let output = out_dir.join(format!("{stem}_id{file_id}{suffix}_composited.webp"));
        let composite = match existing_output(&output) {
            Some(existing) => ExportOutcome::Skipped(existing),
            None => {
                let request = PairRequest {
                    conversation_id: &job.conversation.id,
                    file_id,
                    originals: [job.group.files[0].as_path(), job.group.files[1].as_path()],
                    exported: [exported[0].as_path(), exported[1].as_path()],
                    progress,
                };
                prompted = chooser.is_interactive();
                match chooser.choose(&request) {
                    PairChoice::Pair { background, overlay } => synthesize(
                        &CompositeSpec {
                            background,
                            overlay,
                            output,
                        },
                        &tags,
                    ),
                    PairChoice::Skip => {
                        log::info!("Skipped composite for conversation {} message {file_id}", job.conversation.id);
                        ExportOutcome::Skipped(output)
                    }
                }
            }
        };
        outcomes.push(composite);
    }

    let refs: Vec<&ExportOutcome> = outcomes.iter().collect();
    (RecordStatus::of(&refs), prompted)
}
