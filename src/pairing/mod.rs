//! Background/overlay assignment for two-image conversation messages.
//!
//! The archive does not say which of a message's two images is the selfie.
//! A [`PairChooser`] decides: [`HeuristicChooser`] from file names and shapes,
//! [`PromptChooser`] by asking on the terminal, [`WebChooser`] through a page
//! served on the loopback interface.

mod prompt;
mod web;

pub use prompt::PromptChooser;
pub use web::WebChooser;

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::PairingMode;

/// Aspect-ratio difference above which the squarer image is the overlay.
const RATIO_THRESHOLD: f64 = 0.2;

/// Result of a pairing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairChoice {
    Pair { background: PathBuf, overlay: PathBuf },
    /// No composite for this message.
    Skip,
}

/// A two-image message awaiting a decision.
#[derive(Debug, Clone)]
pub struct PairRequest<'a> {
    pub conversation_id: &'a str,
    pub file_id: &'a str,
    /// Archive files, used for name markers.
    pub originals: [&'a Path; 2],
    /// Exported copies, shown to the user and returned in the choice.
    pub exported: [&'a Path; 2],
    /// "Interactive pair N of M" position, when known.
    pub progress: Option<(usize, usize)>,
}

impl PairRequest<'_> {
    /// Choice that makes `exported[index]` the overlay.
    pub fn overlay_at(&self, index: usize) -> PairChoice {
        PairChoice::Pair {
            background: self.exported[1 - index].to_path_buf(),
            overlay: self.exported[index].to_path_buf(),
        }
    }

    pub fn progress_text(&self) -> Option<String> {
        self.progress
            .map(|(n, total)| format!("Interactive pair {n} of {total}"))
    }
}

/// Decides which image of a pair becomes the overlay.
///
/// Implementations may block on a human. Returning [`PairChoice::Skip`]
/// leaves the message without a composite.
pub trait PairChooser {
    /// Short name for logs ("heuristic", "prompt", "web").
    fn name(&self) -> &str;
    fn choose(&self, request: &PairRequest<'_>) -> PairChoice;
    /// Whether choices need a human, which enables progress counting.
    fn is_interactive(&self) -> bool {
        false
    }
}

/// Picks the chooser for the configured mode.
pub fn chooser_for(mode: PairingMode, timeout: Duration) -> Box<dyn PairChooser> {
    match mode {
        PairingMode::Heuristic => Box::new(HeuristicChooser),
        PairingMode::Prompt => Box::new(PromptChooser),
        PairingMode::Web => Box::new(WebChooser::new(timeout)),
    }
}

/// Rule-based chooser; never skips.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicChooser;

impl PairChooser for HeuristicChooser {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn choose(&self, request: &PairRequest<'_>) -> PairChoice {
        let dims = [
            image_dimensions(request.exported[0]),
            image_dimensions(request.exported[1]),
        ];
        let overlay = overlay_index(request.originals, dims);
        request.overlay_at(overlay)
    }
}

fn image_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::ImageReader::open(path)
        .ok()?
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Open a file or URL with the desktop's default handler.
pub(crate) fn open_external(target: impl AsRef<OsStr>) -> io::Result<()> {
    let mut cmd = if cfg!(target_os = "macos") {
        Command::new("open")
    } else if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else {
        Command::new("xdg-open")
    };
    cmd.arg(target).spawn().map(|_| ())
}

fn lower_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Index of the overlay image, first matching rule wins:
///
/// 1. exactly one name contains `secondary`
/// 2. one name says `front` and the other `back`
/// 3. aspect ratios differ by more than 0.2, squarer one is the overlay
/// 4. the name sorting later is the overlay
pub fn overlay_index(originals: [&Path; 2], dims: [Option<(u32, u32)>; 2]) -> usize {
    let names = [lower_name(originals[0]), lower_name(originals[1])];

    match (names[0].contains("secondary"), names[1].contains("secondary")) {
        (true, false) => return 0,
        (false, true) => return 1,
        _ => {}
    }

    if names[0].contains("front") && names[1].contains("back") {
        return 0;
    }
    if names[0].contains("back") && names[1].contains("front") {
        return 1;
    }

    let ratio = |d: Option<(u32, u32)>| d.filter(|&(_, h)| h > 0).map(|(w, h)| w as f64 / h as f64);
    if let (Some(r0), Some(r1)) = (ratio(dims[0]), ratio(dims[1])) {
        if (r0 - r1).abs() > RATIO_THRESHOLD {
            return if (r0 - 1.0).abs() < (r1 - 1.0).abs() { 0 } else { 1 };
        }
    }

    if names[0] < names[1] { 1 } else { 0 }
}
