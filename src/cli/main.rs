use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use bereal_export::config::{self, Categories, PairingMode, TimeSpan};
use bereal_export::{exif, pairing, pipeline};

#[derive(Parser, Debug)]
#[command(
    name = "bereal-export",
    version,
    about = "Export a BeReal archive into timestamped, geotagged photos and dual-camera composites"
)]
struct Cli {
    /// Folder containing the archive export, or a folder holding it
    #[arg(long = "input-path", value_name = "DIR")]
    input_path: Option<PathBuf>,

    /// Output folder
    #[arg(short = 'p', long = "out-path", value_name = "DIR")]
    out_path: Option<PathBuf>,

    /// Only export within DD.MM.YYYY-DD.MM.YYYY (either side may be `*`)
    #[arg(short, long, value_name = "SPAN")]
    timespan: Option<String>,

    /// Only export one year (ignored when --timespan is given)
    #[arg(short, long)]
    year: Option<i32>,

    /// Parallel workers for memories and posts
    #[arg(long, value_name = "N")]
    max_workers: Option<usize>,

    /// Skip memories.json
    #[arg(long)]
    no_memories: bool,

    /// Skip posts.json
    #[arg(long)]
    no_posts: bool,

    /// Skip realmojis.json
    #[arg(long)]
    no_realmojis: bool,

    /// Skip the conversations folder
    #[arg(long)]
    no_conversations: bool,

    /// Export conversations and nothing else
    #[arg(long)]
    conversations_only: bool,

    /// Ask which conversation image is the selfie view
    #[arg(long)]
    interactive_conversations: bool,

    /// Ask in a browser page instead of the terminal
    #[arg(long)]
    web_ui: bool,

    /// Path to config file (default: config.json next to binary)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Initialize a default config.json and exit
    #[arg(long)]
    init: bool,

    /// Output category reports as JSON
    #[arg(long)]
    json: bool,

    /// Print capture time and GPS read back from exported files and exit
    #[arg(long = "show-exif", value_name = "FILE", num_args = 1..)]
    show_exif: Vec<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    if cli.init {
        let config = config::Config::default();
        let path = cli.config.as_deref();
        config.save(path)?;
        let save_path = match path {
            Some(p) => p.to_path_buf(),
            None => config::Config::config_path()?,
        };
        println!("Default config written to {}", save_path.display());
        return Ok(());
    }

    if !cli.show_exif.is_empty() {
        for path in &cli.show_exif {
            print_exif(path)?;
        }
        return Ok(());
    }

    let mut config = config::Config::load(cli.config.as_deref())?;
    apply_overrides(&cli, &mut config);

    let time_span = TimeSpan::resolve(cli.timespan.as_deref(), cli.year)?;
    let mut ctx = config.to_run_context(time_span)?;
    ctx.show_progress = !cli.json;
    if cli.conversations_only {
        log::info!("Conversations only: skipping memories, posts and realmojis");
        ctx.categories = Categories::conversations_only();
    }

    log::info!(
        "Exporting {} to {} (pairing: {:?})",
        ctx.input_path.display(),
        ctx.out_path.display(),
        ctx.pairing
    );

    let reports = tokio::task::spawn_blocking(move || {
        let chooser = pairing::chooser_for(ctx.pairing, ctx.chooser_timeout);
        pipeline::run(&ctx, chooser.as_ref())
    })
    .await
    .context("Export task panicked")?
    .context("Export failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    for report in &reports {
        log::info!("{report}");
    }
    let exported: usize = reports.iter().map(|r| r.exported).sum();
    let failed: usize = reports.iter().map(|r| r.failed).sum();
    log::info!("Done: {exported} exported, {failed} failed");

    Ok(())
}

/// Fold command-line flags into the loaded config.
fn apply_overrides(cli: &Cli, config: &mut config::Config) {
    if let Some(ref input) = cli.input_path {
        config.paths.input_path = input.clone();
    }
    if let Some(ref out) = cli.out_path {
        config.paths.out_path = out.clone();
    }
    if let Some(workers) = cli.max_workers {
        config.export.max_workers = workers;
    }
    if cli.no_memories {
        config.export.memories = false;
    }
    if cli.no_posts {
        config.export.posts = false;
    }
    if cli.no_realmojis {
        config.export.realmojis = false;
    }
    if cli.no_conversations {
        config.export.conversations = false;
    }
    if cli.interactive_conversations {
        config.pairing.mode = if cli.web_ui {
            PairingMode::Web
        } else {
            PairingMode::Prompt
        };
    } else if cli.web_ui {
        log::warn!("--web-ui has no effect without --interactive-conversations");
    }
}

// ANSI color codes
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";

/// Print the capture-time and GPS tags of one file.
fn print_exif(path: &Path) -> Result<()> {
    let data = exif::read_exif(path)?;

    println!();
    println!("{BOLD}File:{RESET} {}", path.display());
    println!("{DIM}{}{RESET}", "═".repeat(72));

    let dates = [
        ("DateTimeOriginal", data.date_time_original),
        ("CreateDate", data.create_date),
        ("ModifyDate", data.modify_date),
    ];
    for (tag, value) in dates {
        if let Some(v) = value {
            print_row(tag, &v.format("%Y:%m:%d %H:%M:%S").to_string());
        }
    }

    if data.has_gps {
        if let Some(lat) = data.gps_latitude {
            print_row("GPSLatitude", &format!("{lat:.6}"));
        }
        if let Some(lon) = data.gps_longitude {
            print_row("GPSLongitude", &format!("{lon:.6}"));
        }
    }

    if data == exif::ExifData::default() {
        println!("  {DIM}(no capture metadata found){RESET}");
    }
    println!();

    Ok(())
}

/// Print a single row in the EXIF display table.
fn print_row(tag: &str, val: &str) {
    println!("  {:<22} : {val}", tag);
}
