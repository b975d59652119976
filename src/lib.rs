//! # bereal-export
//!
//! Export a BeReal data archive into a folder of timestamped, geotagged images
//! with a composited dual-camera view for every post.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bereal_export::config::{Config, TimeSpan};
//! use bereal_export::pairing::HeuristicChooser;
//! use bereal_export::pipeline;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Some("config.json".as_ref()))?;
//!     let ctx = config.to_run_context(TimeSpan::parse("01.01.2023-*")?)?;
//!
//!     for report in pipeline::run(&ctx, &HeuristicChooser)? {
//!         println!("{report}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Lower-Level Usage
//!
//! ```rust,no_run
//! use bereal_export::composite::{CompositeSpec, synthesize};
//! use bereal_export::exif::TagSet;
//! use bereal_export::time::{self, Location, DEFAULT_TIME_ZONE};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let location = Location::new(40.7, -74.0);
//! let capture = time::resolve("2023-06-15T12:00:00.000Z", Some(&location), DEFAULT_TIME_ZONE)?;
//! let tags = TagSet::new(&capture, Some(location));
//!
//! let outcome = synthesize(
//!     &CompositeSpec {
//!         background: "back.webp".into(),
//!         overlay: "front.webp".into(),
//!         output: Path::new("out").join(format!("{}_composited.webp", capture.file_stem())),
//!     },
//!     &tags,
//! );
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Output
//!
//! | Source | Output |
//! |--------|--------|
//! | `memories.json`, `posts.json` | `posts/<time>_{main-view,selfie-view,composited}.webp` |
//! | `realmojis.json` | `realmojis/<time>.webp` |
//! | `conversations/<id>/` | `conversations/<id>/<time>_id<msg>_<n>[_user_<id>]_<name>.webp` |
//!
//! Files whose bytes are JPEG end in `.jpg` instead.
//!
//! ## Modules
//!
//! - [`archive`]: archive discovery and record loading
//! - [`composite`]: rounded-corner overlay composites
//! - [`config`]: configuration file, time spans, run context
//! - [`exif`]: capture-time and GPS tag writing with fallbacks
//! - [`export`]: copying single images into the output tree
//! - [`pairing`]: background/overlay choice for conversation pairs
//! - [`pipeline`]: per-category export with progress and reports
//! - [`time`]: timestamp parsing and time-zone resolution

pub mod archive;
pub mod composite;
pub mod config;
pub mod error;
pub mod exif;
pub mod export;
pub mod pairing;
pub mod pipeline;
pub mod time;
