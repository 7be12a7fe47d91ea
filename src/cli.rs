use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::face::FaceSelection;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Data directory (store, index files, config). Defaults to ~/.facedex
    #[clap(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enroll a face image into the store
    Enroll {
        /// Path to the image file
        image: PathBuf,

        /// Record identifier; defaults to the image filename
        #[clap(short, long)]
        id: Option<String>,

        /// Human-readable label stored with the record
        #[clap(short, long)]
        label: Option<String>,

        /// Rebuild the index right after enrolling
        #[clap(long)]
        rebuild: bool,

        /// Overwrite an existing record without asking
        #[clap(short, long)]
        yes: bool,
    },

    /// Find enrolled faces similar to the one in an image
    Find {
        /// Path to the query image
        image: PathBuf,

        /// Maximum number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Face to pick when an image contains several; overrides the
        /// configured default in either direction
        #[clap(long, value_parser = ["first", "largest"])]
        selection: Option<String>,
    },

    /// Rebuild the similarity index from the store
    Rebuild {},

    /// Show store and index counts
    Stats {},
}

/// Resolve the per-invocation selection override against the configured
/// default. An explicit `--selection` wins in both directions.
pub fn resolve_selection(override_value: Option<&str>, configured: FaceSelection) -> FaceSelection {
    match override_value {
        Some("largest") => FaceSelection::Largest,
        Some(_) => FaceSelection::First,
        None => configured,
    }
}
