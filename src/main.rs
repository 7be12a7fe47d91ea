use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;

mod builder;
mod cache;
mod cli;
mod config;
mod face;
mod index;
mod matcher;
mod persist;
mod store;
#[cfg(test)]
mod tests;

use builder::IndexBuilder;
use cache::IndexCache;
use config::Config;
use face::{ExtractError, FaceEncoder, FaceSelection, EMBEDDING_DIM, ENCODER_ID};
use matcher::{DiskSource, MatchError, Matcher};
use persist::IndexFiles;
use store::{CsvStore, EmbeddingStore};

fn build_matcher(config: &Config, selection: FaceSelection) -> Matcher {
    let store: Arc<dyn EmbeddingStore> =
        Arc::new(CsvStore::new(config.base_path().join("faces.csv")));

    let files = IndexFiles::in_dir(config.base_path());
    let builder = IndexBuilder::new(store.clone(), EMBEDDING_DIM, config.rebuild_batch_size);

    let source = DiskSource::new(
        IndexFiles::in_dir(config.base_path()),
        IndexBuilder::new(store.clone(), EMBEDDING_DIM, config.rebuild_batch_size),
        EMBEDDING_DIM,
        ENCODER_ID,
    );
    let cache = Arc::new(IndexCache::new(
        Arc::new(source),
        config.strict_consistency,
    ));

    Matcher::new(
        FaceEncoder::new(selection),
        cache,
        builder,
        files,
        store,
        config.threshold,
        ENCODER_ID,
    )
}

fn load_image(path: &std::path::Path) -> anyhow::Result<image::DynamicImage> {
    image::open(path).with_context(|| format!("Failed to decode image {}", path.display()))
}

fn rebuild_with_progress(matcher: &Matcher) -> anyhow::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::Relaxed);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static progress template"),
    );

    let report = matcher.rebuild_index_with_progress(Some(&cancel), |scanned| {
        bar.set_message(format!("{scanned} rows scanned"));
        bar.tick();
    })?;
    bar.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&report).unwrap());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();

    let data_dir = args.data_dir.unwrap_or_else(config::default_data_dir);
    tracing::debug!("using data directory {}", data_dir.display());
    let config = Config::load_with(&data_dir);

    match args.command {
        cli::Command::Enroll {
            image,
            id,
            label,
            rebuild,
            yes,
        } => {
            let identifier = match id {
                Some(id) => id,
                None => image
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.to_string())
                    .context("Image path has no usable filename; pass --id")?,
            };

            let matcher = build_matcher(&config, config.selection());

            let store = CsvStore::new(config.base_path().join("faces.csv"));
            if store.get(&identifier).is_ok() && !yes {
                match inquire::prompt_confirmation(format!(
                    "'{identifier}' is already enrolled. Overwrite it?"
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            let img = load_image(&image)?;
            match matcher.enroll(&img, &identifier, label) {
                Ok(_) => println!("enrolled '{identifier}'"),
                Err(MatchError::NoFace(ExtractError::NoFace)) => {
                    bail!("No face detected in {}", image.display())
                }
                Err(e) => return Err(e.into()),
            }

            if rebuild {
                rebuild_with_progress(&matcher)?;
            }
            Ok(())
        }

        cli::Command::Find {
            image,
            top_k,
            selection,
        } => {
            let selection = cli::resolve_selection(selection.as_deref(), config.selection());
            let matcher = build_matcher(&config, selection);

            let img = load_image(&image)?;
            let top_k = top_k.unwrap_or(config.default_top_k);

            match matcher.extract_and_find_similar(&img, top_k) {
                Ok(results) => {
                    println!("{}", serde_json::to_string_pretty(&results).unwrap());
                    Ok(())
                }
                Err(MatchError::NoFace(ExtractError::NoFace)) => {
                    bail!("No face detected in {}", image.display())
                }
                Err(e) => Err(e.into()),
            }
        }

        cli::Command::Rebuild {} => {
            let matcher = build_matcher(&config, config.selection());
            rebuild_with_progress(&matcher)
        }

        cli::Command::Stats {} => {
            let matcher = build_matcher(&config, config.selection());
            let stats = matcher.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats).unwrap());
            Ok(())
        }
    }
}
