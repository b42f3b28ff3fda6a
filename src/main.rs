//! photocanvas - Photo catalog indexer
//!
//! Entry point for the CLI application.

use anyhow::Context;
use clap::Parser;
use photocanvas::config::{CliArgs, Command, Config};
use photocanvas::error::{ConfigError, PipelineError};
use photocanvas::progress::{print_header, print_summary, ProgressReporter};
use photocanvas::source::ImageSource;
use photocanvas::types::Missing;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Fatal initialization failure (db, migrations, config)
const EXIT_INIT: u8 = 1;

/// Thumbnail pipeline misconfiguration
const EXIT_THUMBNAILS: u8 = 2;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    for cause in err.chain() {
        let config_err = match cause.downcast_ref::<PipelineError>() {
            Some(PipelineError::Config(c)) => Some(c),
            _ => cause.downcast_ref::<ConfigError>(),
        };
        if let Some(ConfigError::Thumbnail { .. }) = config_err {
            return ExitCode::from(EXIT_THUMBNAILS);
        }
    }
    ExitCode::from(EXIT_INIT)
}

fn run() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;

    let config =
        Config::load(args.config.as_deref()).context("Invalid configuration")?;

    match args.command {
        Command::Index {
            ref dirs,
            max,
            force_metadata,
            force_contents,
        } => {
            let dirs: Vec<String> = dirs
                .iter()
                .map(|d| d.to_string_lossy().into_owned())
                .collect();
            let source = ImageSource::new(config, &args.data_dir)
                .context("Failed to initialize image source")?;

            if !args.quiet {
                print_header(&dirs, &args.data_dir.to_string_lossy());
            }
            let started = Instant::now();
            let reporter = (!args.quiet).then(ProgressReporter::new);

            let mut files = 0u64;
            for dir in &dirs {
                files += source
                    .index_files(dir, max, |count| {
                        if let Some(reporter) = &reporter {
                            reporter.update_walk(dir, count);
                        }
                    })
                    .with_context(|| format!("Failed to index '{}'", dir))?;
            }

            let force = Missing {
                metadata: force_metadata,
                color: force_contents,
                embedding: force_contents,
            };
            source.index_metadata(&dirs, max, force);
            source.index_contents(&dirs, max, force);

            loop {
                let metadata = source.metadata_progress();
                let contents = source.contents_progress();
                if let Some(reporter) = &reporter {
                    reporter.update_queues(metadata, contents);
                }
                if metadata.pending == 0 && contents.pending == 0 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            source.wait_for_indexing();

            if let Some(reporter) = &reporter {
                reporter.finish_and_clear();
            }
            if !args.quiet {
                let db_size = std::fs::metadata(args.data_dir.join("photocanvas.cache.db"))
                    .map(|m| m.len())
                    .ok();
                print_summary(
                    files,
                    source.metadata_progress().done,
                    source.contents_progress().done,
                    started.elapsed(),
                    db_size,
                );
            }
            source.close();
        }
        Command::Vacuum => {
            let source = ImageSource::new(config, &args.data_dir)
                .context("Failed to initialize image source")?;
            source.vacuum().context("Vacuum failed")?;
            if !args.quiet {
                println!("Catalog compacted.");
            }
            source.close();
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    Ok(())
}
