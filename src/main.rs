//! mftap - forensic NTFS extraction engine
//!
//! Opens the target device read-only, harvests every NTFS partition's MFT,
//! builds the file catalogue, then hands control to the interactive shell.

use anyhow::{Context, Result};
use clap::Parser;
use mftap::cli::{self, Cli};
use mftap::engine::{Engine, EngineOptions};
use mftap::extract::{NON_RESIDENT_DIR, RESIDENT_DIR};
use std::fs;
use std::io;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Cli::parse();

    let default_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // The extractor expects its output tree to exist.
    fs::create_dir_all(args.output_root.join(RESIDENT_DIR))
        .context("failed to create the resident extraction directory")?;
    fs::create_dir_all(args.output_root.join(NON_RESIDENT_DIR))
        .context("failed to create the non-resident extraction directory")?;
    fs::create_dir_all(&args.image_dir).context("failed to create the image directory")?;

    let options = EngineOptions {
        device_path: args.device.clone(),
        image_dir: args.image_dir.clone(),
        output_root: args.output_root.clone(),
        max_extract_size: args.max_extract_size,
        max_modify_age_secs: args.max_modify_age,
        socket_name: args.socket_name.clone(),
    };

    let mut engine = Engine::bootstrap(&options)?;

    println!("Examining {}", args.device.display());
    print!("{}", engine.partition_summary());
    println!("{}", engine.catalog().summary());

    if let Some(path) = &args.catalog_json {
        let json = engine
            .catalog()
            .to_json()
            .context("failed to serialise the catalogue")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Catalogue written to {}", path.display());
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    cli::run_shell(&mut engine, stdin.lock(), stdout.lock())?;

    engine.shutdown();
    Ok(())
}
