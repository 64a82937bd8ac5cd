//! Command-line arguments and the interactive shell.
//!
//! The shell is line oriented. Search commands open a nested prompt that
//! keeps answering queries until `exit`; everything else is a single
//! exchange.

use crate::catalog::CatalogEntry;
use crate::engine::Engine;
use crate::extract::MAX_EXTRACT_FSIZE;
use crate::tap::TAP_SOCKET_NAME;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mftap")]
#[command(version)]
#[command(about = "Forensic NTFS extraction from raw block devices", long_about = None)]
pub struct Cli {
    /// Raw block device or disk image holding the NTFS volumes
    pub device: PathBuf,

    /// Directory receiving the per-partition MFT images
    #[arg(long, default_value = ".")]
    pub image_dir: PathBuf,

    /// Root of the extraction tree
    #[arg(long, default_value = "EXTRACTED_FILES")]
    pub output_root: PathBuf,

    /// Largest file, in bytes, the extractor will write
    #[arg(long, default_value_t = MAX_EXTRACT_FSIZE)]
    pub max_extract_size: u64,

    /// Tap recency window in seconds
    #[arg(long, default_value_t = 300)]
    pub max_modify_age: u64,

    /// Abstract socket name the disk tap listens on
    #[arg(long, default_value = TAP_SOCKET_NAME)]
    pub socket_name: String,

    /// Write the catalogue as JSON to this path after the build
    #[arg(long)]
    pub catalog_json: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    pub debug: bool,
}

const HELP: &str = "\
Commands:
  help                         - display this menu
  print files                  - list every catalogued file
  search using record number   - look files up by MFT record number
  search using record name     - look files up by name
  search using record offset   - look files up by sector offset
  extract using record number  - extract a catalogued file's content
  extract using qemu offset    - extract from the record at a sector offset
  start server                 - start the disk-tap consumer
  stop server                  - stop the disk-tap consumer
  exit                         - close this program";

/// Runs the interactive shell until `exit` or end of input.
pub fn run_shell<R: BufRead, W: Write>(
    engine: &mut Engine,
    mut input: R,
    mut out: W,
) -> io::Result<()> {
    writeln!(out, "Type 'help' for the command list.")?;

    loop {
        write!(out, "> ")?;
        out.flush()?;
        let Some(line) = read_line(&mut input)? else {
            break;
        };

        match line.as_str() {
            "" => {}
            "help" => writeln!(out, "{HELP}")?,
            "print files" => write!(out, "{}", engine.catalog().render_table())?,

            "search using record number" => {
                search_loop(&mut input, &mut out, "record number", |term| {
                    match term.parse::<u32>() {
                        Ok(number) => Some(rows(engine.catalog().search_by_record(number))),
                        Err(_) => None,
                    }
                })?;
            }
            "search using record name" => {
                search_loop(&mut input, &mut out, "file name", |term| {
                    Some(rows(engine.catalog().search_by_name(term)))
                })?;
            }
            "search using record offset" => {
                search_loop(&mut input, &mut out, "sector offset", |term| {
                    match term.parse::<i64>() {
                        Ok(offset) => Some(rows(engine.catalog().search_by_offset(offset))),
                        Err(_) => None,
                    }
                })?;
            }

            "extract using record number" => {
                write!(out, "record number> ")?;
                out.flush()?;
                let Some(term) = read_line(&mut input)? else {
                    break;
                };
                match term.parse::<u32>() {
                    Ok(number) => match engine.extract_by_record(number) {
                        Ok(Some(outcome)) => writeln!(out, "{outcome}")?,
                        Ok(None) => writeln!(out, "No catalogue entry for record {number}.")?,
                        Err(e) => writeln!(out, "Extraction failed: {e}")?,
                    },
                    Err(_) => writeln!(out, "Not a record number: {term}")?,
                }
            }
            "extract using qemu offset" => {
                write!(out, "sector offset> ")?;
                out.flush()?;
                let Some(term) = read_line(&mut input)? else {
                    break;
                };
                match term.parse::<i64>() {
                    Ok(sector) => match engine.extract_at_sector(sector) {
                        Ok(outcome) => writeln!(out, "{outcome}")?,
                        Err(e) => writeln!(out, "Extraction failed: {e}")?,
                    },
                    Err(_) => writeln!(out, "Not a sector offset: {term}")?,
                }
            }

            "start server" => match engine.start_server() {
                Ok(()) => writeln!(out, "Disk-tap consumer started.")?,
                Err(reason) => writeln!(out, "Cannot start: {reason}.")?,
            },
            "stop server" => match engine.stop_server() {
                Ok(()) => writeln!(out, "Disk-tap consumer stopped.")?,
                Err(reason) => writeln!(out, "Cannot stop: {reason}.")?,
            },

            "exit" => break,
            unknown => writeln!(out, "Unknown command: {unknown}. Try 'help'.")?,
        }
    }

    Ok(())
}

/// Renders catalogue hits as table rows the prompt can print.
fn rows(hits: Vec<&CatalogEntry>) -> Vec<String> {
    hits.into_iter().map(CatalogEntry::row).collect()
}

/// Nested search prompt: answers queries until `exit`.
fn search_loop<R, W, F>(input: &mut R, out: &mut W, what: &str, mut search: F) -> io::Result<()>
where
    R: BufRead,
    W: Write,
    F: FnMut(&str) -> Option<Vec<String>>,
{
    loop {
        write!(out, "{what} (exit to leave)> ")?;
        out.flush()?;
        let Some(term) = read_line(input)? else {
            return Ok(());
        };
        match term.as_str() {
            "" => {}
            "exit" => return Ok(()),
            term => match search(term) {
                None => writeln!(out, "Not a {what}: {term}")?,
                Some(hits) if hits.is_empty() => writeln!(out, "No matches.")?,
                Some(hits) => {
                    for hit in &hits {
                        writeln!(out, "{hit}")?;
                    }
                    writeln!(out, "{} match(es).", hits.len())?;
                }
            },
        }
    }
}

/// One trimmed input line, or `None` at end of input.
fn read_line<R: BufRead>(input: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
