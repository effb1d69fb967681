//! Offline journal resize utility.
//!
//! `blipstore-resize <journal-dir> --num-jfiles <n> --jfile-size-pgs <p> [--quiet]`
//!
//! Exits 0 when the journal was rewritten. Otherwise prints the reason on stdout
//! and exits 1; the journal is left as it was.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use blipstore::core::journal::JournalGeometry;
use blipstore::core::resize::resize_journal;
use blipstore::logging::init_logging;

#[derive(Parser, Debug)]
#[command(
    name = "blipstore-resize",
    version,
    about = "Rewrite a stopped queue journal with a new file geometry"
)]
struct Cli {
    /// Journal directory of the queue (`<store>/journal/<queue>`).
    dir: PathBuf,

    /// Number of journal files in the ring, 4 to 64.
    #[arg(long = "num-jfiles")]
    num_jfiles: u32,

    /// Size of each journal file in 64 KiB pages, 1 to 32768.
    #[arg(long = "jfile-size-pgs")]
    jfile_size_pgs: u32,

    /// Suppress progress output.
    #[arg(long, short)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if !cli.quiet {
        // Logging is best effort for a one-shot tool.
        let _ = init_logging(Some("warn"));
    }

    let geometry = JournalGeometry {
        num_files: cli.num_jfiles,
        file_size_pages: cli.jfile_size_pgs,
    };
    match resize_journal(&cli.dir, geometry) {
        Ok(report) => {
            if !cli.quiet {
                println!(
                    "resized journal of queue {}: {} -> {}; {} records ({} bytes) kept; originals in {}",
                    report.queue,
                    report.old_geometry,
                    report.new_geometry,
                    report.records,
                    report.bytes,
                    report.backup.display()
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            println!("blipstore-resize: {}: {err}", cli.dir.display());
            ExitCode::FAILURE
        }
    }
}
