use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use log::{info, Level, LevelFilter};
use npatch::{patch, PatchOptions};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

// --- Main Application Entry Point ---

fn main() {
    // 1. Parse command-line arguments using `clap`.
    let args = Args::parse();

    // 2. Call the main logic function.
    //    All complex logic and error handling is inside `run`.
    if let Err(e) = run(args) {
        // 3. Print a user-facing message and set the exit code.
        //    Using {:?} ensures the full error chain from `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    setup_logging(&args);

    // --- Open the Three Streams ---
    // Everything is processed incrementally, so the streams are handed to
    // the library as-is (buffered, since it reads and writes byte-wise).
    let diff_file = File::open(&args.diff_file)
        .with_context(|| format!("Failed to open diff file '{}'", args.diff_file.display()))?;
    let diff = BufReader::new(diff_file);

    let original: Box<dyn Read> = match &args.input_file {
        Some(path) => Box::new(
            File::open(path)
                .with_context(|| format!("Failed to open input file '{}'", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };
    let original = BufReader::new(original);

    // A dry run must not touch the output path at all, not even to
    // truncate an existing file.
    let output: Box<dyn Write> = match (&args.output_file, args.dry_run) {
        (_, true) => Box::new(io::sink()),
        (Some(path), false) => Box::new(
            File::create(path)
                .with_context(|| format!("Failed to create output file '{}'", path.display()))?,
        ),
        (None, false) => Box::new(io::stdout().lock()),
    };
    let output = BufWriter::new(output);

    // --- Core Patching Logic ---
    let options = PatchOptions {
        dry_run: args.dry_run,
        quiet: args.quiet,
        show_body: !args.no_body,
    };

    info!(
        "Applying '{}' to {}",
        args.diff_file.display(),
        args.input_file
            .as_deref()
            .map(|p| format!("'{}'", p.display()))
            .unwrap_or_else(|| "stdin".to_string())
    );

    patch(original, output, diff, &options)
        .with_context(|| format!("Failed to apply diff '{}'", args.diff_file.display()))?;

    if args.dry_run {
        info!("DRY RUN completed. The patch applies cleanly; no output was written.");
    }

    Ok(())
}

// --- Helper Structs and Functions ---

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply a normal-format diff to a file, streaming from input to output.",
    long_about = "Applies hunks of the default (\"normal\") output format of diff(1), such as\n5,7d4, 3a4,5 and 1,2c1,3, at exactly the line numbers they declare. The\noriginal, the diff and the result are all processed as streams, so inputs of\nany size can be patched and the tool composes with shell pipelines."
)]
struct Args {
    /// Path to the diff file to apply.
    diff_file: PathBuf,
    /// File to be patched. Reads from stdin when omitted.
    input_file: Option<PathBuf>,
    /// Destination for the patched result. Writes to stdout when omitted.
    output_file: Option<PathBuf>,
    /// If set, verify that the patch applies cleanly without writing output.
    #[arg(
        short = 'n',
        long,
        help = "Verify the patch without writing any output."
    )]
    dry_run: bool,
    /// If set, suppress the per-hunk diagnostics printed on failure.
    #[arg(short = 'q', long, help = "Suppress hunk diagnostics on failure.")]
    quiet: bool,
    /// If set, failure diagnostics show only hunk headers, never body lines.
    #[arg(long, help = "Render only hunk headers in diagnostics.")]
    no_body: bool,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace.")]
    verbose: u8,
}

/// Sets up the global logger with a level derived from `-v` count.
fn setup_logging(args: &Args) {
    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vvv and higher
    };

    // Configure the log format with colors. Logs go to stderr, keeping
    // stdout clean for the patched output.
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}
