/// `diaglyze` -- summarize diagnostic archives and server log files
///
/// Two analyses are offered.  `ftdc` decodes a directory (or explicit files)
/// of binary capture archives and prints the decoded server description and
/// the time range the samples cover.  `log` scans a (possibly gzipped)
/// server log for slow operations, aggregates them per query pattern, and
/// prints the slowest individual operations followed by a table of pattern
/// aggregates; the full result is also persisted next to the working
/// directory so it can be reloaded later.
///
/// Quirks
///
/// The `log` command writes its progress meter to stderr so that the
/// summary on stdout stays pipeable; --silent turns the meter off entirely.
/// Log chatter from the decoding layers is controlled by RUST_LOG.
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use diaglog::{format_timestamp, DiagnosticData, LogAnalyzer};
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode diagnostic capture archives and print a coverage summary
    Ftdc(FtdcCmdArgs),

    /// Aggregate slow operations in a server log file
    Log(LogCmdArgs),

    /// Print information about the program
    Version,
}

#[derive(Args, Debug)]
pub struct FtdcCmdArgs {
    /// Downsampling span in seconds, reserved for delta-sample decoding [default: 300]
    #[arg(long, default_value_t = 300)]
    span: u32,

    /// Print only the covered time range
    #[arg(long, default_value_t = false)]
    range: bool,

    /// Archive files or directories
    #[arg(required = true)]
    paths: Vec<String>,
}

#[derive(Args, Debug)]
pub struct LogCmdArgs {
    /// Only aggregate operations that are collection scans
    #[arg(long, default_value_t = false)]
    collscan: bool,

    /// Suppress the progress meter
    #[arg(long, default_value_t = false)]
    silent: bool,

    /// Include the configuration banner in the summary
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    /// The log file to analyze, plain or gzipped
    filename: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    match diaglyze() {
        Ok(()) => {}
        Err(msg) => {
            eprintln!("ERROR: {}", msg);
            process::exit(1);
        }
    }
}

fn diaglyze() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Ftdc(ref args) => ftdc_command(args),
        Commands::Log(ref args) => log_command(args),
        Commands::Version => {
            // Components of the version string are space-separated keyword(value)
            // pairs; the program name is always the first component.
            println!("diaglyze version(0.1.0)");
            Ok(())
        }
    }
}

fn ftdc_command(args: &FtdcCmdArgs) -> Result<()> {
    let mut data = DiagnosticData::new(args.span);
    data.ingest(&args.paths)?;

    let Some((first, last)) = data.time_range() else {
        println!("No FTDC data found.");
        return Ok(());
    };
    if args.range {
        println!("{} - {}", format_timestamp(first), format_timestamp(last));
        return Ok(());
    }
    if let Some(ref info) = data.server_info {
        println!("{}", serde_json::to_string_pretty(info)?);
    }
    println!(
        "{} - {}",
        format_timestamp(first),
        format_timestamp(last)
    );
    println!(
        "serverStatus: {} samples, replSetGetStatus: {} samples, systemMetrics: {} samples",
        data.server_status.len(),
        data.repl_status.len(),
        data.system_metrics.len()
    );
    Ok(())
}

fn log_command(args: &LogCmdArgs) -> Result<()> {
    let mut analyzer = LogAnalyzer::new(&args.filename);
    analyzer.set_collscan(args.collscan);
    analyzer.set_silent(args.silent);
    analyzer.set_verbose(args.verbose);
    let summary = analyzer.analyze()?;
    println!("{}", summary);
    Ok(())
}
