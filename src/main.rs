//! Accelerator Language Compiler CLI
//!
//! Usage:
//!   accelc kernel.acc
//!   accelc kernel.acc -o kernel.futil --no-metadata
//!   accelc kernel.acc -c accelc.toml --json
//!   cat kernel.acc | accelc --check

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use accelc::{check, compile, CompileError, CompilerConfig, OutputFormat};

#[derive(ClapParser, Debug)]
#[command(name = "accelc")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Compiles banked loop-and-array programs to a hardware control IR")]
struct Args {
    /// Source file; reads standard input when omitted
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Output file; standard output when omitted
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Emit the netlist as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Stop after type checking
    #[arg(long = "check")]
    check_only: bool,

    /// Omit the metadata table
    #[arg(long = "no-metadata")]
    no_metadata: bool,

    /// Root component name
    #[arg(long = "top")]
    top: Option<String>,

    /// Verbose output (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// File configuration with command-line overrides applied
    fn config(&self) -> Result<CompilerConfig, CompileError> {
        let mut config = match &self.config {
            Some(path) => CompilerConfig::load(path)?,
            None => CompilerConfig::default(),
        };
        if let Some(output) = &self.output {
            config.output = Some(output.clone());
        }
        if self.json_output {
            config.format = OutputFormat::Json;
        }
        if self.check_only {
            config.check_only = true;
        }
        if self.no_metadata {
            config.emit_metadata = false;
        }
        if let Some(top) = &self.top {
            config.top_name = top.clone();
        }
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn report(err: &CompileError) -> ! {
    if err.is_internal() {
        eprintln!("{}: {}", "internal compiler error".red().bold(), err);
        eprintln!("{}", "This is a bug in accelc, please report it.".yellow());
    } else {
        eprintln!("{}: {}", "error".red().bold(), err);
    }
    std::process::exit(1);
}

/// Write `contents` to `path` through a temporary file in the same
/// directory, so readers never observe a partial file
fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = args.config().unwrap_or_else(|e| report(&e));

    let source = match &args.input {
        Some(path) => fs::read_to_string(path).unwrap_or_else(|e| {
            eprintln!(
                "{}: Failed to read file '{}': {}",
                "error".red().bold(),
                path.display(),
                e
            );
            std::process::exit(1);
        }),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
                eprintln!("{}: Failed to read stdin: {}", "error".red().bold(), e);
                std::process::exit(1);
            });
            buffer
        }
    };

    if config.check_only {
        match check(&source) {
            Ok(_) => {
                eprintln!("{}", "No errors found".green());
                return;
            }
            Err(e) => report(&e),
        }
    }

    let netlist = compile(&source, &config).unwrap_or_else(|e| report(&e));

    let rendered = match config.format {
        OutputFormat::Text => netlist.to_string(),
        OutputFormat::Json => netlist.to_json().unwrap_or_else(|e| {
            eprintln!("{}: Failed to serialize to JSON: {}", "error".red().bold(), e);
            std::process::exit(1);
        }),
    };

    match &config.output {
        Some(path) => {
            if let Err(e) = write_atomically(path, &rendered) {
                report(&CompileError::Io(e));
            }
            if args.verbose > 0 {
                eprintln!(
                    "{}: {} component(s) written to {}",
                    "Done".green(),
                    netlist.components.len(),
                    path.display()
                );
            }
        }
        None => print!("{}", rendered),
    }
}
