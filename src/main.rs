//! sigcheck - structural checks and signing for PDF signature forms.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
#[cfg(feature = "openssl")]
use clap::ValueEnum;
use sigcheck::{
    collect_facts, diff, locate_tail, validate_signature_field, Config, FactSet, Revision,
};

/// Exit status when no blocker was found.
const CLEAN: u8 = 0;
/// Exit status when blockers or differences were found.
const BLOCKED: u8 = 1;
/// Exit status when the input could not be read or the operation failed.
const FAILED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "sigcheck")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; built-in defaults when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Collect the structural facts of a document and report blockers
    Inspect {
        file: PathBuf,

        /// Compare against a reference fact file
        #[arg(short, long)]
        reference: Option<PathBuf>,

        /// Write the fact set to this file
        #[arg(short, long)]
        write_facts: Option<PathBuf>,

        /// Print every fact
        #[arg(long)]
        facts: bool,
    },

    /// Validate a single signature field
    Field {
        file: PathBuf,
        name: String,
    },

    /// Locate and check the trailing cross-reference pointer
    Tail {
        file: PathBuf,

        /// Reject any byte after %%EOF other than a line break
        #[arg(long)]
        strict: bool,
    },

    /// Compare a candidate document with a reference document or fact file
    Diff {
        reference: PathBuf,
        candidate: PathBuf,
    },

    /// Add the certification signature
    #[cfg(feature = "openssl")]
    Certify {
        input: PathBuf,
        output: PathBuf,

        #[command(flatten)]
        key: KeyArgs,

        #[arg(short, long, value_enum, default_value_t = Level::FormFilling)]
        level: Level,
    },

    /// Fill in and sign one row
    #[cfg(feature = "openssl")]
    SignRow {
        input: PathBuf,
        output: PathBuf,

        #[command(flatten)]
        key: KeyArgs,

        /// One-based row index
        #[arg(short, long)]
        row: usize,

        /// Field value, as name=value
        #[arg(short = 's', long = "set", value_parser = parse_assignment)]
        values: Vec<(String, String)>,
    },
}

#[cfg(feature = "openssl")]
#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// PKCS #12 keystore holding the signing key
    #[arg(short = 'k', long)]
    pkcs12: PathBuf,

    /// Keystore password
    #[arg(short, long, default_value = "")]
    password: String,
}

#[cfg(feature = "openssl")]
#[derive(ValueEnum, Clone, Copy, Debug)]
enum Level {
    NoChanges,
    FormFilling,
    FormFillingAndAnnotations,
}

#[cfg(feature = "openssl")]
impl From<Level> for sigcheck::CertificationLevel {
    fn from(level: Level) -> Self {
        use sigcheck::CertificationLevel;

        match level {
            Level::NoChanges => CertificationLevel::NoChanges,
            Level::FormFilling => CertificationLevel::FormFilling,
            Level::FormFillingAndAnnotations => CertificationLevel::FormFillingAndAnnotations,
        }
    }
}

#[cfg(feature = "openssl")]
fn parse_assignment(arg: &str) -> std::result::Result<(String, String), String> {
    arg.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got {arg:?}"))
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(FAILED)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Inspect {
            file,
            reference,
            write_facts,
            facts: print_facts,
        } => {
            let bytes = read(&file)?;
            let revision = Revision::parse(&bytes)?;
            let facts = collect_facts(&revision, &config);

            if print_facts {
                for fact in &facts.facts {
                    println!("{fact}");
                }
            }
            if let Some(path) = write_facts {
                let out = BufWriter::new(File::create(&path)?);
                facts.facts.write_to(out)?;
                log::info!("wrote {} facts to {}", facts.facts.len(), path.display());
            }
            print_blockers(&facts.blockers);

            match reference {
                Some(path) => {
                    let reference = FactSet::read_from(BufReader::new(File::open(&path)?))?;
                    Ok(print_diff(&diff(&reference, &facts.facts, &facts.blockers)))
                }
                None => Ok(status(&facts.blockers)),
            }
        }

        Commands::Field { file, name } => {
            let bytes = read(&file)?;
            let revision = Revision::parse(&bytes)?;
            let report = validate_signature_field(&revision, &name, &config);
            print_blockers(&report.blockers);
            if report.ok {
                println!("{name}: ok");
            }
            Ok(status(&report.blockers))
        }

        Commands::Tail { file, strict } => {
            let bytes = read(&file)?;
            match locate_tail(&bytes, strict) {
                Ok(tail) => {
                    println!(
                        "startxref {} -> {}, last section at {}, %%EOF at {}",
                        tail.declared_offset,
                        tail.kind.map_or("nothing", |k| k.as_str()),
                        tail.actual_offset
                            .map_or("<none>".to_string(), |o| o.to_string()),
                        tail.eof_offset
                    );
                    Ok(if tail.is_consistent() { CLEAN } else { BLOCKED })
                }
                Err(e) => {
                    println!("blocker: {e}");
                    Ok(BLOCKED)
                }
            }
        }

        Commands::Diff {
            reference,
            candidate,
        } => {
            let reference_bytes = read(&reference)?;
            let reference = if reference_bytes.starts_with(b"%PDF-") {
                collect_facts(&Revision::parse(&reference_bytes)?, &config).facts
            } else {
                FactSet::read_from(&reference_bytes[..])?
            };
            let bytes = read(&candidate)?;
            let candidate = collect_facts(&Revision::parse(&bytes)?, &config);
            print_blockers(&candidate.blockers);
            Ok(print_diff(&diff(
                &reference,
                &candidate.facts,
                &candidate.blockers,
            )))
        }

        #[cfg(feature = "openssl")]
        Commands::Certify {
            input,
            output,
            key,
            level,
        } => {
            let coordinator = coordinator(config, &key)?;
            coordinator.certify(&input, &output, level.into())?;
            println!("certified {}", output.display());
            Ok(CLEAN)
        }

        #[cfg(feature = "openssl")]
        Commands::SignRow {
            input,
            output,
            key,
            row,
            values,
        } => {
            let values: std::collections::BTreeMap<String, String> = values.into_iter().collect();
            let coordinator = coordinator(config, &key)?;
            coordinator.sign_row(&input, &output, row, &values)?;
            println!("signed row {row} into {}", output.display());
            Ok(CLEAN)
        }
    }
}

#[cfg(feature = "openssl")]
fn coordinator(config: Config, key: &KeyArgs) -> Result<sigcheck::Coordinator> {
    use sigcheck::openssl::OpenSslSigner;

    let der = read(&key.pkcs12)?;
    let signer = OpenSslSigner::from_pkcs12(&der, &key.password)
        .with_context(|| format!("loading keystore {}", key.pkcs12.display()))?;
    let name = signer.common_name();
    let mut crypto = sigcheck::CryptoContext::new(signer);
    if let Some(name) = name {
        crypto = crypto.with_signer_name(name);
    }
    Ok(sigcheck::Coordinator::new(config, crypto))
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_blockers(blockers: &[String]) {
    for blocker in blockers {
        println!("blocker: {blocker}");
    }
}

fn print_diff(d: &sigcheck::FactDiff) -> u8 {
    for fact in &d.only_in_reference {
        println!("- {fact}");
    }
    for fact in &d.only_in_candidate {
        println!("+ {fact}");
    }
    if d.is_clean() {
        CLEAN
    } else {
        BLOCKED
    }
}

fn status(blockers: &[String]) -> u8 {
    if blockers.is_empty() {
        CLEAN
    } else {
        BLOCKED
    }
}
