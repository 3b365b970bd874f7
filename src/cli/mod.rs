//! CLI argument parsing and dispatch module
//!
//! Handles command-line interface using clap, including:
//! - Subcommands for each workflow (collect, monitor, compare, guided, ...)
//! - Global settings overrides (config file, store location, shard factor)
//! - Output format selection (human/JSON)
//! - Verbosity and quiet modes
//! - Mapping failures to process exit codes

mod commands;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::constants::STORE_FILE_NAME;
use crate::error::ScanError;
use crate::exit_codes::ExitCode;
use crate::logging::{self, LogObserver};
use crate::observer::Observers;
use crate::output::ProgressObserver;
use crate::rules::RuleError;
use crate::settings::{self, Settings, SettingsError};
use crate::store::{MemoryStore, Store};
use crate::workflow::ScanCoordinator;

/// Invalid flag values that clap itself cannot reject
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);

fn path_arg() -> Arg {
    Arg::new("path")
        .short('p')
        .long("path")
        .value_name("PATH")
        .help("Directory or file to inspect (repeatable)")
        .value_parser(value_parser!(PathBuf))
        .action(ArgAction::Append)
}

fn processes_arg() -> Arg {
    Arg::new("processes")
        .long("processes")
        .help("Include running processes")
        .action(ArgAction::SetTrue)
}

fn run_id_arg(help: &'static str) -> Arg {
    Arg::new("run-id")
        .short('r')
        .long("run-id")
        .value_name("ID")
        .help(help)
}

fn overwrite_arg() -> Arg {
    Arg::new("overwrite")
        .long("overwrite")
        .help("Replace existing runs with the same id")
        .action(ArgAction::SetTrue)
}

fn duration_arg() -> Arg {
    Arg::new("duration")
        .short('d')
        .long("duration")
        .value_name("SECONDS")
        .help("Stop monitoring after this many seconds (default: until Ctrl+C)")
        .value_parser(value_parser!(f64))
}

fn interval_arg() -> Arg {
    Arg::new("interval")
        .long("interval")
        .value_name("SECONDS")
        .help("Seconds between monitor polls (0.1-300.0)")
        .value_parser(value_parser!(f64))
}

fn analysis_args() -> [Arg; 4] {
    [
        Arg::new("analyze")
            .short('a')
            .long("analyze")
            .help("Classify results with the rule set")
            .action(ArgAction::SetTrue),
        Arg::new("rules")
            .long("rules")
            .value_name("FILE")
            .help("Rule file to classify with (implies --analyze; default: embedded rules)")
            .value_parser(value_parser!(PathBuf)),
        Arg::new("save-results")
            .long("save-results")
            .help("Store classified results with the runs (implies --analyze)")
            .action(ArgAction::SetTrue),
        Arg::new("threads")
            .long("threads")
            .value_name("N")
            .help("Classification threads (default: available parallelism)")
            .value_parser(value_parser!(usize)),
    ]
}

fn export_args() -> [Arg; 2] {
    [
        Arg::new("output")
            .short('o')
            .long("output")
            .value_name("DIR")
            .help("Write .json.txt export files to this directory")
            .value_parser(value_parser!(PathBuf)),
        Arg::new("exploded")
            .long("exploded")
            .help("Write one results file per category and change type")
            .action(ArgAction::SetTrue),
    ]
}

/// Build the command line interface
pub fn build_cli() -> Command {
    Command::new("driftscan")
        .version(crate::VERSION)
        .about("Detect and classify drift in a machine's security surface")
        .long_about(
            "Snapshots a machine's security configuration surface, monitors it for changes, \
             compares snapshots and classifies each change by risk with a declarative rule set.",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Settings file (default: <config dir>/driftscan/config.toml)")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .value_name("DIR")
                .help("Directory holding the run store")
                .value_parser(value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("shards")
                .long("shards")
                .value_name("N")
                .help("Store writer threads (1-64)")
                .value_parser(value_parser!(usize))
                .global(true),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .help("Output in JSON format")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress progress and warnings")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (repeatable)")
                .action(ArgAction::Count)
                .global(true),
        )
        .arg(
            Arg::new("unified-log")
                .long("unified-log")
                .help("Log to the macOS Unified Logging System instead of stderr")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("collect")
                .about("Take a snapshot of the selected surfaces")
                .arg(path_arg())
                .arg(processes_arg())
                .arg(run_id_arg("Run id (default: current timestamp)"))
                .arg(overwrite_arg()),
        )
        .subcommand(
            Command::new("monitor")
                .about("Record changes to the selected surfaces as they happen")
                .arg(path_arg().help("Directory to watch (repeatable)"))
                .arg(processes_arg().help("Watch process starts and exits"))
                .arg(run_id_arg("Run id (default: current timestamp)"))
                .arg(overwrite_arg())
                .arg(duration_arg())
                .arg(interval_arg()),
        )
        .subcommand(
            Command::new("compare")
                .about("Compare two runs, or export one run against an empty base")
                .arg(
                    Arg::new("first")
                        .long("first")
                        .value_name("ID")
                        .help("Base run (omit to treat every object of --second as created)"),
                )
                .arg(
                    Arg::new("second")
                        .long("second")
                        .value_name("ID")
                        .help("Run to compare against the base")
                        .required(true),
                )
                .args(analysis_args())
                .args(export_args()),
        )
        .subcommand(
            Command::new("export-monitor")
                .about("Turn a monitor run's events into results")
                .arg(run_id_arg("Monitor run to export").required(true))
                .args(analysis_args())
                .args(export_args()),
        )
        .subcommand(
            Command::new("guided")
                .about("Baseline collect, monitor, collect again, then compare and classify")
                .arg(path_arg())
                .arg(processes_arg())
                .arg(run_id_arg("Base id for the three runs (default: current timestamp)"))
                .arg(overwrite_arg())
                .arg(duration_arg())
                .arg(interval_arg())
                .args(analysis_args())
                .args(export_args()),
        )
        .subcommand(Command::new("runs").about("List stored runs"))
        .subcommand(
            Command::new("delete-run")
                .about("Delete a stored run and its results")
                .arg(Arg::new("run-id").value_name("ID").help("Run to delete").required(true)),
        )
        .subcommand(
            Command::new("verify-rules")
                .about("Validate a rule file")
                .arg(
                    Arg::new("rules")
                        .long("rules")
                        .value_name("FILE")
                        .help("Rule file to validate (default: embedded rules)")
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

/// Global options shared by every subcommand
pub struct Context {
    pub settings: Settings,
    pub json: bool,
    pub quiet: bool,
    pub token: CancellationToken,
}

impl Context {
    fn from_matches(matches: &ArgMatches, token: &CancellationToken) -> Result<Self> {
        let mut settings = Settings::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
        if let Some(store) = matches.get_one::<PathBuf>("store") {
            settings.store.path = Some(store.clone());
        }
        if let Some(&shards) = matches.get_one::<usize>("shards") {
            settings.store.shard_factor = settings::validate_shard_factor(shards)?;
        }

        Ok(Self {
            settings,
            json: matches.get_flag("json"),
            quiet: matches.get_flag("quiet"),
            token: token.clone(),
        })
    }

    /// Open the configured store, in memory when no location is known
    pub fn open_store(&self) -> Result<Arc<MemoryStore>> {
        let shards = self.settings.store.shard_factor;
        let directory = self.settings.store.path.clone().or_else(settings::default_store_dir);
        let store = match directory {
            Some(directory) => MemoryStore::open(&directory.join(STORE_FILE_NAME), shards)?,
            None => {
                log::warn!("No store directory available; runs will not be saved");
                MemoryStore::in_memory(shards)?
            }
        };
        Ok(Arc::new(store))
    }

    pub fn coordinator(&self, store: Arc<dyn Store>) -> ScanCoordinator {
        let observers = Observers::new()
            .with(Arc::new(LogObserver))
            .with(Arc::new(ProgressObserver::new(self.quiet)));
        ScanCoordinator::new(store, self.token.clone())
            .with_observer(Arc::new(observers))
            .with_drain_settings(self.settings.drain_settings())
    }
}

/// Seconds from a flag as a positive duration
pub fn seconds(value: f64, flag: &str) -> Result<Duration, UsageError> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(UsageError(format!("--{} must be a positive number of seconds, got {}", flag, value))),
    }
}

/// Exit status for a failed command
pub fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    if let Some(scan) = error.downcast_ref::<ScanError>() {
        return scan.exit_code();
    }
    if error.downcast_ref::<UsageError>().is_some() || error.downcast_ref::<SettingsError>().is_some() {
        return ExitCode::ArgsError;
    }
    if error.downcast_ref::<RuleError>().is_some() {
        return ExitCode::RuleLoadFailed;
    }
    ExitCode::GenericFailure
}

/// Parse `args`, run the selected subcommand and return its exit status
pub fn run<I, T>(args: I, token: &CancellationToken) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = match build_cli().try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::Success,
                _ => ExitCode::ArgsError,
            };
        }
    };

    let quiet = matches.get_flag("quiet");
    let level = logging::level_for(quiet, matches.get_count("verbose"));
    if let Err(e) = logging::init_logging(level, matches.get_flag("unified-log")) {
        eprintln!("Warning: {:#}", e);
    }

    let result = Context::from_matches(&matches, token).and_then(|context| commands::dispatch(&matches, &context));
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let matches = build_cli()
            .try_get_matches_from(["driftscan", "compare", "--second", "b", "--json", "--shards", "4"])
            .unwrap();
        assert!(matches.get_flag("json"));
        assert_eq!(matches.get_one::<usize>("shards"), Some(&4));
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "compare");
        assert_eq!(sub.get_one::<String>("second").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_compare_requires_second() {
        let result = build_cli().try_get_matches_from(["driftscan", "compare", "--first", "a"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_seconds_rejects_non_positive() {
        assert_eq!(seconds(1.5, "duration").unwrap(), Duration::from_millis(1500));
        assert!(seconds(0.0, "duration").is_err());
        assert!(seconds(-1.0, "duration").is_err());
        assert!(seconds(f64::NAN, "duration").is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code_for(&anyhow::Error::new(ScanError::Cancelled)), ExitCode::Cancelled);
        assert_eq!(exit_code_for(&anyhow::Error::new(UsageError("x".into()))), ExitCode::ArgsError);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), ExitCode::GenericFailure);
    }
}
