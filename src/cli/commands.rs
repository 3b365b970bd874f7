//! Subcommand implementations

use anyhow::Result;
use clap::ArgMatches;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{seconds, Context, UsageError};
use crate::analysis::AnalysisStatus;
use crate::collectors::{Collector, FileCollector, ProcessCollector};
use crate::error::ScanError;
use crate::exit_codes::ExitCode;
use crate::export::JsonExporter;
use crate::monitor::{FileSystemMonitor, Monitor, ProcessMonitor};
use crate::output;
use crate::rules::{validate_rule_set, RuleSource};
use crate::settings;
use crate::store::Store;
use crate::workflow::{
    AnalysisOptions, CollectOptions, CompareOptions, CompareReport, ExportMonitorOptions, ExportRequest,
    GuidedOptions, MonitorOptions,
};

pub fn dispatch(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    match matches.subcommand() {
        Some(("collect", sub)) => collect(sub, context),
        Some(("monitor", sub)) => monitor(sub, context),
        Some(("compare", sub)) => compare(sub, context),
        Some(("export-monitor", sub)) => export_monitor(sub, context),
        Some(("guided", sub)) => guided(sub, context),
        Some(("runs", _)) => runs(context),
        Some(("delete-run", sub)) => delete_run(sub, context),
        Some(("verify-rules", sub)) => verify_rules(sub, context),
        _ => Err(UsageError("No subcommand given".to_string()).into()),
    }
}

fn paths(matches: &ArgMatches) -> Vec<PathBuf> {
    matches
        .get_many::<PathBuf>("path")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn collectors(matches: &ArgMatches) -> Vec<Box<dyn Collector>> {
    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();
    let paths = paths(matches);
    if !paths.is_empty() {
        collectors.push(Box::new(FileCollector::new(paths)));
    }
    if matches.get_flag("processes") {
        collectors.push(Box::new(ProcessCollector::new()));
    }
    collectors
}

fn monitors(matches: &ArgMatches, context: &Context) -> Result<Vec<Box<dyn Monitor>>> {
    let interval = match matches.get_one::<f64>("interval") {
        Some(&value) => Duration::from_secs_f64(settings::validate_polling_interval(value)?),
        None => context.settings.monitor_interval(),
    };

    let mut monitors: Vec<Box<dyn Monitor>> = Vec::new();
    let paths = paths(matches);
    if !paths.is_empty() {
        monitors.push(Box::new(FileSystemMonitor::paths(paths, interval)));
    }
    if matches.get_flag("processes") {
        monitors.push(Box::new(ProcessMonitor::processes(interval)));
    }
    Ok(monitors)
}

fn duration(matches: &ArgMatches) -> Result<Option<Duration>> {
    Ok(matches
        .get_one::<f64>("duration")
        .map(|&value| seconds(value, "duration"))
        .transpose()?)
}

fn run_id(matches: &ArgMatches) -> Option<String> {
    matches.get_one::<String>("run-id").cloned()
}

/// Analysis is requested by `--analyze`, `--rules` or `--save-results`
fn analysis(matches: &ArgMatches, context: &Context, always: bool) -> Option<AnalysisOptions> {
    let rules_path = matches.get_one::<PathBuf>("rules").cloned();
    let persist = matches.get_flag("save-results");
    if !(always || matches.get_flag("analyze") || rules_path.is_some() || persist) {
        return None;
    }

    let mut analyzer = context.settings.analyzer_options();
    if let Some(&threads) = matches.get_one::<usize>("threads") {
        analyzer.parallelism = Some(threads);
    }
    Some(AnalysisOptions {
        rules: rules_path.map_or_else(|| context.settings.rule_source(), RuleSource::File),
        analyzer,
        persist_results: persist,
    })
}

fn export(matches: &ArgMatches) -> Option<ExportRequest> {
    matches.get_one::<PathBuf>("output").map(|dir| ExportRequest {
        exporter: Arc::new(JsonExporter),
        output_dir: dir.clone(),
        exploded: matches.get_flag("exploded"),
    })
}

fn finish(store: &dyn Store) -> Result<()> {
    store.close()?;
    Ok(())
}

fn print_compare(report: &CompareReport, context: &Context) -> Result<ExitCode> {
    if context.json {
        output::print_json(&output::compare_json(report))?;
    } else {
        print!("{}", output::format_compare_human(report));
    }
    // Results are still printed, unclassified, when the rules are invalid
    Ok(match report.analysis {
        Some(AnalysisStatus::Skipped { .. }) => ExitCode::InvalidRules,
        _ => ExitCode::Success,
    })
}

fn collect(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    let store = context.open_store()?;
    let mut coordinator = context.coordinator(store.clone());
    let mut collectors = collectors(matches);

    let report = coordinator.collect(
        &mut collectors,
        &CollectOptions {
            run_id: run_id(matches),
            overwrite: matches.get_flag("overwrite"),
        },
    )?;
    finish(store.as_ref())?;

    if context.json {
        output::print_json(&output::phase_json(&report))?;
    } else {
        print!("{}", output::format_phase_human(&report));
    }
    Ok(ExitCode::Success)
}

fn monitor(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    let store = context.open_store()?;
    let mut coordinator = context.coordinator(store.clone());
    let mut monitors = monitors(matches, context)?;

    if !context.quiet {
        eprintln!("Press Ctrl+C to stop monitoring");
    }

    let report = coordinator.monitor(
        &mut monitors,
        &MonitorOptions {
            run_id: run_id(matches),
            overwrite: matches.get_flag("overwrite"),
            duration: duration(matches)?,
        },
    )?;
    finish(store.as_ref())?;

    if context.json {
        output::print_json(&output::phase_json(&report))?;
    } else {
        print!("{}", output::format_phase_human(&report));
    }
    Ok(ExitCode::Success)
}

fn compare(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    let store = context.open_store()?;
    let mut coordinator = context.coordinator(store.clone());

    let report = coordinator.compare(&CompareOptions {
        first_run_id: matches.get_one::<String>("first").cloned(),
        second_run_id: matches.get_one::<String>("second").cloned().unwrap_or_default(),
        analysis: analysis(matches, context, false),
        export: export(matches),
    })?;
    finish(store.as_ref())?;
    print_compare(&report, context)
}

fn export_monitor(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    let store = context.open_store()?;
    let mut coordinator = context.coordinator(store.clone());

    let report = coordinator.export_monitor(&ExportMonitorOptions {
        run_id: run_id(matches).unwrap_or_default(),
        analysis: analysis(matches, context, false),
        export: export(matches),
    })?;
    finish(store.as_ref())?;
    print_compare(&report, context)
}

fn guided(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    let store = context.open_store()?;
    let mut coordinator = context.coordinator(store.clone());
    let mut collectors = collectors(matches);
    let mut monitors = monitors(matches, context)?;
    let analysis = analysis(matches, context, true).unwrap_or_default();

    let report = coordinator.guided(
        &mut collectors,
        &mut monitors,
        &GuidedOptions {
            base_id: run_id(matches),
            overwrite: matches.get_flag("overwrite"),
            monitor_duration: duration(matches)?,
            analysis,
            export: export(matches),
        },
    )?;
    finish(store.as_ref())?;

    if context.json {
        output::print_json(&output::guided_json(&report))?;
    } else {
        print!("{}", output::format_guided_human(&report));
    }
    Ok(ExitCode::Success)
}

fn runs(context: &Context) -> Result<ExitCode> {
    let store = context.open_store()?;
    let runs = store.list_runs()?;
    finish(store.as_ref())?;

    if context.json {
        output::print_json(&runs)?;
    } else {
        print!("{}", output::format_runs_human(&runs));
    }
    Ok(ExitCode::Success)
}

fn delete_run(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    let run_id = matches.get_one::<String>("run-id").cloned().unwrap_or_default();
    let store = context.open_store()?;
    let deleted = store.delete_run(&run_id)?;
    finish(store.as_ref())?;

    if !deleted {
        return Err(ScanError::invalid_run_id(&run_id, "no such run").into());
    }
    if context.json {
        output::print_json(&json!({ "deleted": run_id }))?;
    } else if !context.quiet {
        println!("Deleted run {}", run_id);
    }
    Ok(ExitCode::Success)
}

fn verify_rules(matches: &ArgMatches, context: &Context) -> Result<ExitCode> {
    let source = matches
        .get_one::<PathBuf>("rules")
        .cloned()
        .map_or_else(|| context.settings.rule_source(), RuleSource::File);
    let rules = source.load().map_err(ScanError::from)?;
    let violations = validate_rule_set(&rules);
    let rules_source = source.to_string();

    if context.json {
        output::print_json(&json!({
            "rules_source": rules_source,
            "rule_count": rules.rules().len(),
            "violations": violations.iter().map(ToString::to_string).collect::<Vec<_>>(),
        }))?;
    } else {
        print!("{}", output::format_violations_human(&rules_source, &violations));
    }

    Ok(if violations.is_empty() {
        ExitCode::Success
    } else {
        ExitCode::InvalidRules
    })
}
