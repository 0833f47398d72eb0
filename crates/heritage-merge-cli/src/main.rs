mod commands;
mod logging;
mod progress;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::process;

use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use heritage_merge_core::api::handle_json;
use heritage_merge_core::config::load_configuration;
use heritage_merge_core::{AppConfig, EntityType, MergeEngine, MergeReport, MergeRequest};
use progress::CliReporter;
use tracing::{error, info};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let mut config = match load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let result = match args.command {
        Some(Commands::FindDuplicates {
            entity,
            threshold,
            scope,
            json,
            limit,
        }) => run_find_duplicates(&config, entity, threshold, scope.as_deref(), json, limit),
        Some(Commands::Review { entity, scope }) => run_review(&config, entity, scope.as_deref()),
        Some(Commands::Merge {
            entity,
            winner,
            losers,
            field_policy,
            reference_policy,
            allow_cross_scope,
            overrides,
            execute,
            yes,
        }) => parse_overrides(&overrides).and_then(|overrides| {
            let mut request = MergeRequest::new(entity, &winner, losers)
                .with_field_policy(field_policy)
                .with_reference_policy(reference_policy)
                .allow_cross_scope(allow_cross_scope);
            request.field_overrides = overrides;
            run_merge(&config, &request, execute, yes)
        }),
        Some(Commands::Apply { input }) => run_apply(&config, &input),
        Some(Commands::CheckSchema) => run_check_schema(&config),
        Some(Commands::PrintConfig) => serde_json::to_string_pretty(&config)
            .map(|text| println!("{}", text))
            .map_err(Into::into),
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {}", err);
        process::exit(1);
    }
}

fn run_find_duplicates(
    config: &AppConfig,
    entity: EntityType,
    threshold: Option<f64>,
    scope: Option<&str>,
    json: bool,
    limit: usize,
) -> CliResult {
    let engine = MergeEngine::from_config(config)?;
    let reporter = CliReporter::new();
    let scan = engine.find_duplicates_with(entity, scope, threshold, &reporter)?;

    if json {
        let candidates: Vec<_> = scan.candidates().take(limit).collect();
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }

    let mut shown = 0;
    for candidate in scan.candidates().take(limit) {
        shown += 1;
        println!(
            "{} {}",
            format!("{:.2}", candidate.similarity_score).cyan(),
            candidate.record_ids.join(", ")
        );
    }
    info!(
        "{} candidate(s) shown from {} {} records with {} distinct labels (threshold {:.2}), {} need review",
        format!("{}", shown).red(),
        scan.records_scanned(),
        entity,
        scan.label_count(),
        scan.threshold(),
        format!("{}", scan.needs_review().len()).yellow(),
    );
    Ok(())
}

fn run_review(config: &AppConfig, entity: EntityType, scope: Option<&str>) -> CliResult {
    let engine = MergeEngine::from_config(config)?;
    let scan = engine.find_duplicates(entity, scope, None)?;
    for item in scan.needs_review() {
        println!(
            "{} [{}] {:?}",
            item.id.yellow(),
            item.tree_scope.as_deref().unwrap_or(""),
            item.label
        );
    }
    info!("{} {} record(s) need review", scan.needs_review().len(), entity);
    Ok(())
}

fn run_merge(config: &AppConfig, request: &MergeRequest, execute: bool, yes: bool) -> CliResult {
    let engine = MergeEngine::from_config(config)?;
    let preview = engine.preview(request)?;
    print_report(&preview);

    if !execute {
        info!("Preview only; rerun with --execute to merge");
        return Ok(());
    }
    if !yes
        && !prompt_confirm(
            &format!(
                "Merge {} into {} {} and delete them?",
                preview.deleted_ids.join(", "),
                request.entity_type,
                request.winner_id
            ),
            Some(false),
        )?
    {
        return Ok(());
    }

    let reporter = CliReporter::new();
    let report = engine.execute_with(request, &reporter)?;
    print_report(&report);
    Ok(())
}

fn run_apply(config: &AppConfig, input: &str) -> CliResult {
    let text = if input == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    let engine = MergeEngine::from_config(config)?;
    println!("{}", handle_json(&engine, &text)?);
    Ok(())
}

fn run_check_schema(config: &AppConfig) -> CliResult {
    let engine = MergeEngine::from_config(config)?;
    for (entity_type, entity) in &engine.schema().entities {
        println!(
            "  {} {} ({}): {} fields, {} dependent column(s)",
            "✓".green(),
            entity_type,
            entity.table,
            entity.fields.len(),
            entity.dependents.len()
        );
    }
    info!("Schema mapping matches {}", config.database_path);
    Ok(())
}

/// `FIELD=ID` pairs from `--override`.
fn parse_overrides(values: &[String]) -> Result<BTreeMap<String, String>, Box<dyn std::error::Error>> {
    values
        .iter()
        .map(|value| match value.split_once('=') {
            Some((field, id)) if !field.is_empty() && !id.is_empty() => {
                Ok((field.trim().to_string(), id.trim().to_string()))
            }
            _ => Err(format!("invalid override '{}', expected FIELD=ID", value).into()),
        })
        .collect()
}

fn print_report(report: &MergeReport) {
    let heading = if report.committed {
        "Merged".green().bold()
    } else {
        "Preview".cyan().bold()
    };
    println!(
        "{} {} {} <- {}",
        heading,
        report.entity_type,
        report.winner_id,
        report.deleted_ids.join(", ")
    );
    for (table, count) in &report.rewritten_counts {
        println!("  {:<14} {} reference(s)", table, count);
    }
    for (name, value) in report.final_fields.iter() {
        println!("  {:<14} {}", name.dimmed(), value);
    }
    for row in &report.collapsed {
        println!(
            "  {} {}: {} -> {}",
            "collapse".yellow(),
            row.table,
            row.removed.join(", "),
            row.kept
        );
    }
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow(), warning);
    }
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
