#![deny(unsafe_code)]

//! parsekit CLI: operate the grammar cache and parse files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parsekit_config::AppConfig;
use parsekit_core::cache::EvictionPolicy;
use parsekit_core::{BatchOptions, ParseService, build_info};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// parsekit: grammar artifact cache and parsing backend selection.
#[derive(Debug, Parser)]
#[command(name = "parsekit", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "parsekit.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download every Tier-1 grammar.
    Preload,

    /// Make sure one language's grammar is cached and verified.
    Ensure {
        language: String,
    },

    /// Re-hash a cached grammar against its record.
    Verify {
        language: String,
    },

    /// Run an eviction pass.
    Evict {
        /// Size budget in bytes; defaults to `cache.budget_bytes`.
        #[arg(long)]
        max_bytes: Option<u64>,

        /// Idle limit for Tier-2/3 grammars; defaults to `cache.max_age_secs`.
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Show cached grammars and cache health.
    Status,

    /// Remove every cached grammar.
    Clear,

    /// Probe parsing backends and show the one selected.
    Backend,

    /// Parse files on the selected backend.
    Parse {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Files parsed at once.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Stop at the first file that fails.
        #[arg(long)]
        fail_fast: bool,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// List configured languages.
    Languages,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let loaded = load_config(&cli.config).await;
    let level = loaded
        .as_ref()
        .map(|(config, _)| config.logging.level.as_str())
        .unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(filter_directive(cli.verbose, level))),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config, found) = loaded?;
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }
    info!(version = %build_info::version_string(), "parsekit starting");

    match cli.command {
        Commands::Config { show } => cmd_config(&config, &cli.config, show),
        Commands::Languages => cmd_languages(&config, cli.json),
        command => {
            let service = ParseService::open(config)
                .await
                .context("failed to open grammar cache")?;
            run(&service, command, cli.json).await
        }
    }
}

/// Log filter from `-v` count, falling back to the configured level.
fn filter_directive(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid configuration at {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

async fn run(service: &ParseService, command: Commands, json: bool) -> Result<ExitCode> {
    match command {
        Commands::Preload => {
            let report = service.preload().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for language in &report.ready {
                    println!("ready   {language}");
                }
                for (language, reason) in &report.failed {
                    println!("failed  {language}: {reason}");
                }
            }
            Ok(exit_status(report.is_complete()))
        }
        Commands::Ensure { language } => {
            let path = service.ensure(&language).await?;
            if json {
                println!("{}", json!({ "language": language, "path": path }));
            } else {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { language } => {
            let intact = service.cache().verify(&language).await;
            if json {
                println!("{}", json!({ "language": language, "verified": intact }));
            } else if intact {
                println!("{language}: verified");
            } else {
                println!("{language}: NOT verified");
            }
            Ok(exit_status(intact))
        }
        Commands::Evict {
            max_bytes,
            max_age_secs,
        } => {
            let mut policy: EvictionPolicy = service.cache().eviction_policy().clone();
            if let Some(bytes) = max_bytes {
                policy = policy.with_budget(bytes);
            }
            if let Some(secs) = max_age_secs {
                policy = policy.with_max_age(Duration::from_secs(secs));
            }
            let report = service.cache().evict(&policy).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for evicted in &report.evicted {
                    println!(
                        "evicted {} (tier {}, {} bytes, {:?})",
                        evicted.language,
                        evicted.tier.number(),
                        evicted.size_bytes,
                        evicted.reason
                    );
                }
                println!(
                    "{} bytes freed, {} bytes remain",
                    report.bytes_freed(),
                    report.bytes_after
                );
            }
            if !report.budget_satisfied {
                warn!("Cache is still over budget");
            }
            Ok(exit_status(report.budget_satisfied))
        }
        Commands::Status => {
            let snapshot = service.cache().describe_cache().await;
            let health = service.cache().health().await;
            if json {
                let out = json!({ "artifacts": snapshot, "health": health });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for (language, record) in &snapshot {
                    match record {
                        Some(r) => println!(
                            "{language:<12} tier {} {:>10} bytes  {:<8} {} (accessed {}x)",
                            r.tier.number(),
                            r.size_bytes,
                            format!("{:?}", r.integrity_state).to_lowercase(),
                            r.source_kind,
                            r.access_count
                        ),
                        None => println!("{language:<12} not cached"),
                    }
                }
                println!(
                    "{} verified, {} pending, {} failed, {} missing, {} bytes",
                    health.verified.len(),
                    health.pending.len(),
                    health.failed.len(),
                    health.missing.len(),
                    health.total_bytes
                );
                if !health.missing_tier1.is_empty() {
                    println!("missing Tier-1: {}", health.missing_tier1.join(", "));
                }
            }
            Ok(exit_status(health.is_healthy()))
        }
        Commands::Clear => {
            let removed = service.cache().clear().await?;
            println!("removed {removed} cached grammars");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backend => {
            let capabilities = service.capabilities().await;
            let selected = service.backend().await;
            if json {
                let out = json!({
                    "capabilities": capabilities,
                    "selected": selected.as_ref().ok().map(|h| h.kind()),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for c in &capabilities {
                    let state = if c.available { "available" } else { "unavailable" };
                    println!("{:<17} {state:<12} {}", c.backend_kind.to_string(), c.message);
                }
                if let Ok(handle) = &selected {
                    println!("selected: {}", handle.kind());
                }
            }
            selected?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Parse {
            paths,
            concurrency,
            fail_fast,
        } => {
            let mut options = BatchOptions::default().with_concurrency(concurrency);
            if fail_fast {
                options = options.fail_fast();
            }
            let results = service.parse_files(paths, options).await?;
            let failed = results.values().filter(|o| o.is_err()).count();
            if json {
                let out: serde_json::Map<String, serde_json::Value> = results
                    .iter()
                    .map(|(path, outcome)| {
                        let value = match outcome {
                            Ok(parsed) => json!({ "success": true, "data": parsed }),
                            Err(failure) => json!({
                                "success": false,
                                "kind": failure.kind,
                                "error": failure.message,
                            }),
                        };
                        (path.display().to_string(), value)
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for (path, outcome) in &results {
                    match outcome {
                        Ok(parsed) => {
                            println!(
                                "{} ({}, {} nodes)",
                                path.display(),
                                parsed.language,
                                parsed.nodes.len()
                            );
                            for node in &parsed.nodes {
                                println!(
                                    "  {} {:<10} {:<24} {}-{}",
                                    node.id,
                                    node.kind,
                                    node.name.as_deref().unwrap_or("-"),
                                    node.span.start_line,
                                    node.span.end_line
                                );
                            }
                        }
                        Err(failure) => println!("{}: {failure}", path.display()),
                    }
                }
            }
            Ok(exit_status(failed == 0))
        }
        Commands::Config { .. } | Commands::Languages => Ok(ExitCode::SUCCESS),
    }
}

fn exit_status(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn cmd_config(config: &AppConfig, path: &Path, show: bool) -> Result<ExitCode> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render configuration")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_languages(config: &AppConfig, json: bool) -> Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.languages)?);
        return Ok(ExitCode::SUCCESS);
    }
    for (name, profile) in &config.languages {
        let extensions: Vec<&str> = profile.file_extensions.iter().map(String::as_str).collect();
        println!(
            "{name:<12} tier {}  [{}]  {}",
            profile.tier.number(),
            extensions.join(", "),
            if profile.expected_hash.is_some() { "pinned" } else { "unpinned" }
        );
    }
    Ok(ExitCode::SUCCESS)
}
