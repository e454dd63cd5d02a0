//! PKM CLI
//!
//! Command-line interface for inspecting the capture pipeline and managing
//! procedural rules.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use pkm_core::{Condition, ProceduralMemory, ProceduralRule, RuleAction, RuleType, Storage};

/// PKM Assistant - personal-knowledge capture pipeline CLI
#[derive(Parser)]
#[command(name = "pkm")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the PKM assistant capture pipeline")]
struct Cli {
    /// Custom data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the running daemon's status endpoint
    Status,

    /// Show episodic-memory statistics
    Stats,

    /// Manage procedural rules
    Rules {
        #[command(subcommand)]
        command: RuleCommands,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List all rules with usage counters
    List,

    /// Add a rule
    Add {
        /// Rule name
        name: String,
        /// Condition as JSON, e.g. '{"field":"url","comparator":"contains","value":"facebook.com"}'
        #[arg(long)]
        condition: String,
        /// Action: accept, reject, priority_boost, or tag:<value>
        #[arg(long)]
        action: String,
        /// Rule type: domain, content_pattern, metadata, custom
        #[arg(long, default_value = "custom")]
        rule_type: String,
        /// Higher priority evaluates first
        #[arg(long, default_value = "0")]
        priority: i64,
    },

    /// Enable a rule by id
    Enable { id: String },

    /// Disable a rule by id
    Disable { id: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => run_status(),
        Commands::Stats => run_stats(cli.data_dir),
        Commands::Rules { command } => run_rules(cli.data_dir, command),
    }
}

fn open_storage(data_dir: Option<PathBuf>) -> anyhow::Result<Storage> {
    let db_path = data_dir.map(|d| d.join("pkm.db"));
    Ok(Storage::new(db_path)?)
}

fn run_status() -> anyhow::Result<()> {
    let port_file = std::env::temp_dir().join("pkm_assistant_port.txt");
    let port: u16 = match std::fs::read_to_string(&port_file)
        .ok()
        .and_then(|t| t.trim().parse().ok())
    {
        Some(p) => p,
        None => {
            println!("{}", "Daemon is not running (no advertised port).".yellow());
            return Ok(());
        }
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let status: serde_json::Value = runtime.block_on(async {
        reqwest::get(format!("http://127.0.0.1:{}/status", port))
            .await?
            .json()
            .await
    })?;

    println!("{}", "PKM Assistant Daemon".bold());
    println!(
        "  status:       {}",
        status["status"].as_str().unwrap_or("?").green()
    );
    println!("  version:      {}", status["version"].as_str().unwrap_or("?"));
    println!("  port:         {}", port);
    println!("  uptime:       {}s", status["uptime_seconds"]);
    println!("  queue depth:  {}", status["queue_depth"]);
    println!("  open tabs:    {}", status["open_tabs"]);
    println!(
        "  orphans:      {} waiting, {} expired",
        status["orphans"]["waiting"], status["orphans"]["expired"]
    );
    println!(
        "  filter:       {} processed, {} accepted, {} rejected",
        status["filter"]["processed"], status["filter"]["accepted"], status["filter"]["rejected"]
    );
    Ok(())
}

fn run_stats(data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let storage = open_storage(data_dir)?;
    let store = storage.stats()?;
    let episodes = storage.episode_statistics()?;

    println!("{}", "Store".bold());
    println!("  visits:    {}", store.visits);
    println!("  analysed:  {}", store.analysed);
    println!("  trees:     {}", store.trees);
    println!("  rules:     {}", store.rules);
    println!();
    println!("{}", "Episodic memory".bold());
    println!("  episodes:        {}", episodes.total);
    println!("  corrections:     {}", episodes.corrections);
    println!(
        "  false positives: {}",
        episodes.false_positives.to_string().red()
    );
    println!(
        "  false negatives: {}",
        episodes.false_negatives.to_string().red()
    );
    if !episodes.corrections_by_type.is_empty() {
        println!("  corrections by type:");
        for (page_type, count) in &episodes.corrections_by_type {
            println!("    {:16} {}", page_type, count);
        }
    }
    Ok(())
}

fn run_rules(data_dir: Option<PathBuf>, command: RuleCommands) -> anyhow::Result<()> {
    let storage = std::sync::Arc::new(open_storage(data_dir)?);

    match command {
        RuleCommands::List => {
            let rules = storage.list_rules()?;
            if rules.is_empty() {
                println!("No rules defined.");
                return Ok(());
            }
            for rule in rules {
                let state = if rule.enabled {
                    "enabled".green()
                } else {
                    "disabled".red()
                };
                println!(
                    "{} [{}] {} (priority {}, used {}x)",
                    rule.id.dimmed(),
                    state,
                    rule.name.bold(),
                    rule.priority,
                    rule.usage_count
                );
            }
        }
        RuleCommands::Add {
            name,
            condition,
            action,
            rule_type,
            priority,
        } => {
            let condition: Condition = serde_json::from_str(&condition)
                .map_err(|e| anyhow::anyhow!("invalid condition JSON: {}", e))?;
            let action = parse_action(&action)?;
            let rule = ProceduralRule::new(
                name,
                RuleType::parse_name(&rule_type),
                condition,
                action,
                priority,
            );

            // Route through ProceduralMemory so a broken condition is
            // caught (and reported) immediately.
            let memory = ProceduralMemory::new(storage)?;
            memory.add_rule(&rule)?;
            for (id, error) in memory.quarantined() {
                if id == rule.id {
                    anyhow::bail!("rule does not compile: {}", error);
                }
            }
            println!("Added rule {} ({})", rule.name.bold(), rule.id.dimmed());
        }
        RuleCommands::Enable { id } => {
            storage.set_rule_enabled(&id, true)?;
            println!("Rule {} enabled", id.dimmed());
        }
        RuleCommands::Disable { id } => {
            storage.set_rule_enabled(&id, false)?;
            println!("Rule {} disabled", id.dimmed());
        }
    }
    Ok(())
}

fn parse_action(raw: &str) -> anyhow::Result<RuleAction> {
    let action = match raw {
        "accept" => RuleAction::Accept,
        "reject" => RuleAction::Reject,
        "priority_boost" => RuleAction::PriorityBoost,
        other => match other.strip_prefix("tag:") {
            Some(tag) if !tag.is_empty() => RuleAction::Tag(tag.to_string()),
            _ => anyhow::bail!(
                "unknown action '{}'; expected accept, reject, priority_boost, or tag:<value>",
                other
            ),
        },
    };
    Ok(action)
}
