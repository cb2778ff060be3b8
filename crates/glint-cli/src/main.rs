use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glint_core::{AnalysisOutcome, IdentitySummary};

#[zbus::proxy(
    interface = "org.glint.Tracker1",
    default_service = "org.glint.Tracker1",
    default_path = "/org/glint/Tracker1"
)]
trait Tracker {
    async fn resolve_identity(&self, descriptor_json: &str) -> zbus::Result<(String, bool)>;
    async fn process_analysis(&self, request_json: &str) -> zbus::Result<String>;
    async fn identity_summary(&self, identity_id: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn adjustment_summary(&self, identity_id: &str) -> zbus::Result<String>;
    async fn statistics(&self) -> zbus::Result<String>;
    async fn export_report(&self, identity_id: &str) -> zbus::Result<String>;
    async fn reset(&self, confirm: bool) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "glint", about = "Glint longitudinal screening CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true, env = "GLINT_SESSION_BUS")]
    session: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one analysis (regions, findings and descriptors as JSON)
    Analyze {
        /// Path to the analysis request JSON file
        file: PathBuf,
    },
    /// Resolve a face descriptor to an identity
    Resolve {
        /// Path to a JSON array of descriptor values
        file: PathBuf,
    },
    /// Show the longitudinal summary for one identity
    Summary {
        /// Identity ID (e.g. child_0001)
        id: String,
    },
    /// List tracked identities, most urgent first
    List,
    /// Show tracking statistics
    Stats,
    /// Show how often history adjusted an identity's findings
    Adjustments {
        /// Identity ID
        id: String,
    },
    /// Export a longitudinal report for one identity
    Export {
        /// Identity ID
        id: String,
    },
    /// Irreversibly delete all identities and history
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(
        session = cli.session,
        unique_name = ?conn.unique_name(),
        "connected to D-Bus"
    );
    let proxy = TrackerProxy::new(&conn)
        .await
        .context("glintd is not reachable")?;

    match cli.command {
        Commands::Analyze { file } => {
            let request = read_json_file(&file)?;
            let outcome: AnalysisOutcome =
                serde_json::from_str(&proxy.process_analysis(&request).await?)?;
            print_outcome(&outcome);
        }
        Commands::Resolve { file } => {
            let descriptor = read_json_file(&file)?;
            let (id, is_new) = proxy.resolve_identity(&descriptor).await?;
            if is_new {
                println!("{id} (new identity)");
            } else {
                println!("{id}");
            }
        }
        Commands::Summary { id } => {
            let summary: IdentitySummary =
                serde_json::from_str(&proxy.identity_summary(&id).await?)?;
            print_summary(&summary);
        }
        Commands::List => {
            let summaries: Vec<IdentitySummary> =
                serde_json::from_str(&proxy.list_identities().await?)?;
            if summaries.is_empty() {
                println!("No identities tracked");
            }
            for s in &summaries {
                println!(
                    "{:<12} {:<10} {}/{} positive  {}",
                    s.identity_id,
                    s.urgency.as_str(),
                    s.positive_analyses,
                    s.total_analyses,
                    s.recommendation
                );
            }
        }
        Commands::Stats => print_pretty(&proxy.statistics().await?)?,
        Commands::Adjustments { id } => print_pretty(&proxy.adjustment_summary(&id).await?)?,
        Commands::Export { id } => {
            let path = proxy.export_report(&id).await?;
            println!("Report written to {path}");
        }
        Commands::Reset { yes } => {
            if !yes {
                anyhow::bail!("refusing to reset without --yes; this deletes all tracking data");
            }
            if proxy.reset(true).await? {
                println!("All identities and history have been reset");
            } else {
                println!("Reset was not performed");
            }
        }
        Commands::Status => print_pretty(&proxy.status().await?)?,
    }

    Ok(())
}

/// Read a file and check that it holds JSON before sending it over the bus.
fn read_json_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str::<serde_json::Value>(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(raw)
}

fn print_pretty(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_summary(s: &IdentitySummary) {
    println!("Identity:        {}", s.identity_id);
    println!("Analyses:        {} ({} positive)", s.total_analyses, s.positive_analyses);
    println!("Consistency:     {:.1}%", s.consistency_rate);
    println!("Urgency:         {}", s.urgency.as_str());
    println!("Recommendation:  {}", s.recommendation);
    if let (Some(first), Some(last)) = (s.first_seen, s.last_seen) {
        println!("Seen:            {} times, {first} to {last}", s.seen_count);
    }
    for entry in &s.recent_analyses {
        println!(
            "  {}  {:<24} {}/{} positive",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.image_reference,
            entry.summary.positive_detections,
            entry.summary.regions_analyzed
        );
    }
}

fn print_outcome(outcome: &AnalysisOutcome) {
    println!(
        "{} tracked ({} new, {} recognized), {} untracked, {} ms",
        outcome.tracked_faces,
        outcome.new_faces,
        outcome.recognized_faces,
        outcome.untracked_regions,
        outcome.processing_time_ms
    );
    for m in &outcome.mappings {
        println!("  region {:<10} -> {}", m.region_id, m.identity_id);
    }
    for f in &outcome.findings {
        let flipped = if f.detection_changed_by_history {
            " (detection changed by history)"
        } else {
            ""
        };
        println!(
            "  {:<10} detected={} confidence {:.1} (was {:.1}) risk {:?} urgency {}{flipped}",
            f.finding.region_id,
            f.finding.leukocoria_detected,
            f.finding.confidence,
            f.original_confidence,
            f.finding.risk_level,
            f.finding.urgency.as_str(),
        );
        for reason in &f.adjustment_reasoning {
            println!("      - {reason}");
        }
    }
}
