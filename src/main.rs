use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use tabled::{settings::Style, Table, Tabled};

use hrrs::config::PipelineConfig;
use hrrs::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use hrrs::models::{JudgmentLabel, Posture, QualityStatus, Session, Stratum};
use hrrs::pipeline::HrrPipeline;
use hrrs::store::Store;
use hrrs::trend::TrendAlert;

/// hrrs - Heart Rate Recovery Analysis CLI
///
/// Extracts recovery intervals from heart-rate sessions, fits exponential
/// decay curves, gates measurement quality, and watches per-stratum trends
/// for sustained recovery decline.
#[derive(Parser)]
#[command(name = "hrrs")]
#[command(version = "0.1.0")]
#[command(about = "Heart Rate Recovery Analysis CLI", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest sessions from a JSON file
    Ingest {
        /// Input file: a JSON array of sessions with samples
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Re-run extraction, fitting, and gating over stored sessions
    Reprocess {
        /// Limit to specific session ids (default: all sessions)
        #[arg(short, long)]
        session: Vec<String>,

        /// Suppress the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Show the recovery trend for one (stratum, posture) bucket
    Query {
        /// Stratum (strength, endurance, intervals, mixed)
        #[arg(short, long)]
        stratum: String,

        /// Posture (standing, seated, supine)
        #[arg(short, long, default_value = "standing")]
        posture: String,

        /// Date range start (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Date range end (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
    },

    /// Record a peak-time correction for one interval
    AdjustPeak {
        #[arg(short, long)]
        session: String,

        #[arg(short, long)]
        ordinal: u32,

        /// Shift in seconds (negative moves the peak earlier)
        #[arg(long, allow_hyphen_values = true)]
        shift: f64,

        /// Why the detected peak is wrong
        #[arg(short, long)]
        reason: String,
    },

    /// Force an interval's quality status
    Override {
        #[arg(short, long)]
        session: String,

        #[arg(short, long)]
        ordinal: u32,

        /// Forced status (pass, rejected)
        #[arg(long)]
        status: String,

        /// Why the gate's decision is wrong
        #[arg(short, long)]
        reason: String,
    },

    /// Label a gate decision for accuracy tracking (TP, FP, TN, FN)
    Judge {
        #[arg(short, long)]
        session: String,

        #[arg(short, long)]
        ordinal: u32,

        /// Judgment label (TP, FP, TN, FN)
        #[arg(short, long)]
        label: String,

        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Show the standing gate-accuracy report
    Accuracy,

    /// Check annotations against the current interval set
    Integrity,

    /// Show store counts and per-bucket baselines
    Status,

    /// Write the active configuration to a TOML file
    Config {
        /// Output path (default: the standard config location)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct SeriesRow {
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Weighted HRR60")]
    value: String,
}

#[derive(Tabled)]
struct BaselineRow {
    #[tabled(rename = "Stratum")]
    stratum: String,
    #[tabled(rename = "Posture")]
    posture: String,
    #[tabled(rename = "Mean")]
    mean: String,
    #[tabled(rename = "SDD")]
    sdd: String,
    #[tabled(rename = "N")]
    count: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LogLevel::Warn,
        1 => LogLevel::Info,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    let format = cli
        .log_format
        .parse::<LogFormat>()
        .map_err(|e| anyhow!(e))?;
    init_logging(&LogConfig { level, format, ..Default::default() })?;

    let config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    config.validate().map_err(|e| anyhow!("invalid configuration: {}", e))?;
    let pipeline = HrrPipeline::new(config);

    let db_path = match &cli.db {
        Some(p) => p.clone(),
        None => default_db_path()?,
    };
    let mut store = Store::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    match cli.command {
        Commands::Ingest { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let sessions: Vec<Session> =
                serde_json::from_str(&raw).context("failed to parse session JSON")?;
            for session in &sessions {
                store.put_session(session)?;
            }
            println!(
                "{}",
                format!("Ingested {} session(s)", sessions.len()).green().bold()
            );
        }

        Commands::Reprocess { session, no_progress } => {
            let ids = if session.is_empty() { None } else { Some(session.as_slice()) };
            let abort = AtomicBool::new(false);
            let summary = pipeline.reprocess(&mut store, ids, &abort, !no_progress)?;

            println!(
                "{}",
                format!(
                    "Processed {} session(s), wrote {} interval(s)",
                    summary.sessions_processed, summary.intervals_written
                )
                .green()
                .bold()
            );
            for (id, reason) in &summary.sessions_skipped {
                println!("  {} {}: {}", "skipped".yellow(), id, reason);
            }
            for alert in &summary.alerts {
                println!(
                    "  {} {}/{} at {}: {}",
                    "alert".red().bold(),
                    alert.stratum,
                    alert.posture,
                    alert.time.format("%Y-%m-%d"),
                    describe_alert(&alert.alert)
                );
            }
            if !summary.integrity.is_clean() {
                println!(
                    "  {} {} annotation(s) no longer match any interval (run `hrrs integrity`)",
                    "warning".yellow().bold(),
                    summary.integrity.total_unlinked()
                );
            }
        }

        Commands::Query { stratum, posture, from, to } => {
            let stratum = stratum.parse::<Stratum>().map_err(|e| anyhow!(e))?;
            let posture = posture.parse::<Posture>().map_err(|e| anyhow!(e))?;
            let from = from.as_deref().map(parse_date).transpose()?;
            let to = to.as_deref().map(parse_date).transpose()?;

            let report = pipeline.query(&store, stratum, posture, from, to)?;

            println!("{}", format!("Recovery trend: {} / {}", stratum, posture).bold());
            if report.series.is_empty() {
                println!("  No actionable intervals in range.");
                return Ok(());
            }

            let rows: Vec<SeriesRow> = report
                .series
                .iter()
                .map(|o| SeriesRow {
                    date: o.time.format("%Y-%m-%d %H:%M").to_string(),
                    value: format!("{:.1}", o.value),
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{}", table);

            match (&report.baseline, &report.state) {
                (Some(baseline), Some(state)) => {
                    println!(
                        "  Baseline: {:.1} bpm (SDD {:.2}, n={})",
                        baseline.mean, baseline.sdd, baseline.count
                    );
                    if let Some(level) = state.ewma_level {
                        println!("  EWMA level: {:.1}", level);
                    }
                    println!("  CUSUM accumulator: {:.2}", state.cusum_acc);
                    if state.cusum_alerting {
                        println!("  {}", "Sustained recovery decline in progress".red().bold());
                    }
                    for (time, alert) in &report.alerts {
                        println!(
                            "  {} {}: {}",
                            "alert".red(),
                            time.format("%Y-%m-%d"),
                            describe_alert(alert)
                        );
                    }
                }
                _ => {
                    println!(
                        "  {}",
                        "Insufficient data: no baseline yet for this bucket".yellow()
                    );
                }
            }
        }

        Commands::AdjustPeak { session, ordinal, shift, reason } => {
            pipeline.adjust_peak(&mut store, &session, ordinal, shift, &reason)?;
            println!(
                "{}",
                format!(
                    "Peak adjustment recorded for {}#{} ({:+.1}s); run `hrrs reprocess -s {}` to apply",
                    session, ordinal, shift, session
                )
                .green()
            );
        }

        Commands::Override { session, ordinal, status, reason } => {
            let status = status.parse::<QualityStatus>().map_err(|e| anyhow!(e))?;
            let ov = pipeline.override_quality(&mut store, &session, ordinal, status, &reason)?;
            println!(
                "{}",
                format!(
                    "Override recorded for {}#{}: {} (was {})",
                    session,
                    ordinal,
                    ov.forced_status,
                    ov.prior_status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string())
                )
                .green()
            );
        }

        Commands::Judge { session, ordinal, label, notes } => {
            let label = label.parse::<JudgmentLabel>().map_err(|e| anyhow!(e))?;
            pipeline.judge(&mut store, &session, ordinal, label, notes.as_deref())?;
            println!("{}", format!("Judgment recorded: {}#{} = {}", session, ordinal, label).green());
        }

        Commands::Accuracy => {
            let report = pipeline.accuracy(&store)?;
            println!("{}", "Gate accuracy".bold());
            println!(
                "  TP {}  FP {}  TN {}  FN {}  (n={})",
                report.true_positives,
                report.false_positives,
                report.true_negatives,
                report.false_negatives,
                report.total()
            );
            let pct = |v: Option<f64>| match v {
                Some(x) => format!("{:.1}%", x * 100.0),
                None => "n/a".to_string(),
            };
            println!(
                "  precision {}  recall {}  F1 {}",
                pct(report.precision()),
                pct(report.recall()),
                pct(report.f1())
            );
        }

        Commands::Integrity => {
            let report = pipeline.integrity(&store)?;
            if report.is_clean() {
                println!("{}", "All annotations link to current intervals".green().bold());
            } else {
                println!(
                    "{}",
                    format!("{} unlinked annotation(s)", report.total_unlinked()).red().bold()
                );
                let show = |kind: &str, keys: &[(String, u32)]| {
                    for (session, ordinal) in keys {
                        println!("  {} {}#{}", kind.yellow(), session, ordinal);
                    }
                };
                show("adjustment", &report.unlinked_adjustments);
                show("override", &report.unlinked_overrides);
                show("judgment", &report.unlinked_judgments);
            }
        }

        Commands::Status => {
            let stats = store.stats()?;
            println!("{}", format!("Database: {}", db_path.display()).bold());
            println!(
                "  {} session(s), {} interval(s), {} adjustment(s), {} override(s), {} judgment(s)",
                stats.session_count,
                stats.interval_count,
                stats.adjustment_count,
                stats.override_count,
                stats.judgment_count
            );

            let mut rows: Vec<BaselineRow> = Vec::new();
            for stratum in [Stratum::Strength, Stratum::Endurance, Stratum::Intervals, Stratum::Mixed] {
                for posture in [Posture::Standing, Posture::Seated, Posture::Supine] {
                    if let Some(b) = store.load_baseline(stratum, posture)? {
                        rows.push(BaselineRow {
                            stratum: stratum.to_string(),
                            posture: posture.to_string(),
                            mean: format!("{:.1}", b.mean),
                            sdd: format!("{:.2}", b.sdd),
                            count: b.count,
                        });
                    }
                }
            }
            if rows.is_empty() {
                println!("  No bucket baselines yet.");
            } else {
                let mut table = Table::new(rows);
                table.with(Style::rounded());
                println!("{}", table);
            }
        }

        Commands::Config { output } => {
            let path = match output {
                Some(p) => p,
                None => PipelineConfig::default_path()
                    .ok_or_else(|| anyhow!("no standard config directory on this platform"))?,
            };
            pipeline.config().save(&path)?;
            println!("{}", format!("Configuration written to {}", path.display()).green());
        }
    }

    Ok(())
}

fn default_db_path() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .map(|d| d.join("hrrs"))
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir.join("hrrs.db"))
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))?;
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid date '{}'", s))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn describe_alert(alert: &TrendAlert) -> String {
    match alert {
        TrendAlert::EwmaLow { level, threshold } => {
            format!("smoothed level {:.1} fell below {:.1}", level, threshold)
        }
        TrendAlert::CusumShift { accumulator, threshold } => {
            format!("cumulative decline {:.1} exceeded {:.1}", accumulator, threshold)
        }
    }
}
