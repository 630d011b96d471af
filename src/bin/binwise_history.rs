//! binwise-history - inspect and maintain the detection history database

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use binwise::storage::{DetectionRecord, HistoryStore, NewFeedback};
use binwise::{AppConfig, SourceKind, SqliteHistoryStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// History database (defaults to the configured path).
    #[arg(long, env = "BINWISE_DB_PATH")]
    db: Option<String>,
    /// Print JSON instead of text.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List detection records, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// upload, camera or manual_save
        #[arg(long)]
        source: Option<SourceKind>,
    },
    /// Count detection records.
    Count {
        #[arg(long)]
        source: Option<SourceKind>,
    },
    /// Delete one detection record.
    Delete { id: i64 },
    /// Delete records older than the given number of days.
    Clear {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Write a stored image to a file.
    ExportImage {
        id: i64,
        path: PathBuf,
        /// Export the annotated result image instead of the original.
        #[arg(long)]
        result: bool,
    },
    /// User feedback on detections.
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommand,
    },
}

#[derive(Subcommand, Debug)]
enum FeedbackCommand {
    /// Record feedback on a prediction.
    Add {
        /// Item the feedback is about.
        item: String,
        /// Category the detector predicted.
        #[arg(long)]
        predicted: String,
        /// The prediction was wrong.
        #[arg(long)]
        incorrect: bool,
        /// Correct category when the prediction was wrong.
        #[arg(long)]
        correct: Option<String>,
        /// Satisfaction from 1 to 5.
        #[arg(long)]
        satisfaction: Option<u8>,
        #[arg(long)]
        comment: Option<String>,
        /// Detection record the feedback refers to.
        #[arg(long)]
        detection: Option<i64>,
    },
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Stats,
    Delete { id: i64 },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = AppConfig::load()?;
    let db_path = args.db.clone().unwrap_or_else(|| cfg.history.db_path.clone());
    let mut store = SqliteHistoryStore::open(&db_path)?;

    match args.command {
        Command::List {
            limit,
            offset,
            source,
        } => {
            let records = store.list_records(limit, offset, source)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no records");
            } else {
                for record in &records {
                    print_record(record);
                }
            }
        }
        Command::Count { source } => {
            println!("{}", store.count_records(source)?);
        }
        Command::Delete { id } => {
            if !store.delete_record(id)? {
                return Err(anyhow!("no record with id {}", id));
            }
            println!("deleted record {}", id);
        }
        Command::Clear { days } => {
            let days = days.unwrap_or(cfg.history.retention_days);
            let removed = store.clear_older_than(days)?;
            println!("removed {} records older than {} days", removed, days);
        }
        Command::ExportImage { id, path, result } => {
            let bytes = if result {
                store.result_image_data(id)?
            } else {
                store.image_data(id)?
            };
            let bytes = bytes.ok_or_else(|| anyhow!("record {} has no stored image", id))?;
            std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        Command::Feedback { command } => run_feedback(&mut store, command, args.json)?,
    }
    Ok(())
}

fn run_feedback(store: &mut SqliteHistoryStore, command: FeedbackCommand, json: bool) -> Result<()> {
    match command {
        FeedbackCommand::Add {
            item,
            predicted,
            incorrect,
            correct,
            satisfaction,
            comment,
            detection,
        } => {
            let id = store.save_feedback(NewFeedback {
                detection_id: detection,
                item_name: item,
                predicted_category: predicted,
                is_correct: !incorrect,
                correct_category: correct,
                satisfaction,
                comment,
            })?;
            println!("saved feedback {}", id);
        }
        FeedbackCommand::List { limit, offset } => {
            let feedback = store.list_feedback(limit, offset)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&feedback)?);
                return Ok(());
            }
            for fb in feedback {
                let verdict = if fb.is_correct {
                    "correct".to_string()
                } else {
                    format!("wrong, should be {}", fb.correct_category.as_deref().unwrap_or("?"))
                };
                println!(
                    "#{:<5} {:<20} predicted {:<12} {}{}",
                    fb.id,
                    fb.item_name,
                    fb.predicted_category,
                    verdict,
                    fb.satisfaction
                        .map(|s| format!(" ({}/5)", s))
                        .unwrap_or_default()
                );
            }
        }
        FeedbackCommand::Stats => {
            let stats = store.feedback_stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            println!(
                "{} responses, {} correct, {} incorrect ({:.2}% accuracy)",
                stats.total, stats.correct, stats.incorrect, stats.accuracy_pct
            );
            println!("average satisfaction {:.2}", stats.average_satisfaction);
            for category in &stats.by_category {
                println!(
                    "  {:<14} {}/{} ({:.2}%)",
                    category.category, category.correct, category.total, category.accuracy_pct
                );
            }
            for (score, count) in stats.satisfaction_distribution.iter().enumerate() {
                println!("  {} star: {}", score + 1, count);
            }
            let ids = store.feedback_detection_ids()?;
            if !ids.is_empty() {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                println!("records with feedback: {}", ids.join(", "));
            }
        }
        FeedbackCommand::Delete { id } => {
            if !store.delete_feedback(id)? {
                return Err(anyhow!("no feedback with id {}", id));
            }
            println!("deleted feedback {}", id);
        }
    }
    Ok(())
}

fn print_record(record: &DetectionRecord) {
    let items: Vec<String> = record
        .detections
        .iter()
        .map(|d| {
            let category = d.category.map(|c| c.label()).unwrap_or("Unknown category");
            format!("{} {:.2} ({})", d.display_name, d.confidence, category)
        })
        .collect();
    println!(
        "#{:<5} {:<11} t={} {:.3}s {} | {}",
        record.id,
        record.source_kind.as_str(),
        record.detected_at,
        record.processing_time_s,
        record.image_path,
        if items.is_empty() {
            "nothing detected".to_string()
        } else {
            items.join(", ")
        }
    );
}
