use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use leadflow::config::PipelineConfig;
use leadflow::drafting::{Drafter, DraftReviewer, DraftWriter, TemplateStore, content_gate};
use leadflow::escalation::{Escalator, HttpTaskSink, Notifier, TaskSink, TelegramNotifier};
use leadflow::leads::{Stage, StageTracker};
use leadflow::llm::{LlmProvider, build_router};
use leadflow::mail::ImapSource;
use leadflow::pipeline::{Orchestrator, PipelineServices, pipeline_stats, recent_messages};
use leadflow::research::{DomainResearcher, HttpFetcher, SystemResolver};
use leadflow::scoring::{LeadScorer, Rubric};
use leadflow::store::{Database, LibSqlBackend, StoredMessage};

/// Inbound email lead pipeline
#[derive(Parser)]
#[command(name = "leadflow", version, about, long_about = None)]
struct Cli {
    /// Config file (overrides $LEADFLOW_CONFIG and ./leadflow.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations
    Init,

    /// Poll mailboxes and run new mail through the pipeline
    Poll {
        /// Only this account
        #[arg(long)]
        account: Option<String>,
        /// Keep polling every `polling.interval_secs` until Ctrl-C
        #[arg(long)]
        watch: bool,
    },

    /// Message totals and rubric drift
    Stats,

    /// Recent messages
    List {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        /// Leads only
        #[arg(long)]
        leads: bool,
    },

    /// Move a lead to another stage
    Stage {
        #[arg(long)]
        message: i64,
        #[arg(long)]
        to: String,
        #[arg(long)]
        reason: Option<String>,
        /// Recorded as the actor in the audit trail
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Stage audit trail for a message (or its whole thread)
    Audit {
        #[arg(long)]
        message: i64,
        #[arg(long)]
        thread: bool,
    },

    /// Rescore messages under the current rubric
    Rescore {
        /// Rescore clean messages received on or after this date (YYYY-MM-DD).
        /// Without it, only messages scored under an older rubric.
        #[arg(long)]
        since: Option<NaiveDate>,
    },

    /// Research a sender domain
    Research {
        #[arg(long)]
        domain: String,
    },

    /// Generate a reply draft for a scored lead
    Draft {
        #[arg(long)]
        message: i64,
    },

    /// Escalate a scored lead
    Escalate {
        #[arg(long)]
        message: i64,
    },

    /// Check text against the draft content gate
    Gate {
        #[arg(long)]
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let _log_guard = init_tracing();
    let cli = Cli::parse();

    // The gate needs no configuration.
    if let Commands::Gate { text } = &cli.command {
        return print_json(&content_gate(text));
    }

    let config_path = PipelineConfig::resolve_path(cli.config.as_deref());
    let config = PipelineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database.path)
            .await
            .with_context(|| format!("opening database {}", config.database.path.display()))?,
    );

    match cli.command {
        Commands::Init => {
            eprintln!("Database ready at {}", config.database.path.display());
        }
        Commands::Poll { account, watch } => {
            let orchestrator = Arc::new(orchestrator(&config, db)?);
            if watch {
                let shutdown = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Ctrl-C received, stopping after this cycle");
                        flag.store(true, Ordering::Relaxed);
                    }
                });
                orchestrator
                    .run(Duration::from_secs(config.polling.interval_secs), shutdown)
                    .await;
            } else if let Some(account) = account {
                print_json(&orchestrator.poll_with_retry(&account).await)?;
            } else {
                print_json(&orchestrator.poll_all().await)?;
            }
        }
        Commands::Stats => {
            let rubric = Rubric::load(&config.scoring.rubric_path)?;
            print_json(&pipeline_stats(db.as_ref(), rubric.version()).await?)?;
        }
        Commands::List { hours, leads } => {
            let messages = recent_messages(db.as_ref(), hours, leads).await?;
            for msg in &messages {
                println!("{}", summary_line(msg));
            }
            eprintln!("{} message(s)", messages.len());
        }
        Commands::Stage {
            message,
            to,
            reason,
            by,
        } => {
            let to: Stage = to.parse()?;
            let change = StageTracker::new(db)
                .change_stage(message, to, &by, reason.as_deref())
                .await?;
            print_json(&change)?;
        }
        Commands::Audit { message, thread } => {
            let tracker = StageTracker::new(Arc::clone(&db));
            let entries = if thread {
                let msg = db
                    .get_message(message)
                    .await?
                    .with_context(|| format!("message {message} not found"))?;
                let thread_id = msg.thread_id.unwrap_or(msg.message_id);
                tracker.thread_audit_trail(&thread_id).await?
            } else {
                tracker.audit_trail(message).await?
            };
            print_json(&entries)?;
        }
        Commands::Rescore { since } => {
            let rubric = Rubric::load(&config.scoring.rubric_path)?;
            let llm = llm(&config)?;
            let scorer = LeadScorer::new(llm, &config.scoring.model, rubric);
            let since = since
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|d| Utc.from_utc_datetime(&d));
            print_json(&scorer.rescore(db.as_ref(), since).await?)?;
        }
        Commands::Research { domain } => {
            let researcher = DomainResearcher::new(
                db,
                Arc::new(SystemResolver),
                Arc::new(HttpFetcher::new(
                    config.research.fetch_timeout(),
                    config.research.max_page_size_kb,
                )),
                config.research.cache_days,
            );
            print_json(&researcher.research(&domain).await?)?;
        }
        Commands::Draft { message } => {
            let llm = llm(&config)?;
            let drafter = Drafter::new(
                Arc::clone(&db),
                TemplateStore::from_dir(&config.drafting.templates_dir),
                DraftWriter::new(Arc::clone(&llm), &config.drafting.writer_model),
                DraftReviewer::new(llm, &config.drafting.reviewer_model),
            );
            let msg = db
                .get_message(message)
                .await?
                .with_context(|| format!("message {message} not found"))?;
            match drafter.generate(&msg).await? {
                Some(outcome) => print_json(&outcome)?,
                None => eprintln!("Message {message} is not a lead; no draft generated"),
            }
        }
        Commands::Escalate { message } => {
            let (notifier, tasks) = channels(&config);
            let escalator = Escalator::new(db, notifier, tasks);
            print_json(&escalator.escalate(message).await?)?;
        }
        Commands::Gate { .. } => {}
    }
    Ok(())
}

/// stderr logging, plus a daily-rolling file under `LEADFLOW_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("LEADFLOW_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "leadflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn llm(config: &PipelineConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let router = build_router(
        &config.llm,
        &[
            config.scoring.model.as_str(),
            config.quarantine.scanner_model.as_str(),
            config.drafting.writer_model.as_str(),
            config.drafting.reviewer_model.as_str(),
        ],
    )
    .context("building model router (is the API key set?)")?;
    Ok(Arc::new(router))
}

fn channels(config: &PipelineConfig) -> (Arc<dyn Notifier>, Arc<dyn TaskSink>) {
    let notifier: Arc<dyn Notifier> = match &config.escalation.telegram {
        Some(tg) => Arc::new(TelegramNotifier::new(tg.bot_token.clone(), tg.chat_id.clone())),
        None => {
            tracing::warn!("No Telegram credentials; lead notifications disabled");
            Arc::new(leadflow::escalation::NoopNotifier)
        }
    };
    let tasks: Arc<dyn TaskSink> = match &config.escalation.tasks_url {
        Some(url) => Arc::new(HttpTaskSink::new(url.clone())),
        None => Arc::new(leadflow::escalation::NoopTaskSink),
    };
    (notifier, tasks)
}

fn orchestrator(config: &PipelineConfig, db: Arc<dyn Database>) -> anyhow::Result<Orchestrator> {
    let rubric = Rubric::load(&config.scoring.rubric_path)?;
    let (notifier, tasks) = channels(config);
    let services = PipelineServices::new(
        db,
        Arc::new(ImapSource::new(&config.accounts)),
        llm(config)?,
        config,
    )
    .with_notifier(notifier)
    .with_tasks(tasks);
    Ok(Orchestrator::new(
        config.clone(),
        services,
        rubric,
        TemplateStore::from_dir(&config.drafting.templates_dir),
    ))
}

fn summary_line(msg: &StoredMessage) -> String {
    format!(
        "#{:<5} {} {:<8} {:<12} {:>3} {:<30} {}",
        msg.id,
        msg.received_at.format("%Y-%m-%d %H:%M"),
        msg.quarantine_status,
        msg.classification.as_deref().unwrap_or("-"),
        msg.score.map_or_else(|| "-".to_string(), |s| s.to_string()),
        msg.from_email,
        msg.subject,
    )
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
