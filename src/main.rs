mod config;
mod connectivity;
mod dashboard;
mod event;
mod model;
mod remote;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod tracker;

use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use connectivity::{Connectivity, ConnectivityMonitor};
use event::{EventBus, SyncEvent};
use model::{RecordDraft, RecordPatch};
use remote::{HttpRemote, RemoteEndpoint};
use store::{KeyValueStore, MemoryStore, SqliteStore};
use tracker::{PullOutcome, Tracker, UpdateOutcome};

/// Environment variable holding the log filter directive.
const LOG_ENV: &str = "SPENDSYNC_LOG";

#[derive(Parser, Debug)]
#[command(name = "spendsync")]
#[command(about = "Offline-first expense tracking backed by a spreadsheet endpoint")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/spendsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Record a new expense
  Add(RecordFields),
  /// Edit an existing expense
  Update {
    id: String,
    #[command(flatten)]
    fields: PatchFields,
  },
  /// Delete an expense
  Delete { id: String },
  /// Show one expense
  Show { id: String },
  /// List expenses
  List {
    #[arg(short, long)]
    category: Option<String>,
  },
  /// Show dashboard rollups
  Dashboard,
  /// Show operations waiting to reach the endpoint
  Pending,
  /// Probe the endpoint and drain pending operations once
  Sync,
  /// Replace local expenses with the endpoint's rows
  Pull,
  /// Drop cached reads
  Invalidate,
  /// Show sync bookkeeping
  Status,
  /// Keep syncing in the background until interrupted
  Run,
}

#[derive(ClapArgs, Debug)]
struct RecordFields {
  #[arg(long)]
  date: String,
  #[arg(long)]
  category: String,
  #[arg(long)]
  item: String,
  #[arg(long, allow_negative_numbers = true)]
  amount: f64,
  #[arg(long, default_value = "")]
  sub_category: String,
  #[arg(long, default_value = "")]
  email: String,
  #[arg(long, default_value = "")]
  shop: String,
  #[arg(long, default_value = "")]
  payment_mode: String,
  /// Repeat for several labels
  #[arg(long = "label")]
  labels: Vec<String>,
}

impl From<RecordFields> for RecordDraft {
  fn from(f: RecordFields) -> Self {
    Self {
      date: f.date,
      category: f.category,
      sub_category: f.sub_category,
      item: f.item,
      amount: f.amount,
      email: f.email,
      shop_name: f.shop,
      payment_mode: f.payment_mode,
      labels: f.labels,
    }
  }
}

#[derive(ClapArgs, Debug)]
struct PatchFields {
  #[arg(long)]
  date: Option<String>,
  #[arg(long)]
  category: Option<String>,
  #[arg(long)]
  item: Option<String>,
  #[arg(long, allow_negative_numbers = true)]
  amount: Option<f64>,
  #[arg(long)]
  sub_category: Option<String>,
  #[arg(long)]
  email: Option<String>,
  #[arg(long)]
  shop: Option<String>,
  #[arg(long)]
  payment_mode: Option<String>,
  /// Replaces all labels; repeat for several
  #[arg(long = "label")]
  labels: Option<Vec<String>>,
}

impl From<PatchFields> for RecordPatch {
  fn from(f: PatchFields) -> Self {
    Self {
      date: f.date,
      category: f.category,
      sub_category: f.sub_category,
      item: f.item,
      amount: f.amount,
      email: f.email,
      shop_name: f.shop,
      payment_mode: f.payment_mode,
      labels: f.labels,
    }
  }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let remote = Arc::new(HttpRemote::new(&config.remote)?);

  if config.storage.in_memory {
    run(Arc::new(MemoryStore::new()), remote, &config, args.command).await
  } else {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open(path)?,
      None => SqliteStore::open_default()?,
    };
    run(Arc::new(store), remote, &config, args.command).await
  }
}

/// Route logs to a daily file so stdout carries only command output.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("spendsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "spendsync.log"));
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(guard)
}

async fn run<S: KeyValueStore, R: RemoteEndpoint>(
  kv: Arc<S>,
  remote: Arc<R>,
  config: &Config,
  command: Command,
) -> Result<()> {
  let events = EventBus::default();
  // Assume reachable until a probe says otherwise; a failed write costs one retry
  let monitor = ConnectivityMonitor::new(Connectivity::Online, events.clone());
  let tracker = Tracker::new(kv, Arc::clone(&remote), &monitor, events.clone(), config).await;

  match command {
    Command::Add(fields) => {
      let record = tracker.add(fields.into()).await?;
      println!("Added {} ({} {:.2})", record.id, record.category, record.amount);
      println!("{} operation(s) pending", tracker.pending().len());
    }
    Command::Update { id, fields } => match tracker.update(&id, fields.into()).await? {
      UpdateOutcome::Updated(record) => {
        println!("Updated {} ({} {:.2})", record.id, record.category, record.amount)
      }
      UpdateOutcome::Unchanged(_) => println!("Nothing to change for {}", id),
    },
    Command::Delete { id } => {
      let record = tracker.delete(&id).await?;
      println!("Deleted {} ({} {:.2})", record.id, record.category, record.amount);
    }
    Command::Show { id } => {
      let record = tracker
        .find(&id)
        .await
        .ok_or_else(|| eyre!("No record with id {}", id))?;
      let json = serde_json::to_string_pretty(&record)
        .map_err(|e| eyre!("Failed to render record: {}", e))?;
      println!("{}", json);
    }
    Command::List { category } => {
      let mut records = tracker.records().await;
      if let Some(category) = category {
        records.retain(|r| r.category.eq_ignore_ascii_case(&category));
      }
      records.sort_by(|a, b| b.parsed_date().cmp(&a.parsed_date()));
      for r in &records {
        println!(
          "{:<36}  {:<10}  {:<16}  {:<24}  {:>10.2}",
          r.id, r.date, r.category, r.item, r.amount
        );
      }
      println!("{} record(s)", records.len());
    }
    Command::Dashboard => {
      let snapshot = tracker.dashboard().await;
      let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| eyre!("Failed to render dashboard: {}", e))?;
      println!("{}", json);
    }
    Command::Pending => {
      let pending = tracker.pending();
      for op in &pending {
        println!(
          "{}  {:<6}  {:<36}  attempts={}  {}",
          op.op_id,
          op.intent.action(),
          op.intent.record_id(),
          op.attempts,
          op.last_error.as_deref().unwrap_or("")
        );
      }
      println!("{} operation(s) pending", pending.len());
    }
    Command::Sync => {
      if monitor.probe(&*remote).await == Connectivity::Offline {
        println!("Endpoint unreachable; {} operation(s) left queued", tracker.pending().len());
        return Ok(());
      }
      let report = tracker.sync_now().await;
      println!(
        "Applied {}, failed {}, deferred {}, {} remaining",
        report.applied, report.failed, report.deferred, report.remaining
      );
    }
    Command::Pull => match tracker.pull().await {
      PullOutcome::Refreshed { records } => println!("Pulled {} record(s)", records),
      PullOutcome::SkippedPending { pending } => {
        println!("Skipped: {} local operation(s) not yet synced", pending)
      }
      PullOutcome::Failed(e) => return Err(eyre!("Failed to pull records: {}", e)),
    },
    Command::Invalidate => {
      tracker.invalidate_cache().await;
      println!("Caches cleared");
    }
    Command::Status => {
      let settings = tracker.settings().await;
      let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
      };
      println!("Endpoint:  {}", config.remote.endpoint);
      println!("Pending:   {}", tracker.pending().len());
      println!("Outbound:  {}", tracker.outbound_queued());
      println!("Last sync: {}", fmt_time(settings.last_sync_at));
      println!("Last pull: {}", fmt_time(settings.last_pull_at));
    }
    Command::Run => {
      monitor.probe(&*remote).await;
      let engine = tracker.engine();
      let mut subscription = events.subscribe();
      info!(
        pending = tracker.pending().len(),
        connectivity = ?monitor.current(),
        "Sync loop starting"
      );

      let log_events = async {
        while let Some(event) = subscription.next().await {
          match event {
            SyncEvent::ConnectivityChanged(state) => info!(?state, "Connectivity changed"),
            SyncEvent::QueueChanged { pending } => info!(pending, "Queue changed"),
            SyncEvent::DrainFinished(report) => {
              if report.failed > 0 {
                warn!(failed = report.failed, remaining = report.remaining, "Drain finished with failures");
              } else {
                info!(applied = report.applied, remaining = report.remaining, "Drain finished");
              }
            }
          }
        }
      };

      tokio::select! {
        _ = engine.run() => {}
        _ = monitor.run_probe(&*remote, config.probe_interval()) => {}
        _ = log_events => {}
        result = tokio::signal::ctrl_c() => {
          result.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
          println!("Stopping; {} operation(s) pending", tracker.pending().len());
        }
      }
      subscription.unsubscribe();
    }
  }

  Ok(())
}
