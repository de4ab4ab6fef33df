use apicache::cache::{to_datetime, InvalidationPattern};
use apicache::{ApiCache, CleanupScheduler, Config};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "apicache")]
#[command(about = "Inspect and maintain the API response cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/apicache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache database to use instead of the configured one
  #[arg(long)]
  db: Option<PathBuf>,

  /// Write logs to daily files in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print cache and queue statistics as JSON
  Stats,
  /// Run one eviction pass
  Sweep,
  /// Remove cached responses whose key matches a pattern
  Invalidate {
    pattern: String,
    /// Treat the pattern as a regular expression instead of literal text
    #[arg(long)]
    regex: bool,
  },
  /// List writes waiting for replay
  Queue,
  /// List writes that ran out of replay attempts
  DeadLetters {
    /// Delete them after listing
    #[arg(long)]
    purge: bool,
  },
  /// Remove every cached response
  Clear,
  /// Run the cleanup scheduler until interrupted
  Watch,
}

/// Initialize the tracing subscriber. RUST_LOG controls the level (default: warn).
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "apicache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      None
    }
  }
}

fn format_ms(ms: i64) -> String {
  to_datetime(ms)
    .map(|dt| dt.to_rfc3339())
    .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_dir.as_ref());

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override database if specified on command line
  let config = if let Some(db) = args.db {
    Config {
      db_path: Some(db),
      ..config
    }
  } else {
    config
  };

  let cache = ApiCache::open(config)?;

  match args.command {
    Command::Stats => {
      let stats = cache.stats().await;
      println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Command::Sweep => {
      let removed = cache.run_cleanup().await;
      println!("Removed {} entries", removed);
    }
    Command::Invalidate { pattern, regex } => {
      let pattern = if regex {
        InvalidationPattern::regex(&pattern)?
      } else {
        InvalidationPattern::literal(pattern)
      };
      let removed = cache.invalidate(pattern).await?;
      println!("Invalidated {} entries", removed);
    }
    Command::Queue => {
      for entry in cache.list_pending().await {
        println!(
          "{}\t{}\t{}\tretries={}\tqueued={}",
          entry.id,
          entry.method,
          entry.url,
          entry.retry_count,
          format_ms(entry.enqueued_at)
        );
      }
    }
    Command::DeadLetters { purge } => {
      for dead in cache.dead_letters().await {
        println!(
          "{}\t{}\t{}\tretries={}\tfailed={}",
          dead.entry.id,
          dead.entry.method,
          dead.entry.url,
          dead.entry.retry_count,
          format_ms(dead.failed_at)
        );
      }
      if purge {
        let purged = cache.purge_dead_letters().await;
        println!("Purged {} dead letters", purged);
      }
    }
    Command::Clear => {
      let removed = cache.clear().await;
      println!("Cleared {} entries", removed);
    }
    Command::Watch => {
      let scheduler = CleanupScheduler::start_configured(cache.clone())?;
      info!("Watching cache, press Ctrl-C to stop");
      tokio::signal::ctrl_c().await?;
      scheduler.shutdown().await;
    }
  }

  Ok(())
}
