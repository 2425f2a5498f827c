use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keyrate::config::KeyrateConfig;
use keyrate::ratelimit::{CheckOptions, RateLimiter};
use keyrate::store::{MemoryStore, RedisStore, Store};

#[derive(Debug, Parser)]
#[command(name = "keyrate", version, about = "Keyed leaky-bucket rate limiter")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log JSON lines instead of human-readable output
    #[arg(long, global = true)]
    json_logs: bool,

    /// Redis shard URL, repeated once per shard; overrides store.urls
    #[arg(long = "redis", value_name = "URL", global = true)]
    redis: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run checks for an identifier against the configured store
    Check {
        identifier: String,

        /// Decay rate in Hz
        #[arg(long)]
        rate: Option<f64>,

        /// Burst ceiling
        #[arg(long)]
        burst: Option<u64>,

        /// Operations recorded per check
        #[arg(long)]
        op_count: Option<u64>,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        repeat: u64,

        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Print the effective configuration as YAML
    ShowConfig,
}

/// One line of `check` output.
#[derive(Debug, Serialize)]
struct Attempt<'a> {
    attempt: u64,
    key: &'a str,
    admitted: bool,
    count: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = KeyrateConfig::load(cli.config.as_deref())?;
    if !cli.redis.is_empty() {
        config.store.urls = cli.redis;
        config.validate()?;
    }
    init_tracing(&config.logging.level, cli.json_logs || config.logging.json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting keyrate");

    match cli.command {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Check {
            identifier,
            rate,
            burst,
            op_count,
            repeat,
            interval_ms,
        } => {
            let options = CheckOptions {
                rate,
                burst,
                op_count,
            };
            run_checks(&config, &identifier, &options, repeat, interval_ms).await?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the store the config points at: shared Redis shards when URLs are
/// given, otherwise a private in-process store with its expiry sweeper.
async fn build_store(
    config: &KeyrateConfig,
) -> anyhow::Result<(Arc<dyn Store>, Option<JoinHandle<()>>)> {
    if !config.store.urls.is_empty() {
        let store: Arc<dyn Store> = Arc::new(RedisStore::connect(&config.store.urls).await?);
        return Ok((store, None));
    }

    let memory = Arc::new(MemoryStore::new(config.store.shards)?);
    let sweeper = memory.spawn_sweeper(Duration::from_millis(config.store.sweep_interval_ms));
    let store: Arc<dyn Store> = memory;
    Ok((store, Some(sweeper)))
}

async fn run_checks(
    config: &KeyrateConfig,
    identifier: &str,
    options: &CheckOptions,
    repeat: u64,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let (store, sweeper) = build_store(config).await?;

    let limiter = RateLimiter::new(store, config.limiter.clone())?;
    limiter.ready().await?;
    info!(
        key = %limiter.key_for(identifier),
        shard = limiter.shard_for(identifier),
        repeat,
        "Running checks"
    );

    let completed = run_attempts(
        &limiter,
        identifier,
        options,
        repeat,
        interval_ms,
        shutdown_signal(),
        &mut std::io::stdout(),
    )
    .await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    let completed = completed?;
    info!(completed, "Checks finished");
    Ok(())
}

/// Run up to `repeat` checks, writing one JSON line per attempt to `out`.
///
/// `shutdown` is raced against every check and every pause, so a hung store
/// call does not hold up exit. Returns the number of attempts completed.
async fn run_attempts<W: Write>(
    limiter: &RateLimiter,
    identifier: &str,
    options: &CheckOptions,
    repeat: u64,
    interval_ms: u64,
    shutdown: impl Future<Output = ()>,
    out: &mut W,
) -> anyhow::Result<u64> {
    let key = limiter.key_for(identifier);
    tokio::pin!(shutdown);

    let mut completed = 0;
    for attempt in 1..=repeat {
        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            outcome = limiter.check(identifier, options) => outcome,
        };
        let admitted = match outcome {
            Ok(()) => true,
            Err(e) if e.is_limit_exceeded() => false,
            Err(e) => return Err(e.into()),
        };
        let count = limiter.state(identifier).await?.map(|s| s.count);

        let line = Attempt {
            attempt,
            key: &key,
            admitted,
            count,
        };
        writeln!(out, "{}", serde_json::to_string(&line)?)?;
        completed = attempt;

        if attempt < repeat && interval_ms > 0 {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
            }
        }
    }

    Ok(completed)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keyrate::config::LimiterConfig;
    use keyrate::store::{AtomicUnit, ScriptId, StoreError};

    /// A memory store whose script evaluations never complete.
    struct HungStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for HungStore {
        fn shard_count(&self) -> usize {
            self.inner.shard_count()
        }

        async fn hmget(
            &self,
            shard: usize,
            key: &str,
            fields: &[&str],
        ) -> Result<Vec<Option<String>>, StoreError> {
            self.inner.hmget(shard, key, fields).await
        }

        async fn hmset(
            &self,
            shard: usize,
            key: &str,
            fields: &[(&str, String)],
        ) -> Result<(), StoreError> {
            self.inner.hmset(shard, key, fields).await
        }

        async fn expire(
            &self,
            shard: usize,
            key: &str,
            ttl_secs: u64,
        ) -> Result<bool, StoreError> {
            self.inner.expire(shard, key, ttl_secs).await
        }

        async fn exists(&self, shard: usize, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(shard, key).await
        }

        async fn load_script(
            &self,
            shard: usize,
            unit: Arc<dyn AtomicUnit>,
        ) -> Result<ScriptId, StoreError> {
            self.inner.load_script(shard, unit).await
        }

        async fn eval_script(
            &self,
            _shard: usize,
            _id: &ScriptId,
            _keys: &[String],
            _args: &[String],
        ) -> Result<i64, StoreError> {
            std::future::pending().await
        }
    }

    fn limiter(store: Arc<dyn Store>) -> RateLimiter {
        RateLimiter::new(store, LimiterConfig::new(0.1, 2)).unwrap()
    }

    #[tokio::test]
    async fn test_runs_every_attempt_without_shutdown() {
        let limiter = limiter(Arc::new(MemoryStore::new(2).unwrap()));
        let mut out = Vec::new();

        let completed = run_attempts(
            &limiter,
            "user",
            &CheckOptions::new(),
            3,
            0,
            std::future::pending::<()>(),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(completed, 3);

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["admitted"], true);
        assert_eq!(lines[1]["count"], 2);
        assert_eq!(lines[2]["admitted"], false);
        assert_eq!(lines[2]["key"], "ratelimit:user");
    }

    #[tokio::test]
    async fn test_shutdown_stops_back_to_back_checks() {
        let limiter = limiter(Arc::new(MemoryStore::new(2).unwrap()));
        let mut out = Vec::new();

        let completed = run_attempts(
            &limiter,
            "user",
            &CheckOptions::new(),
            5,
            0,
            std::future::ready(()),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(completed, 0);
        assert!(out.is_empty());
        assert_eq!(limiter.state("user").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_a_hung_check() {
        let store = Arc::new(HungStore {
            inner: MemoryStore::new(2).unwrap(),
        });
        let limiter = limiter(store);
        let mut out = Vec::new();
        let options = CheckOptions::new();

        let run = run_attempts(
            &limiter,
            "user",
            &options,
            1,
            0,
            tokio::time::sleep(Duration::from_millis(20)),
            &mut out,
        );
        let completed = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("shutdown should end the run")
            .unwrap();

        assert_eq!(completed, 0);
        assert!(out.is_empty());
    }
}
