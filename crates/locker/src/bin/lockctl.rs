//! Lock control binary.
//!
//! Inspect and drive preemptive locks from the command line: derive keys,
//! send preemption requests to a holder, or hold a lock until interrupted.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use locker::{lock_key, LockOptions, LockProvider, PostgresLockProvider};

#[derive(Parser)]
#[command(name = "lockctl")]
#[command(about = "Inspect and drive preemptive environment locks")]
#[command(version)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the lock key for a repository and pull request
    Key {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        pr: u32,
    },
    /// Ask the current holder of a key to yield
    Notify {
        #[command(flatten)]
        target: Target,
        /// Reason delivered to the holder
        #[arg(long, default_value = "force release")]
        message: String,
    },
    /// Acquire a key and hold it until preempted or interrupted
    Hold {
        #[command(flatten)]
        target: Target,
        /// Seconds to wait for the lock
        #[arg(long, default_value_t = 60)]
        wait: u64,
        /// Preempt the current holder before waiting
        #[arg(long)]
        preempt: bool,
    },
}

#[derive(Args)]
struct Target {
    /// Explicit lock key
    #[arg(long, conflicts_with_all = ["repo", "pr"])]
    key: Option<i64>,
    /// Repository name, used with --pr
    #[arg(long, requires = "pr")]
    repo: Option<String>,
    /// Pull request number, used with --repo
    #[arg(long, requires = "repo")]
    pr: Option<u32>,
}

impl Target {
    fn resolve(&self) -> Result<i64> {
        match (self.key, &self.repo, self.pr) {
            (Some(key), _, _) => Ok(key),
            (None, Some(repo), Some(pr)) => Ok(lock_key(repo, pr)),
            _ => bail!("either --key or both --repo and --pr are required"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env().add_directive("lockctl=info".parse()?);
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Command::Key { repo, pr } => {
            println!("{}", lock_key(&repo, pr));
            Ok(())
        }
        Command::Notify { target, message } => {
            let key = target.resolve()?;
            let provider = connect(cli.database_url.as_deref()).await?;
            let lock = provider
                .new_lock(key, &message)
                .await
                .context("Failed to create lock")?;
            lock.notify(&message)
                .await
                .context("Failed to send notification")?;
            info!(lock_key = key, message = %message, "Notification sent");
            Ok(())
        }
        Command::Hold {
            target,
            wait,
            preempt,
        } => {
            let key = target.resolve()?;
            let provider = connect(cli.database_url.as_deref()).await?;
            hold(&provider, key, Duration::from_secs(wait), preempt).await
        }
    }
}

async fn connect(database_url: Option<&str>) -> Result<PostgresLockProvider> {
    let Some(url) = database_url else {
        bail!("DATABASE_URL or --database-url is required");
    };
    let options = LockOptions::from_env().context("Invalid lock options")?;
    PostgresLockProvider::connect(url, 4, options)
        .await
        .context("Failed to connect to Postgres")
}

async fn hold(provider: &dyn LockProvider, key: i64, wait: Duration, preempt: bool) -> Result<()> {
    let mut lock = provider
        .new_lock(key, "lockctl hold")
        .await
        .context("Failed to create lock")?;
    if preempt {
        if let Err(e) = lock.notify("lockctl hold").await {
            warn!(lock_key = key, error = %e, "Unable to notify current holder");
        }
    }
    let preempted = match lock.lock(wait).await {
        Ok(preempted) => preempted,
        Err(e) => {
            if let Err(unlock_err) = lock.unlock().await {
                warn!(lock_key = key, error = %unlock_err, "Unable to clean up lock after failed acquire");
            }
            return Err(e).context("Failed to acquire lock");
        }
    };
    info!(lock_key = key, lock_id = %lock.id(), "Holding lock; Ctrl-C to release");

    tokio::select! {
        payload = preempted => match payload {
            Ok(payload) => info!(lock_key = key, reason = %payload, "Lock preempted"),
            Err(_) => info!(lock_key = key, "Lock session ended"),
        },
        _ = tokio::signal::ctrl_c() => info!(lock_key = key, "Interrupted"),
    }

    lock.unlock().await.context("Failed to release lock")?;
    info!(lock_key = key, "Released");
    Ok(())
}
