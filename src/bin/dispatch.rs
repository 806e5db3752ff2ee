//! dispatch CLI — console harness that exercises a dispatch loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use dispatch_loop::DispatchLoop;
use dispatch_loop::config::Config;
use dispatch_loop::telemetry::init_telemetry;
use parking_lot::Mutex;
use tracing::info;

#[derive(Parser)]
#[command(name = "dispatch", about = "Thread-affine dispatch loop demos")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Post from many threads and check per-thread ordering
    Ordering {
        /// Number of submitting threads
        #[arg(long, default_value_t = 10)]
        threads: usize,
        /// Posts per thread
        #[arg(long, default_value_t = 10)]
        per_thread: usize,
    },
    /// Schedule a 500ms item, then a 100ms item, and show which runs first
    Delays,
    /// Nested send from inside a callback
    Reentrant,
    /// Post a panicking callback and print the observer report
    Failures,
    /// Post a heartbeat on an interval until Ctrl-C
    Heartbeat {
        /// Interval between heartbeats in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(&config)?;

    let dispatch = DispatchLoop::builder()
        .config(config.dispatch.clone())
        .start()
        .context("starting dispatch loop")?;

    match cli.command {
        Command::Ordering {
            threads,
            per_thread,
        } => cmd_ordering(&dispatch, threads, per_thread)?,
        Command::Delays => cmd_delays(&dispatch).await?,
        Command::Reentrant => cmd_reentrant(&dispatch).await?,
        Command::Failures => cmd_failures(&dispatch).await?,
        Command::Heartbeat { interval_ms } => cmd_heartbeat(&dispatch, interval_ms).await?,
    }

    dispatch.dispose()?;
    Ok(())
}

fn cmd_ordering(dispatch: &DispatchLoop, threads: usize, per_thread: usize) -> anyhow::Result<()> {
    let log: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let submitters: Vec<_> = (0..threads)
        .map(|t| {
            let handle = dispatch.handle();
            let log = Arc::clone(&log);
            thread::spawn(move || -> dispatch_loop::Result<()> {
                for i in 0..per_thread {
                    let log = Arc::clone(&log);
                    handle.post(move || log.lock().push((t, i)))?;
                }
                Ok(())
            })
        })
        .collect();
    for submitter in submitters {
        submitter
            .join()
            .map_err(|_| anyhow::anyhow!("submitter thread panicked"))??;
    }

    // Every post is ahead of this send in the queue.
    let entries = {
        let log = Arc::clone(&log);
        dispatch.send(move || log.lock().clone())?
    };

    let mut in_order = true;
    for t in 0..threads {
        let seen: Vec<usize> = entries
            .iter()
            .filter(|(thread, _)| *thread == t)
            .map(|(_, i)| *i)
            .collect();
        let ordered = seen.windows(2).all(|w| w[0] < w[1]);
        println!("thread {t:>3}: {} items, ordered: {ordered}", seen.len());
        in_order &= ordered && seen.len() == per_thread;
    }
    println!("\n{} item(s) executed, per-thread order kept: {in_order}", entries.len());
    Ok(())
}

async fn cmd_delays(dispatch: &DispatchLoop) -> anyhow::Result<()> {
    let start = Instant::now();
    let a = dispatch.send_async_after(Duration::from_millis(500), move || ("A", start.elapsed()));
    let b = dispatch.send_async_after(Duration::from_millis(100), move || ("B", start.elapsed()));

    let (b, a) = (b.await?, a.await?);
    for (name, at) in [b, a] {
        println!("{name} ran after {}ms", at.as_millis());
    }
    Ok(())
}

async fn cmd_reentrant(dispatch: &DispatchLoop) -> anyhow::Result<()> {
    let handle = dispatch.handle();
    let result = dispatch
        .send_async(move || {
            let outer = thread::current().name().map(str::to_string);
            // Runs inline: the worker cannot wait on itself.
            let inner = handle.send(|| thread::current().name().map(str::to_string));
            (outer, inner)
        })
        .await?;

    let (outer, inner) = result;
    println!("outer callback thread: {}", outer.as_deref().unwrap_or("-"));
    println!(
        "nested send thread:    {}",
        inner?.as_deref().unwrap_or("-")
    );
    Ok(())
}

async fn cmd_failures(dispatch: &DispatchLoop) -> anyhow::Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let observer = dispatch.subscribe(move |failure| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(failure.clone());
        }
    });

    dispatch.post(|| panic!("demo failure"))?;
    let failure = rx.await.context("observer never fired")?;
    println!("{}", serde_json::to_string_pretty(&failure)?);

    // The loop keeps running after a failed item.
    let still_alive = dispatch.send_async(|| "still running").await?;
    println!("after failure: {still_alive}");

    dispatch.unsubscribe(observer);
    Ok(())
}

async fn cmd_heartbeat(dispatch: &DispatchLoop, interval_ms: u64) -> anyhow::Result<()> {
    let interval = Duration::from_millis(interval_ms);
    let handle = dispatch.handle();
    schedule_heartbeat(handle, interval, 0)?;

    info!(interval_ms, "heartbeat running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn schedule_heartbeat(
    handle: dispatch_loop::LoopHandle,
    interval: Duration,
    beat: u64,
) -> dispatch_loop::Result<()> {
    let next = handle.clone();
    handle.post_after(interval, move || {
        info!(beat, "heartbeat");
        // Refused once the loop stops; that ends the chain.
        let _ = schedule_heartbeat(next, interval, beat + 1);
    })
}
