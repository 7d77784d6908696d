//! clipkeeper: motion-triggered clip recorder with pre-roll

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clipkeeper::ingest::{self, StopReason};
use clipkeeper::{ClipRecorder, Config, MotionDetector};
use color_eyre::{eyre::eyre, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clipkeeper=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("clipkeeper launching...");

    // Load configuration
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let mut source = config.source.open()?;
    info!("Using frame source: {}", source.describe());
    let mut detector = MotionDetector::new(config.detector.clone())?;
    let factory = Arc::new(config.recorder.file_sink_factory());
    let mut recorder = ClipRecorder::new(config.recorder.clone(), factory)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let ingest_task = tokio::task::spawn_blocking({
        let cancel = cancel.clone();
        let processing = config.processing.clone();
        move || ingest::run(&mut source, &mut detector, &mut recorder, &processing, &cancel)
    });

    let summary = supervise(ingest_task, &cancel, tokio::signal::ctrl_c()).await??;
    info!(
        "Clips are saved in {}",
        config.recorder.output.dir.display()
    );
    if summary.stop_reason == StopReason::SourceFailed {
        return Err(eyre!("frame source failed"));
    }

    info!("clipkeeper shutting down");
    Ok(())
}

/// Wait for the ingestion task, cancelling it when `interrupt` resolves.
///
/// A failed interrupt listener still cancels and joins the task before the
/// error is returned, so the open clip is always finished.
async fn supervise<T>(
    mut task: JoinHandle<T>,
    cancel: &AtomicBool,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> Result<T> {
    let (finished, signal_error) = tokio::select! {
        joined = &mut task => (Some(joined), None),
        signal = interrupt => (None, signal.err()),
    };
    let joined = match finished {
        Some(joined) => joined,
        None => {
            match &signal_error {
                Some(e) => error!("Cannot listen for Ctrl-C ({}), stopping ingestion", e),
                None => info!("Interrupt received, finishing the current clip..."),
            }
            cancel.store(true, Ordering::Release);
            task.await
        }
    };

    let output = joined.map_err(|e| eyre!("ingestion task failed: {}", e))?;
    match signal_error {
        Some(e) => Err(eyre!("ctrl-c handler failed: {}", e)),
        None => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spin_until_cancelled(cancel: Arc<AtomicBool>) -> JoinHandle<u32> {
        tokio::task::spawn_blocking(move || {
            let mut spins = 0;
            while !cancel.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
                spins += 1;
            }
            spins
        })
    }

    #[tokio::test]
    async fn interrupt_cancels_and_joins_task() {
        let cancel = Arc::new(AtomicBool::new(false));
        let task = spin_until_cancelled(cancel.clone());
        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        };
        supervise(task, &cancel, interrupt).await.unwrap();
        assert!(cancel.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn failed_interrupt_listener_still_stops_task() {
        let cancel = Arc::new(AtomicBool::new(false));
        let task = spin_until_cancelled(cancel.clone());
        let interrupt = std::future::ready(Err(std::io::Error::other("no signal support")));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(task, &cancel, interrupt),
        )
        .await
        .expect("ingestion task was never cancelled");

        assert!(result.unwrap_err().to_string().contains("ctrl-c"));
        assert!(cancel.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn finished_task_output_is_returned() {
        let cancel = AtomicBool::new(false);
        let task = tokio::task::spawn_blocking(|| 7u32);
        let output = supervise(task, &cancel, std::future::pending()).await.unwrap();
        assert_eq!(output, 7);
        assert!(!cancel.load(Ordering::Acquire));
    }
}
