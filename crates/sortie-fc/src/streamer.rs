use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sortie_proto::SetpointSource;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::link::Link;
use crate::setpoint::encode;

/// Publishes the source's current setpoint at a fixed rate.
///
/// Runs as its own task and only touches the link for the duration of one
/// write, so a command waiting for its ack never delays a tick.
pub struct SetpointStreamer {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    published: Arc<AtomicU64>,
}

impl SetpointStreamer {
    pub fn start(link: Arc<Link>, source: Arc<dyn SetpointSource>, rate_hz: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)));
        let published = Arc::new(AtomicU64::new(0));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn({
            let published = published.clone();
            async move {
                let started = Instant::now();
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut failing = false;
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(target) = link.target() else { continue };

                    let sp = source.current_setpoint();
                    let boot_ms = u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX);
                    match link.send(&encode(&sp, target, boot_ms)) {
                        Ok(()) => {
                            published.fetch_add(1, Ordering::Relaxed);
                            failing = false;
                        }
                        Err(e) => {
                            if !failing {
                                warn!("streamer: send failed: {}", e);
                            }
                            failing = true;
                        }
                    }
                }
                debug!("streamer: stopped after {} setpoints", published.load(Ordering::Relaxed));
            }
        });

        info!("streamer: publishing at {} Hz", rate_hz);
        Self { stop: Some(stop_tx), task, published }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Stop after the current tick and return how many setpoints went out.
    pub async fn stop(mut self) -> u64 {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
        self.published()
    }
}

impl Drop for SetpointStreamer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
