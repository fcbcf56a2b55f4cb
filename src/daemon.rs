//! The polling loop: discover → filter → group → detect → reconcile → sleep.
//!
//! All state that survives a cycle (the change-detector snapshot and the
//! consecutive-failure counter) is owned here and touched only from this
//! loop. Signals are handled during the sleep and while a cycle is in
//! flight: SIGTERM/SIGINT flip a shutdown flag the reconciler checks
//! between Dataplane calls, so an open transaction is deleted at the next
//! call boundary rather than committed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::discovery::change_detector::ChangeDetector;
use crate::discovery::models::group_instances;
use crate::discovery::tag_filter::TagFilter;
use crate::discovery::DiscoveryClient;
use crate::error::Error;
use crate::haproxy::dataplane::{DataplaneApi, HttpDataplaneClient};
use crate::haproxy::reconciler::Reconciler;

pub struct Daemon {
    config: AppConfig,
    discovery: Box<dyn DiscoveryClient>,
    tag_filter: TagFilter,
    change_detector: ChangeDetector,
    reconciler: Reconciler,
    consecutive_failures: u32,
}

impl Daemon {
    pub async fn new(config: AppConfig) -> Result<Self, Error> {
        let discovery = crate::discovery::build_client(&config).await?;
        let api: Arc<dyn DataplaneApi> = Arc::new(HttpDataplaneClient::new(&config.haproxy)?);

        Ok(Self {
            discovery,
            tag_filter: TagFilter::new(config.tags.clone()),
            change_detector: ChangeDetector::new(config.tags.clone()),
            reconciler: Reconciler::new(api, config.haproxy.clone(), config.tags.clone()),
            config,
            consecutive_failures: 0,
        })
    }

    /// Execute a single discovery + reconciliation cycle.
    pub async fn run_once(&mut self) -> Result<(), Error> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.cycle(shutdown_rx).await
    }

    /// Run the polling loop until SIGTERM or SIGINT.
    pub async fn run(&mut self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_seconds = self.config.polling.interval_seconds,
            "Daemon started"
        );

        let mut reset_requested = false;
        loop {
            if reset_requested {
                self.change_detector.reset();
                reset_requested = false;
            }

            let started = Instant::now();

            // Keep listening for signals while the cycle runs. A shutdown
            // signal flips the flag; the cycle observes it at its next call
            // boundary, deletes any open transaction, and returns Cancelled.
            let result = {
                let cycle = self.cycle(shutdown_rx.clone());
                tokio::pin!(cycle);
                loop {
                    tokio::select! {
                        result = &mut cycle => break result,
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, cancelling in-flight cycle");
                            let _ = shutdown_tx.send(true);
                        }
                        _ = sigint.recv() => {
                            info!("Received SIGINT, cancelling in-flight cycle");
                            let _ = shutdown_tx.send(true);
                        }
                        _ = sighup.recv() => {
                            info!("Received SIGHUP, resetting change detector state");
                            reset_requested = true;
                        }
                    }
                }
            };

            match result {
                Ok(()) => self.consecutive_failures = 0,
                Err(Error::Cancelled) => {
                    info!("Cycle cancelled, shutting down");
                    return Ok(());
                }
                Err(err) => {
                    self.consecutive_failures += 1;
                    error!(
                        error = %err,
                        consecutive_failures = self.consecutive_failures,
                        "Cycle failed"
                    );
                }
            }

            // The signal may have landed after the cycle's last boundary, in
            // which case the commit finished cleanly and we exit here.
            if *shutdown_rx.borrow() {
                info!("Shutting down");
                return Ok(());
            }

            let sleep_for = self.sleep_duration(started.elapsed());
            debug!(
                sleep_seconds = sleep_for.as_secs_f64(),
                "Sleeping before next cycle"
            );

            let deadline = tokio::time::Instant::now() + sleep_for;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                        return Ok(());
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT, shutting down");
                        return Ok(());
                    }
                    _ = sighup.recv() => {
                        info!("Received SIGHUP, resetting change detector state");
                        reset_requested = true;
                    }
                }
            }
        }
    }

    async fn cycle(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let started = Instant::now();

        let instances = self.discovery.discover_all().await?;
        if *shutdown.borrow() {
            return Err(Error::Cancelled);
        }

        let instances = self.tag_filter.apply(instances);
        let services = group_instances(instances, &self.config.tags);
        let changes = self.change_detector.detect(&services);

        if changes.is_empty() {
            debug!(services = services.len(), "No changes detected");
        } else {
            let outcome = self
                .reconciler
                .reconcile(&changes.changed, &changes.removed, &shutdown)
                .await?;
            self.change_detector.commit(&services, &outcome.slot_counts);
        }

        info!(
            services = services.len(),
            elapsed_seconds = started.elapsed().as_secs_f64(),
            "Cycle complete"
        );
        Ok(())
    }

    fn sleep_duration(&self, elapsed: Duration) -> Duration {
        let polling = &self.config.polling;

        let interval = Duration::from_secs(polling.interval_seconds).saturating_sub(elapsed);
        let jitter = if polling.jitter_seconds > 0 {
            Duration::from_secs_f64(
                rand::rng().random_range(0.0..polling.jitter_seconds as f64),
            )
        } else {
            Duration::ZERO
        };
        let backoff = backoff_delay(
            self.consecutive_failures,
            polling.backoff_base_seconds,
            polling.max_backoff_seconds,
        );

        interval + jitter + backoff
    }
}

/// Exponential backoff after consecutive failures: `base * 2^(failures-1)`
/// capped at `max`. Zero failures means no backoff.
fn backoff_delay(failures: u32, base_seconds: u64, max_seconds: u64) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64 << (failures - 1).min(32);
    Duration::from_secs(base_seconds.saturating_mul(factor).min(max_seconds))
}
