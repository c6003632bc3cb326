//! Schedules reconcile passes on watch events and a periodic poll

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream::BoxStream, FutureExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{snapshot::Predicates, store::Trigger, utils::error_full_message};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// How a reconciler wants to be scheduled.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Identifies the reconciler in logs, and marks the objects that it owns.
    pub name: String,

    /// How often to reconcile when nothing is happening.
    pub poll_interval: Duration,

    /// Passes never start closer together than this, bursts of events are coalesced.
    pub min_interval: Duration,

    pub predicates: Predicates,

    /// If set, primary objects carry this finalizer until their owned objects have been cleaned up.
    pub finalizer: Option<String>,
}

impl Registration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_interval: DEFAULT_MIN_INTERVAL,
            predicates: Predicates::default(),
            finalizer: None,
        }
    }
}

#[async_trait]
pub trait Reconcile: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn registration(&self) -> &Registration;

    /// Runs one pass over everything the reconciler is responsible for.
    ///
    /// `trigger` is the object whose change caused the pass, or [`None`] for polls and requeues.
    /// Returns whether another pass should follow as soon as possible.
    async fn reconcile(
        &self,
        trigger: Option<&Trigger>,
        cancel: &CancellationToken,
    ) -> Result<bool, Self::Error>;
}

/// Runs `reconciler` until `cancel` is cancelled.
///
/// A pass is started immediately, and then whenever `triggers` emits or the poll interval elapses.
/// Failed passes are logged and retried on the next trigger.
pub async fn run<R: Reconcile>(
    reconciler: R,
    triggers: BoxStream<'static, Trigger>,
    cancel: CancellationToken,
) {
    let registration = reconciler.registration().clone();
    let name = registration.name.as_str();
    let mut triggers = triggers.fuse();
    let mut triggers_done = false;
    let mut poll = tokio::time::interval_at(
        Instant::now() + registration.poll_interval,
        registration.poll_interval,
    );
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut queued: Option<Option<Trigger>> = Some(None);
    let mut last_pass: Option<Instant> = None;

    info!(reconciler = name, "Starting reconciler");
    loop {
        let trigger = match queued.take() {
            Some(trigger) => trigger,
            None => tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => None,
                trigger = triggers.next(), if !triggers_done => match trigger {
                    Some(trigger) => Some(trigger),
                    None => {
                        triggers_done = true;
                        continue;
                    }
                },
            },
        };
        if let Some(last_pass) = last_pass {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(last_pass + registration.min_interval) => {}
            }
        }
        // Anything that arrived in the meantime is covered by this pass
        while let Some(Some(_)) = triggers.next().now_or_never() {}

        last_pass = Some(Instant::now());
        debug!(reconciler = name, ?trigger, "Starting reconcile pass");
        match reconciler.reconcile(trigger.as_ref(), &cancel).await {
            Ok(true) => queued = Some(None),
            Ok(false) => {}
            Err(err) => error!(
                reconciler = name,
                error = %error_full_message(&err),
                "Reconcile pass failed"
            ),
        }
    }
    info!(reconciler = name, "Stopped reconciler");
}
