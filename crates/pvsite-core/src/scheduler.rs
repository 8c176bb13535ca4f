use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::baseline;
use crate::batch::HistoryBatch;
use crate::dispatcher::Dispatcher;
use crate::poller::Poller;
use crate::solar::SolarModel;
use crate::tier::{DaylightTracker, Mode, Tier, TierName, TierPlan};

/// Topic of the logged production written after midnight.
pub const YESTERDAY_TOPIC: &str = "production/midnight";

/// Yesterday's history is asked for this many times, this far apart, while inverters wake up.
const HISTORY_ATTEMPTS: u32 = 10;
const HISTORY_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub horizon_deg: f64,
    pub solar_check: Duration,
    pub shutdown_grace: Duration,
    pub timezone: Tz,
}

/// Counters reported when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub ticks: u64,
    pub coalesced: u64,
    pub boundaries: u64,
    pub aborted: usize,
}

/// Drives every tier from a single timer loop.
pub struct TierScheduler {
    plan: TierPlan,
    poller: Arc<Poller>,
    dispatcher: Arc<Dispatcher>,
    solar: Arc<dyn SolarModel>,
    settings: SchedulerSettings,
    guards: HashMap<TierName, Arc<Semaphore>>,
    refreshing: Arc<AtomicBool>,
}

/// Next deadline after `previous`; deadlines missed entirely are skipped, not replayed.
fn advance(previous: Instant, period: Duration, now: Instant) -> Instant {
    let next = previous + period;
    if next <= now {
        now + period
    } else {
        next
    }
}

impl TierScheduler {
    pub fn new(
        plan: TierPlan,
        poller: Arc<Poller>,
        dispatcher: Arc<Dispatcher>,
        solar: Arc<dyn SolarModel>,
        settings: SchedulerSettings,
    ) -> Self {
        let guards = plan
            .all()
            .map(|tier| (tier.name, Arc::new(Semaphore::new(1))))
            .collect();
        Self {
            plan,
            poller,
            dispatcher,
            solar,
            settings,
            guards,
            refreshing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs until `shutdown` resolves, then drains in-flight work within the grace period.
    pub async fn run<F>(self, shutdown: F) -> SchedulerReport
    where
        F: Future<Output = ()>,
    {
        let mut report = SchedulerReport::default();
        let mut tasks = JoinSet::new();

        let start = Instant::now();
        let elevation = self.solar.position(Utc::now()).elevation_deg;
        let mut tracker = DaylightTracker::new(self.settings.horizon_deg, elevation);
        let mut deadlines = self.arm(tracker.mode(), |_| start);
        let mut next_solar = start + self.settings.solar_check;
        let mut next_midnight = self.next_midnight();

        info!(
            mode = %tracker.mode(),
            elevation = %format!("{elevation:.1}"),
            tiers = deadlines.len(),
            "scheduler started"
        );
        self.spawn_baseline_refresh(&mut tasks, false);

        tokio::pin!(shutdown);
        loop {
            let next_tick = deadlines.values().min().copied().unwrap_or(next_solar);
            let wake = next_tick.min(next_solar).min(next_midnight);

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!(error = %err, "tier task panicked");
                        }
                    }
                    continue;
                }
                _ = sleep_until(wake) => {}
            }

            let now = Instant::now();

            if now >= next_solar {
                let position = self.solar.position(Utc::now());
                if let Some(target) = tracker.observe(position.elevation_deg) {
                    info!(
                        target = %target,
                        elevation = %format!("{:.1}", position.elevation_deg),
                        "horizon crossed, switching at the next tier boundary"
                    );
                }
                next_solar = advance(next_solar, self.settings.solar_check, now);
            }

            if now >= next_midnight {
                info!("local midnight, refreshing production baselines");
                self.spawn_baseline_refresh(&mut tasks, false);
                self.spawn_yesterday_history(&mut tasks);
                next_midnight = self.next_midnight();
            }

            let due: Vec<TierName> = deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(name, _)| *name)
                .collect();
            if due.is_empty() {
                continue;
            }

            if let Some(mode) = tracker.take_pending() {
                info!(mode = %mode, "mode transition, running boundary tick");
                self.spawn_boundary(&mut tasks);
                report.boundaries += 1;
                deadlines = self.arm(mode, |tier| now + tier.period);
                continue;
            }

            let polling = self.plan.polling_tier(tracker.mode());
            if due.contains(&polling) && !self.dispatcher.baselines_complete(Utc::now()) {
                self.spawn_baseline_refresh(&mut tasks, true);
            }
            for name in due {
                let Some(tier) = self.plan.get(name) else {
                    continue;
                };
                if self.spawn_tick(&mut tasks, tier, name == polling) {
                    report.ticks += 1;
                } else {
                    report.coalesced += 1;
                }
                if let Some(deadline) = deadlines.get_mut(&name) {
                    *deadline = advance(*deadline, tier.period, now);
                }
            }
        }

        info!(in_flight = tasks.len(), "scheduler stopping");
        let grace = self.settings.shutdown_grace;
        let drained = timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            report.aborted = tasks.len();
            warn!(aborted = report.aborted, "shutdown grace elapsed, aborting in-flight ticks");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.poller.close_all().await;
        for sink in self.dispatcher.sinks() {
            if let Err(err) = sink.close().await {
                warn!(sink = %sink.name(), error = %err, "failed to close sink");
            }
        }
        info!(
            ticks = report.ticks,
            coalesced = report.coalesced,
            boundaries = report.boundaries,
            "scheduler stopped"
        );
        report
    }

    fn arm(&self, mode: Mode, first: impl Fn(&Tier) -> Instant) -> BTreeMap<TierName, Instant> {
        self.plan
            .active(mode)
            .into_iter()
            .map(|tier| (tier.name, first(tier)))
            .collect()
    }

    fn next_midnight(&self) -> Instant {
        let now = Utc::now();
        let midnight = baseline::next_midnight(self.settings.timezone, now);
        let wait = (midnight - now).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + wait
    }

    /// Starts one tick unless the tier's previous tick is still running. Returns whether it started.
    fn spawn_tick(&self, tasks: &mut JoinSet<()>, tier: &Tier, poll: bool) -> bool {
        let Some(guard) = self.guards.get(&tier.name) else {
            return false;
        };
        let Ok(permit) = guard.clone().try_acquire_owned() else {
            debug!(tier = %tier.name, "previous tick still running, coalescing");
            return false;
        };

        let tier = tier.clone();
        let poller = self.poller.clone();
        let dispatcher = self.dispatcher.clone();
        tasks.spawn(async move {
            let _permit = permit;
            if poll {
                poller.poll_all().await;
            }
            dispatcher.dispatch(&tier, Utc::now(), false).await;
        });
        true
    }

    /// One tick covering every tier. Each tier waits for its own in-flight tick first.
    fn spawn_boundary(&self, tasks: &mut JoinSet<()>) {
        let tiers: Vec<(Tier, Arc<Semaphore>)> = self
            .plan
            .all()
            .filter_map(|tier| Some((tier.clone(), self.guards.get(&tier.name)?.clone())))
            .collect();
        let poller = self.poller.clone();
        let dispatcher = self.dispatcher.clone();

        tasks.spawn(async move {
            poller.poll_all().await;
            let at = Utc::now();
            join_all(tiers.into_iter().map(|(tier, guard)| {
                let dispatcher = dispatcher.clone();
                async move {
                    let Ok(_permit) = guard.acquire_owned().await else {
                        return;
                    };
                    dispatcher.dispatch(&tier, at, true).await;
                }
            }))
            .await;
        });
    }

    /// Reads production baselines unless a read is already running. While any period is
    /// missing, each polling tick asks again.
    fn spawn_baseline_refresh(&self, tasks: &mut JoinSet<()>, retry: bool) {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let poller = self.poller.clone();
        let dispatcher = self.dispatcher.clone();
        let refreshing = self.refreshing.clone();
        let tz = self.settings.timezone;
        tasks.spawn(async move {
            let now = Utc::now();
            let baselines = poller.read_baselines(tz, now).await;
            if dispatcher.update_baselines(baselines, now) {
                if retry {
                    info!("production baselines complete");
                }
            } else if retry {
                debug!("production baselines still incomplete");
            } else {
                warn!("production baselines incomplete, retrying on polling ticks");
            }
            refreshing.store(false, Ordering::SeqCst);
        });
    }

    fn spawn_yesterday_history(&self, tasks: &mut JoinSet<()>) {
        let poller = self.poller.clone();
        let dispatcher = self.dispatcher.clone();
        let tz = self.settings.timezone;
        tasks.spawn(async move {
            write_yesterday(&poller, &dispatcher, tz, Utc::now()).await;
        });
    }
}

/// Reads yesterday's logged production from every inverter and hands it to the sinks. The
/// site total is only added when every inverter answered.
pub(crate) async fn write_yesterday(
    poller: &Poller,
    dispatcher: &Dispatcher,
    tz: Tz,
    now: DateTime<Utc>,
) {
    let Some((start, end)) = baseline::yesterday_window(tz, now) else {
        return;
    };
    let series = poller
        .read_history(start, end, HISTORY_ATTEMPTS, HISTORY_RETRY)
        .await;
    if series.is_empty() {
        warn!("no inverter returned yesterday's history");
        return;
    }

    let missing: Vec<&str> = poller
        .device_names()
        .filter(|device| !series.contains_key(*device))
        .collect();
    let mut history = HistoryBatch::new(YESTERDAY_TOPIC, series);
    if missing.is_empty() {
        history = history.with_site_total();
    } else {
        warn!(missing = %missing.join(", "), "yesterday's history incomplete, no site total");
    }

    let outcome = dispatcher.dispatch_history(&history).await;
    info!(
        series = history.series.len(),
        delivered = outcome.delivered,
        failed = outcome.failed,
        "yesterday's production written"
    );
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
