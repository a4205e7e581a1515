// src/monitor/synchronizer.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::ami::client::AmiClient;
use crate::ami::correlator::ActionResult;
use crate::ami::message::Message;
use crate::config::{MonitorConfig, QueryStrategy};
use crate::error::{AmiError, AmiResult};

use super::status::{map_status_code, DeviceState, ExtensionStatus, StatusChange};
use super::store::{ChangeSink, ExtensionProvider, StatusStore};

/// Raw code written when an extension went missing from the query result;
/// keeps the stored record consistent with `map_status_code`.
const ABSENT_RAW_CODE: &str = "4";

/// Where a synchronization cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Querying,
    Diffing,
}

/// The query side of the AMI client, as the synchronizer sees it.
#[async_trait]
pub trait StatusQuerier: Send + Sync {
    async fn extension_state(&self, exten: &str, context: &str) -> AmiResult<ActionResult>;
    async fn extension_state_list(&self) -> AmiResult<ActionResult>;
}

#[async_trait]
impl StatusQuerier for AmiClient {
    async fn extension_state(&self, exten: &str, context: &str) -> AmiResult<ActionResult> {
        AmiClient::extension_state(self, exten, context).await
    }

    async fn extension_state_list(&self) -> AmiResult<ActionResult> {
        AmiClient::extension_state_list(self).await
    }
}

/// Counters across the synchronizer's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub ticks_skipped_busy: u64,
    pub queries_issued: u64,
    pub queries_failed: u64,
    pub writes: u64,
    pub notifications: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    ticks_skipped_busy: AtomicU64,
    queries_issued: AtomicU64,
    queries_failed: AtomicU64,
    writes: AtomicU64,
    notifications: AtomicU64,
}

/// Outcome of one cycle.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub monitored: usize,
    pub present: usize,
    pub absent: usize,
    pub failed: usize,
    pub changed: usize,
}

/// What one query learned about one extension.
enum Observation {
    Present { raw_code: String, context: String },
    /// Definitive answer that the switch does not know the extension.
    Absent,
    /// Query failed (timeout, connection loss); the stored record must be
    /// left untouched for this cycle.
    Failed,
}

/// Drives the periodic status-sync loop: fetch the monitored list, query
/// the switch, diff against the store, write and notify only what changed.
///
/// A cycle moves Idle → Querying → Diffing → Idle; the phase doubles as the
/// overlap guard, so a tick or manual trigger that lands mid-cycle is
/// rejected with `Busy` instead of starting a second cycle.
pub struct ExtensionSynchronizer {
    querier: Arc<dyn StatusQuerier>,
    provider: Arc<dyn ExtensionProvider>,
    store: Arc<dyn StatusStore>,
    sink: Arc<dyn ChangeSink>,
    config: MonitorConfig,
    phase: Mutex<CyclePhase>,
    stats: StatsInner,
}

/// Resets the phase to Idle when the cycle ends, on every exit path.
struct PhaseGuard<'a> {
    phase: &'a Mutex<CyclePhase>,
}

impl<'a> PhaseGuard<'a> {
    fn set(&self, phase: CyclePhase) {
        *self.phase.lock().unwrap() = phase;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock().unwrap() = CyclePhase::Idle;
    }
}

impl ExtensionSynchronizer {
    pub fn new(
        querier: Arc<dyn StatusQuerier>,
        provider: Arc<dyn ExtensionProvider>,
        store: Arc<dyn StatusStore>,
        sink: Arc<dyn ChangeSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            querier,
            provider,
            store,
            sink,
            config,
            phase: Mutex::new(CyclePhase::Idle),
            stats: StatsInner::default(),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            cycles_completed: self.stats.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.stats.cycles_failed.load(Ordering::Relaxed),
            ticks_skipped_busy: self.stats.ticks_skipped_busy.load(Ordering::Relaxed),
            queries_issued: self.stats.queries_issued.load(Ordering::Relaxed),
            queries_failed: self.stats.queries_failed.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            notifications: self.stats.notifications.load(Ordering::Relaxed),
        }
    }

    /// Run one cycle now. Returns `Busy` when a cycle is already in flight;
    /// the caller decides whether to wait or drop the trigger.
    pub async fn sync_now(&self) -> AmiResult<CycleReport> {
        let guard = self.try_begin()?;
        let result = self.run_cycle(&guard).await;
        match &result {
            Ok(report) => {
                self.stats.cycles_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    monitored = report.monitored,
                    present = report.present,
                    absent = report.absent,
                    failed = report.failed,
                    changed = report.changed,
                    "Synchronization cycle completed"
                );
            }
            Err(e) => {
                self.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
                error!(code = e.error_code(), "Synchronization cycle failed: {}", e);
            }
        }
        result
    }

    /// Periodic loop plus event-driven refresh. A tick that fires while the
    /// previous cycle is still running is skipped and logged, never queued.
    pub async fn run(
        self: Arc<Self>,
        mut live: Option<broadcast::Receiver<Arc<Message>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            strategy = ?self.config.strategy,
            "Extension synchronizer running"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_now().await {
                        Ok(_) => {}
                        Err(AmiError::Busy) => {
                            self.stats.ticks_skipped_busy.fetch_add(1, Ordering::Relaxed);
                            warn!("Poll tick skipped: previous cycle still running");
                        }
                        Err(e) if e.is_connection_error() => {
                            warn!("Cycle lost its connection; the client is reconnecting");
                        }
                        Err(_) => {} // already logged by sync_now
                    }
                }
                event = Self::recv_live(&mut live) => {
                    // None means the receiver lagged; either way something
                    // changed on the switch, so refresh early.
                    if let Some(event) = &event {
                        debug!(exten = event.get("Exten").unwrap_or("?"),
                            "Unsolicited status event; refreshing early");
                    }
                    if let Err(AmiError::Busy) = self.sync_now().await {
                        debug!("Refresh trigger dropped: cycle in progress");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Extension synchronizer shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn recv_live(
        live: &mut Option<broadcast::Receiver<Arc<Message>>>,
    ) -> Option<Arc<Message>> {
        match live {
            Some(rx) => match rx.recv().await {
                Ok(msg) => Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Live status events lagged; refreshing anyway");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => {
                    *live = None;
                    std::future::pending().await
                }
            },
            None => std::future::pending().await,
        }
    }

    fn try_begin(&self) -> AmiResult<PhaseGuard<'_>> {
        let mut phase = self.phase.lock().unwrap();
        if *phase != CyclePhase::Idle {
            return Err(AmiError::Busy);
        }
        *phase = CyclePhase::Querying;
        Ok(PhaseGuard { phase: &self.phase })
    }

    async fn run_cycle(&self, guard: &PhaseGuard<'_>) -> AmiResult<CycleReport> {
        let monitored = self.provider.monitored_extensions().await?;
        if monitored.is_empty() {
            return Ok(CycleReport::default());
        }

        let (observations, partial) = match self.config.strategy {
            QueryStrategy::Individual => (self.query_individually(&monitored).await, false),
            QueryStrategy::Bulk => self.query_bulk(&monitored).await?,
        };

        guard.set(CyclePhase::Diffing);
        let mut report = CycleReport {
            monitored: monitored.len(),
            ..CycleReport::default()
        };

        for extension in &monitored {
            match observations.get(extension).unwrap_or(&Observation::Absent) {
                Observation::Present { raw_code, context } => {
                    report.present += 1;
                    if self.apply_observation(extension, raw_code, context).await? {
                        report.changed += 1;
                    }
                }
                Observation::Absent => {
                    report.absent += 1;
                    // A partial bulk result proves nothing about absentees.
                    if !partial && self.apply_absence(extension).await? {
                        report.changed += 1;
                    }
                }
                Observation::Failed => {
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// One ExtensionState action per extension, issued in parallel so a
    /// slow or unreachable extension never stalls the rest of the cycle.
    async fn query_individually(&self, monitored: &[String]) -> HashMap<String, Observation> {
        let context = self.config.context.clone();
        let queries = monitored.iter().map(|extension| {
            let querier = Arc::clone(&self.querier);
            let context = context.clone();
            async move {
                let outcome = querier.extension_state(extension, &context).await;
                (extension.clone(), outcome)
            }
        });

        let mut observations = HashMap::new();
        for (extension, outcome) in join_all(queries).await {
            self.stats.queries_issued.fetch_add(1, Ordering::Relaxed);
            let observation = match outcome {
                Ok(result) => Self::observe_single(&result),
                Err(AmiError::QueryTimeout { .. }) => {
                    self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(extension = %extension, "Status query timed out");
                    Observation::Failed
                }
                Err(e) => {
                    self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(extension = %extension, "Status query failed: {}", e);
                    Observation::Failed
                }
            };
            observations.insert(extension, observation);
        }
        observations
    }

    fn observe_single(result: &ActionResult) -> Observation {
        match &result.response {
            Some(resp) if resp.is_success() => match resp.get("Status") {
                Some(raw) => Observation::Present {
                    raw_code: raw.to_string(),
                    context: resp.get("Context").unwrap_or_default().to_string(),
                },
                None => Observation::Failed,
            },
            // "No such extension": a definitive answer, not a failure.
            Some(resp) if resp.is_error_response() => Observation::Absent,
            _ => Observation::Failed,
        }
    }

    /// One ExtensionStateList action for the whole context. Returns the
    /// observations plus whether the result is partial (timed out mid-list).
    async fn query_bulk(
        &self,
        monitored: &[String],
    ) -> AmiResult<(HashMap<String, Observation>, bool)> {
        self.stats.queries_issued.fetch_add(1, Ordering::Relaxed);
        let (events, response, partial) = match self.querier.extension_state_list().await {
            Ok(result) => (result.events, result.response, false),
            Err(AmiError::QueryTimeout { events, .. }) if !events.is_empty() => {
                // Partial data beats none; the absence step is skipped.
                self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
                warn!(events = events.len(), "Bulk query timed out with partial list");
                (events, None, true)
            }
            Err(e) => {
                self.stats.queries_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let mut observations: HashMap<String, Observation> = HashMap::new();
        for event in &events {
            if event.event_name() != Some("ExtensionStatus") {
                continue;
            }
            let (Some(exten), Some(raw)) = (event.get("Exten"), event.get("Status")) else {
                continue;
            };
            observations.insert(
                exten.to_string(),
                Observation::Present {
                    raw_code: raw.to_string(),
                    context: event
                        .get("Context")
                        .unwrap_or(self.config.context.as_str())
                        .to_string(),
                },
            );
        }

        // Aggregated-response servers answer without per-extension events;
        // a single echoed status still counts, anything else means the
        // cycle learned nothing and must not offline anybody.
        if observations.is_empty() {
            match response.as_ref() {
                Some(resp) if resp.is_success() && resp.get("Status").is_some() => {
                    if let Some(exten) = resp.get("Exten") {
                        observations.insert(
                            exten.to_string(),
                            Observation::Present {
                                raw_code: resp.get("Status").unwrap_or_default().to_string(),
                                context: resp
                                    .get("Context")
                                    .unwrap_or(self.config.context.as_str())
                                    .to_string(),
                            },
                        );
                    }
                }
                _ => {
                    warn!("Bulk query returned no usable extension data");
                    let failed = monitored
                        .iter()
                        .map(|e| (e.clone(), Observation::Failed))
                        .collect();
                    return Ok((failed, true));
                }
            }
        }

        Ok((observations, partial))
    }

    /// Diff one fresh observation against the store. Returns whether a
    /// write (and notification) happened.
    async fn apply_observation(
        &self,
        extension: &str,
        raw_code: &str,
        context: &str,
    ) -> AmiResult<bool> {
        let state = map_status_code(raw_code);
        let context = if context.is_empty() {
            self.config.context.as_str()
        } else {
            context
        };

        let stored = self.store.load(extension).await?;
        let previous = stored.as_ref().map(|s| s.state);
        if let Some(stored) = &stored {
            if !stored.differs_from(raw_code, state, context) {
                return Ok(false);
            }
        }

        let record = ExtensionStatus::observed(extension, raw_code, context);
        self.write_and_notify(record, previous).await?;
        Ok(true)
    }

    /// An extension the cycle did not see goes Offline, once per absence
    /// streak: if it is already Offline nothing is written.
    async fn apply_absence(&self, extension: &str) -> AmiResult<bool> {
        let stored = self.store.load(extension).await?;
        let (previous, context) = match &stored {
            Some(s) if s.state == DeviceState::Offline => return Ok(false),
            Some(s) => (Some(s.state), s.context.clone()),
            None => (None, self.config.context.clone()),
        };

        let record = ExtensionStatus::observed(extension, ABSENT_RAW_CODE, &context);
        self.write_and_notify(record, previous).await?;
        Ok(true)
    }

    async fn write_and_notify(
        &self,
        record: ExtensionStatus,
        previous: Option<DeviceState>,
    ) -> AmiResult<()> {
        self.store.save(&record).await?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);

        let change = StatusChange {
            extension: record.extension.clone(),
            previous,
            current: record.state,
            raw_code: record.raw_code.clone(),
            context: record.context.clone(),
            at: record.last_changed,
        };
        self.sink.publish(&change).await;
        self.stats.notifications.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
