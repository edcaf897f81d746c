use crate::clock::LocalClock;
use crate::compare::{Classification, ClockComparator, DriftReport, TimeBase};
use crate::error::{CycleError, ErrorKind};
use crate::extract::{extract, KeyPaths, LocationRecord, PageSelector};
use crate::snapshot::SnapshotStore;
use crate::traits::{PageSource, ReferenceTime};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// Upper bound on any single sleep so shutdown is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub selector: PageSelector,
    pub keys: KeyPaths,
    pub interval: Duration,
    pub time_base: TimeBase,
    pub comparator: ClockComparator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Parsing,
    Comparing,
    Published,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published(Classification),
    Failed(ErrorKind),
}

pub struct PollLoop<P, R, C>
where
    P: PageSource,
    R: ReferenceTime,
    C: LocalClock,
{
    page: P,
    reference: R,
    clock: C,
    store: Arc<SnapshotStore>,
    settings: PollSettings,

    phase: CyclePhase,
    last_record: Option<LocationRecord>,
    last_error_kind: Option<ErrorKind>,
    last_classification: Option<Classification>,

    // Metrics
    cycles: u64,
    failed_cycles: u64,
    skipped_ticks: u64,
}

impl<P, R, C> PollLoop<P, R, C>
where
    P: PageSource,
    R: ReferenceTime,
    C: LocalClock,
{
    pub fn new(page: P, reference: R, clock: C, store: Arc<SnapshotStore>, settings: PollSettings) -> Self {
        PollLoop {
            page,
            reference,
            clock,
            store,
            settings,
            phase: CyclePhase::Idle,
            last_record: None,
            last_error_kind: None,
            last_classification: None,
            cycles: 0,
            failed_cycles: 0,
            skipped_ticks: 0,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// One fetch → extract → compare → publish pass. Never fails: errors end up in the
    /// snapshot and the loop goes back to idle.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        self.cycles += 1;
        let outcome = match self.try_cycle() {
            Ok(report) => {
                self.phase = CyclePhase::Published;
                self.note_success(&report);
                CycleOutcome::Published(report.classification)
            }
            Err(e) => {
                self.phase = CyclePhase::Failed;
                self.failed_cycles += 1;
                let kind = e.kind();
                if self.last_error_kind != Some(kind) {
                    warn!("[Poll] Cycle failed: {}", e);
                } else {
                    debug!("[Poll] Cycle failed: {}", e);
                }
                self.last_error_kind = Some(kind);
                self.store.publish_error(&e);
                CycleOutcome::Failed(kind)
            }
        };
        self.phase = CyclePhase::Idle;
        outcome
    }

    fn try_cycle(&mut self) -> Result<DriftReport, CycleError> {
        self.phase = CyclePhase::Fetching;
        let html = self.page.fetch()?;
        let fetched_at = Instant::now();
        let local_time_s = self.clock.now();

        self.phase = CyclePhase::Parsing;
        let record = extract(&html, &self.settings.selector, &self.settings.keys)?;

        self.phase = CyclePhase::Comparing;
        // Project the reference back to the moment the page arrived.
        let reference_time_s = self
            .reference
            .now()
            .ok()
            .map(|t| t - fetched_at.elapsed().as_secs_f64());
        let gps_time_s = self.settings.time_base.to_unix(record.gps_time_s);
        let report = self
            .settings
            .comparator
            .compare(gps_time_s, local_time_s, reference_time_s);

        if self.last_record.as_ref() != Some(&record) {
            debug!(
                "[Poll] Location updated: {:.6}, {:.6}, {:.1} m",
                record.latitude, record.longitude, record.altitude_meters
            );
        } else {
            debug!("[Poll] No new location update");
        }

        self.store.publish(record, report);
        self.last_record = Some(record);
        Ok(report)
    }

    fn note_success(&mut self, report: &DriftReport) {
        if self.last_error_kind.take().is_some() {
            info!("[Poll] Recovered after failed cycles");
        }
        if self.last_classification != Some(report.classification) {
            info!(
                "[Poll] Clock status {:?} (gps-local {:+.3} s, gps-ref {}, local-ref {})",
                report.classification,
                report.gps_vs_local_s,
                fmt_secs(report.gps_vs_reference_s),
                fmt_secs(report.local_vs_reference_s)
            );
            self.last_classification = Some(report.classification);
        }
        let lag = report.gps_lag_s();
        if lag > self.settings.interval.as_secs_f64() {
            warn!(
                "[Poll] Stale GPS reading: {:.3} s behind the host clock",
                lag
            );
        }
    }

    pub fn log_status(&self) {
        let snapshot = self.store.read();
        match (snapshot.report, snapshot.last_error) {
            (_, Some(err)) => info!(
                "[Status] {} cycles, {} failed, {} ticks skipped | failing for {} cycles: {}",
                self.cycles, self.failed_cycles, self.skipped_ticks, snapshot.consecutive_failures, err.message
            ),
            (Some(report), None) => info!(
                "[Status] {} cycles, {} failed, {} ticks skipped | {:?} gps-local {:+.3} s",
                self.cycles, self.failed_cycles, self.skipped_ticks, report.classification, report.gps_vs_local_s
            ),
            (None, None) => info!("[Status] Waiting for first update..."),
        }
    }

    /// Run cycles on the configured interval until `running` is cleared. Ticks that pass
    /// while a cycle is still busy are dropped, not queued.
    pub fn run(&mut self, running: Arc<AtomicBool>) {
        info!(
            "[Poll] Polling every {:?} with selector '{}'",
            self.settings.interval,
            self.settings.selector.as_str()
        );
        let mut next_tick = Instant::now();
        let mut last_status = Instant::now();

        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now < next_tick {
                thread::sleep((next_tick - now).min(WAIT_SLICE));
                continue;
            }

            self.run_cycle();

            let (next, skipped) = next_deadline(next_tick, self.settings.interval, Instant::now());
            if skipped > 0 {
                debug!("[Poll] Cycle overran, skipping {} tick(s)", skipped);
                self.skipped_ticks += skipped as u64;
            }
            next_tick = next;

            if last_status.elapsed() >= STATUS_INTERVAL {
                self.log_status();
                last_status = Instant::now();
            }
        }
        info!("[Poll] Stopped after {} cycles", self.cycles);
    }
}

/// The first tick after `prev` that falls at or after `now`, and how many ticks were
/// skipped to reach it. A tick exactly at `now` is due, not missed.
pub fn next_deadline(prev: Instant, interval: Duration, now: Instant) -> (Instant, u32) {
    if interval.is_zero() {
        return (now, 0);
    }
    let next = prev + interval;
    if next >= now {
        return (next, 0);
    }
    let behind = (now - next).as_nanos();
    let step = interval.as_nanos();
    let skipped = behind.div_ceil(step) as u32;
    (next + interval * skipped, skipped)
}

fn fmt_secs(v: Option<f64>) -> String {
    match v {
        Some(s) => format!("{:+.3} s", s),
        None => "n/a".to_string(),
    }
}
