//! Background audit writer
//!
//! One dedicated thread drains the counters into the audit store. Its life is a
//! small state machine:
//!
//! ```text
//! Connecting -> Flushing -> (Reconnecting | Recovering) -> Connecting ...
//!                   \-> Stopped
//! ```
//!
//! `Flushing` repeats flush pass + flush delay on one connection until a
//! reconnect is requested or a write fails. A failed connection or write moves
//! to `Recovering`, which waits out the recovery delay before connecting again.

use super::counters::AuditCounters;
use super::key::Traffic;
use crate::error::Result;
use crate::store::{AuditConnection, AuditRecord, AuditStore};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Settings read by the writer at the start of every flush pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSettings {
    pub publish_service: String,
    pub deliver_service: String,
    pub flush_delay: Duration,
    pub connection_recovery_delay: Duration,
    pub update_delay: Duration,
    pub progress_log_count: u64,
}

impl WriterSettings {
    fn service(&self, traffic: Traffic) -> &str {
        match traffic {
            Traffic::Publish => &self.publish_service,
            Traffic::Deliver => &self.deliver_service,
        }
    }
}

/// Flags and wake-ups shared between the aggregator and one writer thread
#[derive(Debug)]
pub(crate) struct WorkerSignal {
    keep_going: AtomicBool,
    reconnect: AtomicBool,
    started: Mutex<bool>,
    started_cv: Condvar,
    wake: Mutex<()>,
    wake_cv: Condvar,
}

impl WorkerSignal {
    pub(crate) fn new() -> Self {
        Self {
            keep_going: AtomicBool::new(true),
            reconnect: AtomicBool::new(false),
            started: Mutex::new(false),
            started_cv: Condvar::new(),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.keep_going.load(Ordering::Acquire)
    }

    /// Ask the writer to exit; idempotent
    pub(crate) fn stop(&self) {
        self.keep_going.store(false, Ordering::Release);
        self.notify();
    }

    pub(crate) fn request_reconnect(&self) {
        self.reconnect.store(true, Ordering::Release);
        self.notify();
    }

    fn take_reconnect(&self) -> bool {
        self.reconnect.swap(false, Ordering::AcqRel)
    }

    fn notify(&self) {
        let _guard = self.wake.lock();
        self.wake_cv.notify_all();
    }

    /// Sleep for `duration`, waking early on stop or reconnect requests
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut guard = self.wake.lock();
        while self.is_running() && !self.reconnect.load(Ordering::Acquire) {
            if self.wake_cv.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
    }

    fn mark_started(&self) {
        *self.started.lock() = true;
        self.started_cv.notify_all();
    }

    /// Wait for the writer to report it has started
    pub(crate) fn wait_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut started = self.started.lock();
        while !*started {
            if self.started_cv.wait_until(&mut started, deadline).timed_out() {
                return *started;
            }
        }
        true
    }
}

/// How a flush pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlushSummary {
    pub written: u64,
    pub removed: u64,
}

/// Write every nonzero counter once and drop counters found at zero
///
/// A failed write puts its count back before the error is returned. A stop
/// during the inter-write delay ends the pass early; the counts already
/// written stay written.
pub(crate) fn flush_pass(
    counters: &AuditCounters,
    conn: &mut dyn AuditConnection,
    settings: &WriterSettings,
    signal: Option<&WorkerSignal>,
) -> Result<FlushSummary> {
    let mut summary = FlushSummary {
        written: 0,
        removed: 0,
    };

    for key in counters.keys() {
        let count = match counters.take(&key) {
            None => continue,
            Some(0) => {
                if counters.remove_if_zero(&key) {
                    summary.removed += 1;
                }
                continue;
            }
            Some(count) => count,
        };

        let record = AuditRecord {
            service: settings.service(key.traffic),
            object_id: key.object_id,
            source_id: key.source_id.as_deref(),
            bucket: key.bucket,
            count,
        };
        if let Err(e) = conn.increment(&record) {
            counters.restore(key, count);
            return Err(e);
        }

        summary.written += 1;
        if settings.progress_log_count > 0 && summary.written % settings.progress_log_count == 0 {
            info!(written = summary.written, "Audit flush progress");
        }

        if let Some(signal) = signal {
            if !settings.update_delay.is_zero() {
                signal.pause(settings.update_delay);
                if !signal.is_running() {
                    debug!(written = summary.written, "Audit flush interrupted");
                    break;
                }
            }
        }
    }

    Ok(summary)
}

enum WriterState {
    Connecting,
    Flushing(Box<dyn AuditConnection>),
    Reconnecting,
    Recovering,
    Stopped,
}

/// The writer thread body
pub(crate) struct AuditWriter {
    pub(crate) counters: Arc<AuditCounters>,
    pub(crate) store: Arc<dyn AuditStore>,
    pub(crate) settings: Arc<RwLock<WriterSettings>>,
    pub(crate) signal: Arc<WorkerSignal>,
}

impl AuditWriter {
    pub(crate) fn run(self) {
        self.signal.mark_started();
        info!("Audit writer started");

        let mut state = WriterState::Connecting;
        loop {
            state = match state {
                WriterState::Connecting => self.connect(),
                WriterState::Flushing(conn) => self.flush(conn),
                WriterState::Reconnecting => {
                    info!("Audit writer reconnecting");
                    WriterState::Connecting
                }
                WriterState::Recovering => self.recover(),
                WriterState::Stopped => break,
            };
        }

        info!("Audit writer stopped");
    }

    fn connect(&self) -> WriterState {
        if !self.signal.is_running() {
            self.connect_and_drain();
            return WriterState::Stopped;
        }
        match self.store.connect() {
            Ok(conn) => {
                debug!("Audit writer connected");
                // a reconnect asked for before this connection existed is served
                self.signal.take_reconnect();
                WriterState::Flushing(conn)
            }
            Err(e) => {
                warn!(error = %e, "Audit store connection failed");
                WriterState::Recovering
            }
        }
    }

    fn flush(&self, mut conn: Box<dyn AuditConnection>) -> WriterState {
        let settings = self.settings.read().clone();

        if let Err(e) = flush_pass(&self.counters, conn.as_mut(), &settings, Some(&self.signal)) {
            warn!(error = %e, pending = self.counters.len(), "Audit flush failed");
            return WriterState::Recovering;
        }

        self.signal.pause(settings.flush_delay);

        if !self.signal.is_running() {
            self.drain(conn.as_mut(), &settings);
            return WriterState::Stopped;
        }
        if self.signal.take_reconnect() {
            return WriterState::Reconnecting;
        }
        WriterState::Flushing(conn)
    }

    /// Last pass on stop, without inter-write delays
    fn drain(&self, conn: &mut dyn AuditConnection, settings: &WriterSettings) {
        match flush_pass(&self.counters, conn, settings, None) {
            Ok(summary) => debug!(written = summary.written, "Audit counters drained"),
            Err(e) => warn!(
                error = %e,
                pending = self.counters.len(),
                "Audit drain failed, counts kept in memory"
            ),
        }
    }

    /// Stopped before a connection was opened; persist what is pending
    fn connect_and_drain(&self) {
        if self.counters.is_empty() {
            return;
        }
        match self.store.connect() {
            Ok(mut conn) => {
                let settings = self.settings.read().clone();
                self.drain(conn.as_mut(), &settings);
            }
            Err(e) => warn!(
                error = %e,
                pending = self.counters.len(),
                "Audit store connection failed, counts kept in memory"
            ),
        }
    }

    fn recover(&self) -> WriterState {
        let delay = self.settings.read().connection_recovery_delay;
        self.signal.pause(delay);
        if self.signal.is_running() {
            WriterState::Connecting
        } else {
            WriterState::Stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::key::AuditKey;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn make_settings() -> WriterSettings {
        WriterSettings {
            publish_service: "flxi".to_string(),
            deliver_service: "flxo".to_string(),
            flush_delay: Duration::from_millis(20),
            connection_recovery_delay: Duration::from_millis(20),
            update_delay: Duration::ZERO,
            progress_log_count: 1,
        }
    }

    fn make_key(traffic: Traffic, object_id: i64, source_id: Option<&str>) -> AuditKey {
        AuditKey::new(
            traffic,
            object_id,
            source_id.map(str::to_string),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        )
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_flush_pass_writes_deltas() {
        let store = MemoryStore::new();
        let counters = AuditCounters::new();
        counters.add(make_key(Traffic::Publish, 1, Some("a")), 10);
        counters.add(make_key(Traffic::Publish, 1, Some("a")), 20);
        counters.add(make_key(Traffic::Publish, 1, Some("a")), 5);
        counters.add(make_key(Traffic::Deliver, 7, None), 4);

        let mut conn = store.connect().unwrap();
        let summary = flush_pass(&counters, conn.as_mut(), &make_settings(), None).unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(store.audit_total("flxi", 1, Some("a")), 35);
        assert_eq!(store.audit_total("flxo", 7, None), 4);
        assert_eq!(counters.get(&make_key(Traffic::Publish, 1, Some("a"))), Some(0));

        let summary = flush_pass(&counters, conn.as_mut(), &make_settings(), None).unwrap();
        assert_eq!(summary.written, 0);
        assert_eq!(summary.removed, 2);
        assert!(counters.is_empty());
        assert_eq!(store.audit_writes().len(), 2);
    }

    #[test]
    fn test_flush_pass_failure_keeps_count() {
        let store = MemoryStore::new();
        let counters = AuditCounters::new();
        counters.add(make_key(Traffic::Publish, 1, Some("a")), 10);

        let mut conn = store.connect().unwrap();
        store.fail_next_writes(1);
        assert!(flush_pass(&counters, conn.as_mut(), &make_settings(), None).is_err());
        assert_eq!(counters.get(&make_key(Traffic::Publish, 1, Some("a"))), Some(10));
        assert!(store.audit_writes().is_empty());
    }

    #[test]
    fn test_writer_recovers_after_failures() {
        let store = MemoryStore::new();
        store.fail_next_connects(2);
        store.fail_next_writes(1);

        let counters = Arc::new(AuditCounters::new());
        counters.add(make_key(Traffic::Publish, 1, Some("a")), 10);

        let signal = Arc::new(WorkerSignal::new());
        let writer = AuditWriter {
            counters: Arc::clone(&counters),
            store: Arc::new(store.clone()),
            settings: Arc::new(RwLock::new(make_settings())),
            signal: Arc::clone(&signal),
        };
        let thread = std::thread::spawn(move || writer.run());
        assert!(signal.wait_started(Duration::from_secs(1)));

        assert!(wait_for(|| store.audit_total("flxi", 1, Some("a")) == 10));
        // two failed connects, then one connection dropped after the failed write
        assert!(store.connect_count() >= 2);

        signal.stop();
        thread.join().unwrap();
    }

    #[test]
    fn test_stop_drains_pending_counts() {
        let store = MemoryStore::new();
        let counters = Arc::new(AuditCounters::new());
        let mut settings = make_settings();
        settings.flush_delay = Duration::from_secs(60);

        let signal = Arc::new(WorkerSignal::new());
        let writer = AuditWriter {
            counters: Arc::clone(&counters),
            store: Arc::new(store.clone()),
            settings: Arc::new(RwLock::new(settings)),
            signal: Arc::clone(&signal),
        };
        let thread = std::thread::spawn(move || writer.run());
        assert!(signal.wait_started(Duration::from_secs(1)));
        assert!(wait_for(|| store.connect_count() == 1));

        counters.add(make_key(Traffic::Publish, 2, Some("b")), 42);
        signal.stop();
        thread.join().unwrap();

        assert_eq!(store.audit_total("flxi", 2, Some("b")), 42);
    }

    #[test]
    fn test_stop_before_connect_drains() {
        let store = MemoryStore::new();
        let counters = Arc::new(AuditCounters::new());
        counters.add(make_key(Traffic::Publish, 3, Some("x")), 8);

        let signal = Arc::new(WorkerSignal::new());
        signal.stop();
        let writer = AuditWriter {
            counters: Arc::clone(&counters),
            store: Arc::new(store.clone()),
            settings: Arc::new(RwLock::new(make_settings())),
            signal: Arc::clone(&signal),
        };
        writer.run();

        assert_eq!(store.audit_total("flxi", 3, Some("x")), 8);
        assert_eq!(store.connect_count(), 1);
        assert_eq!(counters.get(&make_key(Traffic::Publish, 3, Some("x"))), Some(0));
    }

    #[test]
    fn test_stop_before_connect_without_counts() {
        let store = MemoryStore::new();
        let signal = Arc::new(WorkerSignal::new());
        signal.stop();
        let writer = AuditWriter {
            counters: Arc::new(AuditCounters::new()),
            store: Arc::new(store.clone()),
            settings: Arc::new(RwLock::new(make_settings())),
            signal,
        };
        writer.run();
        assert_eq!(store.connect_count(), 0);
    }

    #[test]
    fn test_reconnect_request() {
        let store = MemoryStore::new();
        let signal = Arc::new(WorkerSignal::new());
        let writer = AuditWriter {
            counters: Arc::new(AuditCounters::new()),
            store: Arc::new(store.clone()),
            settings: Arc::new(RwLock::new(make_settings())),
            signal: Arc::clone(&signal),
        };
        let thread = std::thread::spawn(move || writer.run());
        assert!(wait_for(|| store.connect_count() == 1));

        signal.request_reconnect();
        assert!(wait_for(|| store.connect_count() == 2));

        signal.stop();
        thread.join().unwrap();
    }

    #[test]
    fn test_stop_during_recovery_exits() {
        let store = MemoryStore::new();
        store.fail_next_connects(usize::MAX);
        let mut settings = make_settings();
        settings.connection_recovery_delay = Duration::from_secs(60);

        let signal = Arc::new(WorkerSignal::new());
        let writer = AuditWriter {
            counters: Arc::new(AuditCounters::new()),
            store: Arc::new(store.clone()),
            settings: Arc::new(RwLock::new(settings)),
            signal: Arc::clone(&signal),
        };
        let thread = std::thread::spawn(move || writer.run());
        assert!(signal.wait_started(Duration::from_secs(1)));

        let started = Instant::now();
        signal.stop();
        thread.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.connect_count(), 0);
    }
}
