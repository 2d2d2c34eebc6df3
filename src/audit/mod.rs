//! Usage auditing
//!
//! Request threads add payload byte counts to in-memory counters; one
//! background writer thread periodically persists them as deltas to be added
//! to the stored totals.

mod counters;
mod key;
mod writer;

pub use counters::AuditCounters;
pub use key::{bucket_start, AuditKey, Traffic, BUCKET_SECS};
pub use writer::WriterSettings;

use crate::clock::{Clock, SystemClock};
use crate::config::AuditConfig;
use crate::error::{Error, Result};
use crate::mqtt::Message;
use crate::store::AuditStore;
use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use writer::{flush_pass, AuditWriter, WorkerSignal};

const WRITER_THREAD_NAME: &str = "audit-writer";

struct WorkerHandle {
    signal: Arc<WorkerSignal>,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    fn is_active(&self) -> bool {
        self.signal.is_running() && !self.thread.is_finished()
    }
}

fn writer_settings(config: &AuditConfig) -> WriterSettings {
    WriterSettings {
        publish_service: config.publish_service.clone(),
        deliver_service: config.deliver_service.clone(),
        flush_delay: Duration::from_millis(config.flush_delay_ms),
        connection_recovery_delay: Duration::from_millis(config.connection_recovery_delay_ms),
        update_delay: Duration::from_millis(config.update_delay_ms),
        progress_log_count: config.progress_log_count,
    }
}

fn deliver_topic_regex(config: &AuditConfig) -> anyhow::Result<Regex> {
    Regex::new(&config.deliver_topic_regex).with_context(|| {
        format!(
            "Invalid deliver-topic-regex: {}",
            config.deliver_topic_regex
        )
    })
}

/// Compiled audit settings
pub struct AuditSettings {
    writer: WriterSettings,
    deliver_topic: Regex,
    startup_timeout: Duration,
    recording: bool,
}

impl AuditSettings {
    pub fn from_config(config: &AuditConfig) -> anyhow::Result<Self> {
        Ok(Self {
            writer: writer_settings(config),
            deliver_topic: deliver_topic_regex(config)?,
            startup_timeout: Duration::from_millis(config.startup_timeout_ms),
            recording: config.enabled,
        })
    }
}

/// Audit aggregator - coalesces byte counts per key and hour, persisted by a
/// background writer
pub struct AuditAggregator {
    counters: Arc<AuditCounters>,
    store: Arc<dyn AuditStore>,
    settings: Arc<RwLock<WriterSettings>>,
    deliver_topic: RwLock<Regex>,
    recording: AtomicBool,
    startup_timeout: RwLock<Duration>,
    clock: Arc<dyn Clock>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl AuditAggregator {
    /// Create an aggregator; the writer is not started until [`enable`](Self::enable)
    pub fn new(config: &AuditConfig, store: Arc<dyn AuditStore>) -> anyhow::Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &AuditConfig,
        store: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            counters: Arc::new(AuditCounters::new()),
            store,
            settings: Arc::new(RwLock::new(writer_settings(config))),
            deliver_topic: RwLock::new(deliver_topic_regex(config)?),
            recording: AtomicBool::new(config.enabled),
            startup_timeout: RwLock::new(Duration::from_millis(config.startup_timeout_ms)),
            clock,
            worker: Mutex::new(None),
        })
    }

    /// Count the payload of a published message against a node and source
    pub fn record_publish(&self, object_id: i64, source_id: Option<&str>, message: &Message) {
        let count = message.payload.len() as u64;
        if count == 0 || !self.recording.load(Ordering::Acquire) {
            return;
        }
        let key = AuditKey::new(
            Traffic::Publish,
            object_id,
            source_id.map(str::to_string),
            self.clock.now(),
        );
        trace!(object_id, source_id = ?source_id, count, "Audit publish");
        self.counters.add(key, count);
    }

    /// Count the payload of a delivered message
    ///
    /// Node datum topics are counted per node and source, other user topics
    /// per user. Topics matching neither are ignored.
    pub fn record_deliver(&self, message: &Message) {
        let count = message.payload.len() as u64;
        if count == 0 || !self.recording.load(Ordering::Acquire) {
            return;
        }

        let key = {
            let pattern = self.deliver_topic.read();
            let Some(caps) = pattern.captures(&message.topic) else {
                trace!(topic = %message.topic, "Deliver topic not audited");
                return;
            };
            let id = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<i64>().ok());
            let source = caps.name("sourceId").map(|m| m.as_str().to_string());

            match (id("nodeId"), source, id("userId")) {
                (Some(node_id), Some(source_id), _) => {
                    AuditKey::new(Traffic::Deliver, node_id, Some(source_id), self.clock.now())
                }
                (_, _, Some(user_id)) => {
                    AuditKey::new(Traffic::Deliver, user_id, None, self.clock.now())
                }
                _ => {
                    trace!(topic = %message.topic, "Deliver topic not audited");
                    return;
                }
            }
        };
        self.counters.add(key, count);
    }

    /// Start the writer
    ///
    /// Waits up to the startup timeout for the writer to begin. Does nothing
    /// if a writer is already running.
    pub fn enable(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(WorkerHandle::is_active) {
            return Ok(());
        }

        let signal = Arc::new(WorkerSignal::new());
        let writer = AuditWriter {
            counters: Arc::clone(&self.counters),
            store: Arc::clone(&self.store),
            settings: Arc::clone(&self.settings),
            signal: Arc::clone(&signal),
        };
        let thread = std::thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || writer.run())
            .map_err(Error::WriterSpawn)?;

        let timeout = *self.startup_timeout.read();
        if !signal.wait_started(timeout) {
            warn!(timeout_ms = timeout.as_millis() as u64, "Audit writer slow to start");
        }

        // a previous writer that is still stopping finishes on its own
        *worker = Some(WorkerHandle { signal, thread });
        info!("Audit writer enabled");
        Ok(())
    }

    /// Signal the writer to stop, without waiting for it
    pub fn disable(&self) {
        if let Some(handle) = self.worker.lock().as_ref() {
            handle.signal.stop();
            info!("Audit writer disabled");
        }
    }

    /// Make the writer drop its connection and open a new one
    pub fn force_reconnect(&self) {
        if let Some(handle) = self.worker.lock().as_ref() {
            handle.signal.request_reconnect();
        }
    }

    /// Whether a writer is running
    pub fn is_enabled(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(WorkerHandle::is_active)
    }

    /// Stop the writer and wait up to `timeout` for it to finish its final
    /// drain. Returns `true` if it finished in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let Some(handle) = self.worker.lock().take() else {
            return true;
        };
        handle.signal.stop();

        let deadline = Instant::now() + timeout;
        while !handle.thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(pending = self.counters.len(), "Audit writer did not stop in time");
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.thread.join().is_err() {
            warn!("Audit writer panicked");
        }
        debug!(pending = self.counters.len(), "Audit writer shut down");
        true
    }

    /// Apply new audit settings
    ///
    /// Service names take effect from the next flush pass; callers changing
    /// them should also [`force_reconnect`](Self::force_reconnect).
    pub fn reconfigure(&self, config: &AuditConfig) -> anyhow::Result<()> {
        self.apply(AuditSettings::from_config(config)?);
        Ok(())
    }

    /// Swap in settings compiled with [`AuditSettings::from_config`]
    pub fn apply(&self, settings: AuditSettings) {
        *self.settings.write() = settings.writer;
        *self.deliver_topic.write() = settings.deliver_topic;
        *self.startup_timeout.write() = settings.startup_timeout;
        self.recording.store(settings.recording, Ordering::Release);
    }

    /// Run one flush pass on the calling thread with a fresh connection
    ///
    /// Returns the number of deltas written.
    pub fn flush_once(&self) -> Result<u64> {
        let mut conn = self.store.connect()?;
        let settings = self.settings.read().clone();
        let summary = flush_pass(&self.counters, conn.as_mut(), &settings, None)?;
        Ok(summary.written)
    }

    /// Current counter value for a key
    pub fn count(&self, key: &AuditKey) -> Option<u64> {
        self.counters.get(key)
    }

    /// Number of keys held in memory
    pub fn pending_keys(&self) -> usize {
        self.counters.len()
    }
}

impl Drop for AuditAggregator {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().as_ref() {
            handle.signal.stop();
        }
    }
}
