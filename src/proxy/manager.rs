//! Check orchestration
//!
//! A [`CheckManager`] owns one run at a time: a fixed pool of worker tasks
//! drains a pre-loaded job queue, each worker resolves the proxy kind, probes
//! the endpoint and folds the result into the shared records and statistics.
//! Operators steer the run with pause, resume and stop; workers react at job
//! boundaries only.
//!
//! Lock order is control, then records, then statistics. Callbacks are never
//! invoked while a lock is held.

use crate::error::StateError;
use crate::proxy::control::{ControlChannel, WorkerGate};
use crate::proxy::detect::Detector;
use crate::proxy::models::{ProxyKind, ProxyResult, ResultSetExt};
use crate::proxy::probe::{
    probe, ProbeTarget, TargetScheme, UpstreamProxy, DEFAULT_PROBE_TIMEOUT_SECS,
};
use crate::proxy::stats::{format_duration, RunStatistics, StatsTracker};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 10;

/// Default liveness target; it answers with the caller's IP as plain text
pub const DEFAULT_TARGET: &str = "https://api.ipify.org";

/// How long [`CheckManager::wait_until_paused`] waits by default
pub const DEFAULT_PAUSE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error text of results finalized by a forced stop
pub const FORCE_STOP_ERROR: &str = "check aborted by force stop";

/// Receives operator-facing progress lines
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked after every state change worth re-rendering
pub type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Parameters of one run
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    /// Endpoints in `host:port` form
    pub proxies: Vec<String>,
    /// Declared kind, `Auto` to detect per endpoint
    pub kind: ProxyKind,
    /// URL or `host:port` the probes talk to
    pub target: String,
    pub workers: usize,
    pub upstream: Option<UpstreamProxy>,
    /// Bound on each probe and each detection step
    pub timeout: Duration,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            kind: ProxyKind::Http,
            target: DEFAULT_TARGET.to_string(),
            workers: DEFAULT_WORKERS,
            upstream: None,
            timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

impl RunConfiguration {
    pub fn new(proxies: Vec<String>) -> Self {
        Self {
            proxies,
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: ProxyKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// At least one worker is always used
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_upstream(mut self, upstream: Option<UpstreamProxy>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a successful probe implies a TLS handshake through the proxy
    fn targets_tls(&self) -> bool {
        ProbeTarget::parse(&self.target)
            .map(|t| t.scheme == TargetScheme::Https)
            .unwrap_or(false)
    }
}

/// Lifecycle of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
}

impl RunState {
    fn is_active(&self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }
}

/// Status line shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Idle,
    Running,
    /// Pause requested, `paused` of `total` workers have reached a boundary
    Pausing { paused: usize, total: usize },
    Paused,
    /// Graceful stop requested, workers are finishing their current check
    Stopping,
    Stopped,
    Completed,
}

impl CheckStatus {
    /// Fraction of workers already paused, in `0.0..=1.0`
    pub fn pause_progress(&self) -> f64 {
        match self {
            CheckStatus::Pausing { paused, total } if *total > 0 => {
                (*paused as f64 / *total as f64).min(1.0)
            }
            CheckStatus::Pausing { .. } | CheckStatus::Paused => 1.0,
            _ => 0.0,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Idle => write!(f, "Idle"),
            CheckStatus::Running => write!(f, "Running"),
            CheckStatus::Pausing { paused, total } => {
                write!(f, "Pausing ({}/{} threads)", paused, total)
            }
            CheckStatus::Paused => write!(f, "Paused"),
            CheckStatus::Stopping => write!(f, "Stopping"),
            CheckStatus::Stopped => write!(f, "Stopped"),
            CheckStatus::Completed => write!(f, "Completed"),
        }
    }
}

#[derive(Clone)]
struct Callbacks {
    on_log: LogCallback,
    on_update: UpdateCallback,
}

impl Callbacks {
    fn log(&self, message: &str) {
        (self.on_log)(message);
    }

    fn update(&self) {
        (self.on_update)();
    }
}

struct Control {
    state: RunState,
    channel: ControlChannel,
    stop_requested: bool,
    /// Bumped on every start; late work from older runs is ignored
    generation: u64,
    worker_count: usize,
    run_id: Uuid,
    callbacks: Option<Callbacks>,
}

struct Records {
    results: Vec<ProxyResult>,
    /// Checks in progress, keyed by worker id
    in_flight: HashMap<usize, ProxyResult>,
    generation: u64,
    /// Set by a forced stop; nothing more is accepted for this generation
    sealed: bool,
}

impl Records {
    fn accepts(&self, generation: u64) -> bool {
        self.generation == generation && !self.sealed
    }
}

struct Shared {
    control: Mutex<Control>,
    records: Mutex<Records>,
    stats: StatsTracker,
    paused_workers: Arc<AtomicUsize>,
}

/// Concurrent proxy check orchestrator
///
/// Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct CheckManager {
    shared: Arc<Shared>,
}

impl Default for CheckManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: RunState::Idle,
                    channel: ControlChannel::new(),
                    stop_requested: false,
                    generation: 0,
                    worker_count: 0,
                    run_id: Uuid::nil(),
                    callbacks: None,
                }),
                records: Mutex::new(Records {
                    results: Vec::new(),
                    in_flight: HashMap::new(),
                    generation: 0,
                    sealed: false,
                }),
                stats: StatsTracker::new(),
                paused_workers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Start a run and return immediately.
    ///
    /// Must be called from within a tokio runtime. Previous results and
    /// statistics are discarded.
    pub fn start<L, U>(&self, config: RunConfiguration, on_log: L, on_update: U) -> Result<(), StateError>
    where
        L: Fn(&str) + Send + Sync + 'static,
        U: Fn() + Send + Sync + 'static,
    {
        let callbacks = Callbacks {
            on_log: Arc::new(on_log),
            on_update: Arc::new(on_update),
        };
        let worker_count = config.workers.max(1);

        let mut control = self.shared.control.lock();
        if control.state.is_active() {
            return Err(StateError::AlreadyRunning);
        }

        control.generation += 1;
        control.channel = ControlChannel::new();
        control.stop_requested = false;
        control.state = RunState::Running;
        control.worker_count = worker_count;
        control.run_id = Uuid::new_v4();
        control.callbacks = Some(callbacks.clone());
        let generation = control.generation;
        let run_id = control.run_id;
        self.shared.paused_workers.store(0, Ordering::SeqCst);

        {
            let mut records = self.shared.records.lock();
            records.results.clear();
            records.in_flight.clear();
            records.generation = generation;
            records.sealed = false;
            self.shared.stats.reset(config.proxies.len(), worker_count);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for endpoint in &config.proxies {
            let _ = sender.send(endpoint.clone());
        }
        drop(sender);
        let queue = Arc::new(tokio::sync::Mutex::new(receiver));

        info!(run = %run_id, proxies = config.proxies.len(), workers = worker_count, kind = %config.kind, "starting check");
        let config = Arc::new(config);
        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|id| {
                let worker = Worker {
                    id,
                    generation,
                    shared: self.shared.clone(),
                    config: config.clone(),
                    queue: queue.clone(),
                    gate: control.channel.gate(self.shared.paused_workers.clone()),
                    callbacks: callbacks.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tokio::spawn(watch_run(
            self.shared.clone(),
            handles,
            generation,
            callbacks.clone(),
        ));
        drop(control);

        callbacks.log(&format!("Total worker threads: {}", worker_count));
        callbacks.update();
        Ok(())
    }

    /// Ask workers to pause at their next job boundary
    pub fn pause(&self) -> Result<(), StateError> {
        let mut control = self.shared.control.lock();
        match control.state {
            RunState::Running => {}
            RunState::Paused => return Err(StateError::AlreadyPaused),
            _ => return Err(StateError::NotRunning),
        }
        if control.stop_requested {
            return Err(StateError::NotRunning);
        }

        self.shared.paused_workers.store(0, Ordering::SeqCst);
        let epoch = control.channel.pause();
        control.state = RunState::Paused;
        debug!(run = %control.run_id, epoch, "pause requested");
        let callbacks = control.callbacks.clone();
        drop(control);

        notify(callbacks, "Pausing check...");
        Ok(())
    }

    /// Pause and report every worker as paused right away
    pub fn force_pause(&self) -> Result<(), StateError> {
        let mut control = self.shared.control.lock();
        match control.state {
            RunState::Running => {}
            RunState::Paused => return Err(StateError::AlreadyPaused),
            _ => return Err(StateError::NotRunning),
        }
        if control.stop_requested {
            return Err(StateError::NotRunning);
        }

        control.channel.pause();
        control.state = RunState::Paused;
        self.shared
            .paused_workers
            .store(control.worker_count, Ordering::SeqCst);
        let callbacks = control.callbacks.clone();
        drop(control);

        notify(callbacks, "Check force paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), StateError> {
        let mut control = self.shared.control.lock();
        match control.state {
            RunState::Paused => {}
            RunState::Running => return Err(StateError::NotPaused),
            _ => return Err(StateError::NotRunning),
        }

        control.channel.resume();
        self.shared.paused_workers.store(0, Ordering::SeqCst);
        control.state = RunState::Running;
        let callbacks = control.callbacks.clone();
        drop(control);

        notify(callbacks, "Resuming check...");
        Ok(())
    }

    /// Stop the run.
    ///
    /// A graceful stop lets in-flight probes finish and keeps their results;
    /// the run becomes `Stopped` once every worker has exited. A non-graceful
    /// stop is [`CheckManager::force_stop`].
    pub fn stop(&self, graceful: bool) -> Result<(), StateError> {
        if !graceful {
            return self.force_stop();
        }

        let mut control = self.shared.control.lock();
        if !control.state.is_active() {
            return Err(StateError::NotRunning);
        }

        control.stop_requested = true;
        control.channel.stop();
        // paused workers are released by the stop signal
        control.state = RunState::Running;
        self.shared.paused_workers.store(0, Ordering::SeqCst);
        let callbacks = control.callbacks.clone();
        drop(control);

        notify(callbacks, "Stopping check...");
        Ok(())
    }

    /// Stop immediately.
    ///
    /// The run is `Stopped` on return. Checks still in flight are recorded
    /// as dead and whatever they produce later is discarded.
    pub fn force_stop(&self) -> Result<(), StateError> {
        let mut control = self.shared.control.lock();
        if !control.state.is_active() {
            return Err(StateError::NotRunning);
        }

        control.stop_requested = true;
        control.channel.stop();
        control.channel = ControlChannel::new();
        control.state = RunState::Stopped;
        self.shared.paused_workers.store(0, Ordering::SeqCst);

        let aborted = {
            let mut records = self.shared.records.lock();
            records.sealed = true;
            let mut aborted: Vec<ProxyResult> = records.in_flight.drain().map(|(_, r)| r).collect();
            for result in aborted.iter_mut() {
                if let Err(e) = result.set_dead(FORCE_STOP_ERROR) {
                    warn!(endpoint = %result.endpoint, "cannot finalize aborted check: {}", e);
                }
            }
            records.results.extend(aborted.iter().cloned());
            self.shared.stats.mark_in_flight_as_dead(&aborted);
            self.shared.stats.freeze();
            aborted.len()
        };
        info!(run = %control.run_id, aborted, "check force stopped");
        let callbacks = control.callbacks.clone();
        drop(control);

        notify(callbacks, "Check force stopped");
        Ok(())
    }

    /// Drop all results and reset the statistics.
    ///
    /// Rejected while the run is active and not paused.
    pub fn clear_results(&self) -> Result<(), StateError> {
        let control = self.shared.control.lock();
        if control.state == RunState::Running {
            return Err(StateError::ClearWhileRunning);
        }

        {
            let mut records = self.shared.records.lock();
            records.results.clear();
            self.shared.stats.clear();
        }
        let callbacks = control.callbacks.clone();
        drop(control);

        notify(callbacks, "Results cleared");
        Ok(())
    }

    /// Copy of the results in completion order
    pub fn results(&self) -> Vec<ProxyResult> {
        self.shared.records.lock().results.clone()
    }

    pub fn stats(&self) -> RunStatistics {
        self.shared.stats.snapshot()
    }

    pub fn live_endpoints(&self, with_kind: bool) -> Vec<String> {
        let records = self.shared.records.lock();
        if with_kind {
            records.results.live_endpoints_with_kind()
        } else {
            records.results.live_endpoints()
        }
    }

    pub fn state(&self) -> RunState {
        self.shared.control.lock().state
    }

    /// True from start until every worker has exited
    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RunState::Paused
    }

    pub fn worker_count(&self) -> usize {
        self.shared.control.lock().worker_count
    }

    pub fn paused_worker_count(&self) -> usize {
        let worker_count = self.worker_count();
        self.shared
            .paused_workers
            .load(Ordering::SeqCst)
            .min(worker_count)
    }

    pub fn status(&self) -> CheckStatus {
        let control = self.shared.control.lock();
        if control.stop_requested && control.state.is_active() {
            return CheckStatus::Stopping;
        }
        match control.state {
            RunState::Idle => CheckStatus::Idle,
            RunState::Running => CheckStatus::Running,
            RunState::Paused => {
                let total = control.worker_count;
                let paused = self.shared.paused_workers.load(Ordering::SeqCst).min(total);
                if paused >= total {
                    CheckStatus::Paused
                } else {
                    CheckStatus::Pausing { paused, total }
                }
            }
            RunState::Completed => CheckStatus::Completed,
            RunState::Stopped => CheckStatus::Stopped,
        }
    }

    /// Poll until every worker is paused.
    ///
    /// Returns `false` on timeout or when the run leaves the paused state.
    pub async fn wait_until_paused(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            match self.status() {
                CheckStatus::Paused => return true,
                CheckStatus::Pausing { .. } => {}
                _ => return false,
            }
            if started.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until the run is no longer active
    pub async fn wait_until_finished(&self) {
        while self.is_running() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn notify(callbacks: Option<Callbacks>, message: &str) {
    if let Some(callbacks) = callbacks {
        callbacks.log(message);
        callbacks.update();
    }
}

struct Worker {
    id: usize,
    generation: u64,
    shared: Arc<Shared>,
    config: Arc<RunConfiguration>,
    queue: Arc<tokio::sync::Mutex<UnboundedReceiver<String>>>,
    gate: WorkerGate,
    callbacks: Callbacks,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if !self.gate.checkpoint().await {
                break;
            }
            let next = self.queue.lock().await.recv().await;
            let Some(endpoint) = next else {
                break;
            };
            if !self.check(endpoint).await {
                break;
            }
        }
        debug!(worker = self.id, "worker exited");
    }

    /// Check one endpoint. Returns `false` when the run no longer accepts work.
    async fn check(&self, endpoint: String) -> bool {
        let mut result = ProxyResult::pending(endpoint.clone(), self.config.kind);
        if !self.begin(&mut result) {
            return false;
        }
        self.callbacks.log(&format!("Checking proxy: {}", endpoint));

        let kind = self.resolve_kind(&endpoint).await;
        if let Err(e) = result.set_kind(kind) {
            warn!(%endpoint, "cannot record detected kind: {}", e);
        }
        self.record_kind(kind);

        let started = Instant::now();
        let outcome = probe(
            kind,
            &endpoint,
            &self.config.target,
            self.config.timeout,
            self.config.upstream.as_ref(),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let transition = match outcome {
            Ok(egress_ip) => {
                result.set_supports_https(kind == ProxyKind::Https || self.config.targets_tls());
                result.set_live(latency_ms, egress_ip)
            }
            Err(e) => result.set_dead(e.to_string()),
        };
        if let Err(e) = transition {
            warn!(%endpoint, "cannot finalize check: {}", e);
            return self.abandon();
        }

        self.finish(result)
    }

    /// Drop the in-flight entry of a check that produced no result
    fn abandon(&self) -> bool {
        let mut records = self.shared.records.lock();
        if !records.accepts(self.generation) {
            return false;
        }
        if records.in_flight.remove(&self.id).is_some() {
            self.shared.stats.abandon_check();
        }
        true
    }

    fn begin(&self, result: &mut ProxyResult) -> bool {
        let mut records = self.shared.records.lock();
        if !records.accepts(self.generation) {
            return false;
        }
        if result.mark_checking().is_err() {
            return true;
        }
        records.in_flight.insert(self.id, result.clone());
        self.shared.stats.begin_check();
        true
    }

    fn record_kind(&self, kind: ProxyKind) {
        let mut records = self.shared.records.lock();
        if !records.accepts(self.generation) {
            return;
        }
        if let Some(in_flight) = records.in_flight.get_mut(&self.id) {
            in_flight.kind = kind;
        }
    }

    async fn resolve_kind(&self, endpoint: &str) -> ProxyKind {
        if self.config.kind != ProxyKind::Auto {
            return self.config.kind;
        }

        match Detector::new(self.config.timeout).detect(endpoint).await {
            Ok(kind) => {
                self.callbacks
                    .log(&format!("Detected {} proxy: {}", kind, endpoint));
                kind
            }
            Err(e) => {
                self.callbacks
                    .log(&format!("Auto-detection failed for {}: {}", endpoint, e));
                ProxyKind::Http
            }
        }
    }

    fn finish(&self, result: ProxyResult) -> bool {
        {
            let mut records = self.shared.records.lock();
            if !records.accepts(self.generation) {
                debug!(worker = self.id, endpoint = %result.endpoint, "discarding result from a stopped run");
                return false;
            }
            records.in_flight.remove(&self.id);
            records.results.push(result.clone());
            self.shared.stats.update(&result);
        }

        match &result.error {
            None => self.callbacks.log(&format!(
                "Live proxy: {} [{}] {}ms",
                result.endpoint, result.kind, result.latency_ms
            )),
            Some(error) => self
                .callbacks
                .log(&format!("Dead proxy: {} - {}", result.endpoint, error)),
        }
        self.callbacks.update();
        true
    }
}

/// Join the pool and settle the final state
async fn watch_run(shared: Arc<Shared>, handles: Vec<JoinHandle<()>>, generation: u64, callbacks: Callbacks) {
    for joined in join_all(handles).await {
        if let Err(e) = joined {
            warn!("worker task failed: {}", e);
        }
    }

    let mut control = shared.control.lock();
    if control.generation != generation || !control.state.is_active() {
        return;
    }
    let state = if control.stop_requested {
        RunState::Stopped
    } else {
        RunState::Completed
    };
    control.state = state;
    shared.stats.freeze();
    let run_id = control.run_id;
    drop(control);

    let stats = shared.stats.snapshot();
    info!(run = %run_id, ?state, live = stats.live, dead = stats.dead, "check finished");
    let verb = if state == RunState::Stopped { "stopped" } else { "completed" };
    callbacks.log(&format!(
        "Check {}: {} live, {} dead, {} errors in {}",
        verb,
        stats.live,
        stats.dead,
        stats.errors,
        format_duration(stats.elapsed)
    ));
    callbacks.update();
}
