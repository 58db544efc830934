//! Watchdog patrol.
//!
//! Background threads that re-run the identity check and an entropy self-test
//! at randomized intervals for the life of the process. A failed check is
//! never swallowed: the process exits, or the failure is handed to a
//! supervisor that is expected to end it. There is no cancellation API.

use crate::errors::{GuardError, GuardResult};
use crate::incident::IncidentKind;
use crate::namespace::{Guarded, ENTROPY_CHECK, INTEGRITY_PATROL};
use crate::runtime_identity::RuntimeIdentity;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

const SOURCE: &str = include_str!("patrol.rs");

/// Exit status used when the patrol ends the process.
pub const FATAL_EXIT_CODE: i32 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatrolPhase {
    Idle,
    Sleeping,
    Checking,
    Fatal,
}

impl PatrolPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PatrolPhase::Sleeping,
            2 => PatrolPhase::Checking,
            3 => PatrolPhase::Fatal,
            _ => PatrolPhase::Idle,
        }
    }
}

/// Check run by one patrol thread on every tick.
pub trait PatrolRoutine: Guarded {
    fn run(&self, identity: &RuntimeIdentity) -> GuardResult<()>;
}

/// Re-validates the sealed identities.
#[derive(Debug, Default)]
pub struct IntegrityPatrol;

impl Guarded for IntegrityPatrol {
    fn source(&self) -> &'static str {
        SOURCE
    }
}

impl PatrolRoutine for IntegrityPatrol {
    fn run(&self, identity: &RuntimeIdentity) -> GuardResult<()> {
        identity.check_integrity().map(|_| ())
    }
}

/// Draws fresh random values and requires them pairwise distinct.
#[derive(Debug, Default)]
pub struct EntropyCheck;

impl Guarded for EntropyCheck {
    fn source(&self) -> &'static str {
        SOURCE
    }
}

impl PatrolRoutine for EntropyCheck {
    fn run(&self, identity: &RuntimeIdentity) -> GuardResult<()> {
        let samples = identity.guard_config().entropy_samples;
        entropy_self_test(identity.entropy(), samples).inspect_err(|e| {
            identity.record_incident(IncidentKind::EntropyFailure, "distinct", "collision", vec![e.to_string()]);
        })
    }
}

pub trait EntropySource: Send + Sync {
    fn next_u128(&self) -> u128;
}

/// Thread-local OS-seeded generator.
#[derive(Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn next_u128(&self) -> u128 {
        rand::random::<u128>()
    }
}

/// Draw `samples` values; any repeat fails, independent of hardened mode.
pub fn entropy_self_test(source: &dyn EntropySource, samples: usize) -> GuardResult<()> {
    let mut seen = HashSet::with_capacity(samples);
    for drawn in 0..samples {
        let value = source.next_u128();
        if !seen.insert(value) {
            return Err(GuardError::entropy(format!(
                "random source repeated a value after {} draws",
                drawn + 1
            )));
        }
    }
    Ok(())
}

/// Uniform in `[min_secs, max_secs]`.
pub fn random_interval(min_secs: f64, max_secs: f64) -> Duration {
    let secs = if max_secs > min_secs {
        rand::rng().random_range(min_secs..=max_secs)
    } else {
        min_secs
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// Where a fatal patrol failure goes.
#[derive(Debug, Clone)]
pub enum Escalation {
    /// Print the short message and exit with [`FATAL_EXIT_CODE`].
    ExitProcess,
    /// Hand the failure to a supervisor. If the supervisor is gone, exit.
    Supervisor(Sender<PatrolFailure>),
}

#[derive(Debug)]
pub struct PatrolFailure {
    pub thread: String,
    pub label: &'static str,
    pub error: GuardError,
}

/// Per-thread liveness and phase.
#[derive(Debug)]
pub struct PatrolThread {
    pub name: String,
    pub label: &'static str,
    ticks: AtomicU64,
    phase: AtomicU8,
}

impl PatrolThread {
    fn new(name: String, label: &'static str) -> Self {
        Self {
            name,
            label,
            ticks: AtomicU64::new(0),
            phase: AtomicU8::new(PatrolPhase::Idle as u8),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> PatrolPhase {
        PatrolPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: PatrolPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Created once when the patrol starts.
#[derive(Debug)]
pub struct WatchdogState {
    pub started: bool,
    pub started_at: DateTime<Utc>,
    pub threads: Vec<Arc<PatrolThread>>,
}

impl WatchdogState {
    pub fn routines(&self) -> Vec<&'static str> {
        let mut labels: Vec<&'static str> = self.threads.iter().map(|t| t.label).collect();
        labels.dedup();
        labels
    }

    pub fn total_ticks(&self) -> u64 {
        self.threads.iter().map(|t| t.ticks()).sum()
    }
}

pub struct Watchdog;

impl Watchdog {
    /// Spawn the configured number of integrity patrols plus one entropy
    /// patrol. The routines are taken from the namespace once, here.
    pub fn start(identity: Arc<RuntimeIdentity>, escalation: Escalation) -> GuardResult<Arc<WatchdogState>> {
        let runtime = identity.runtime();
        if !runtime.patrol_enabled() {
            info!(message = "integrity patrol disabled by configuration");
            return Ok(Arc::new(WatchdogState {
                started: false,
                started_at: Utc::now(),
                threads: Vec::new(),
            }));
        }

        let config = identity.guard_config();
        let window = (config.patrol_min_secs, config.patrol_max_secs);
        let mut plan: Vec<&'static str> = vec![INTEGRITY_PATROL; config.patrol_threads];
        plan.push(ENTROPY_CHECK);

        let mut threads = Vec::with_capacity(plan.len());
        let mut rng = rand::rng();
        for label in plan {
            let routine = identity
                .namespace()
                .routine(label)?
                .ok_or_else(|| GuardError::UnresolvedTarget {
                    label: label.to_string(),
                })?;
            let name = format!("depgate-patrol-{:08x}", rng.random::<u32>());
            let marker = Arc::new(PatrolThread::new(name.clone(), label));

            let worker_identity = Arc::clone(&identity);
            let worker_marker = Arc::clone(&marker);
            let worker_escalation = escalation.clone();
            thread::Builder::new()
                .name(name)
                .spawn(move || {
                    patrol_loop(&worker_identity, routine.as_ref(), &worker_marker, window, worker_escalation)
                })
                .map_err(|e| GuardError::io("spawning patrol thread", e))?;
            threads.push(marker);
        }

        let state = WatchdogState {
            started: true,
            started_at: Utc::now(),
            threads,
        };
        info!(
            message = "watchdog patrol started",
            threads = state.threads.len(),
            correlation_id = %identity.correlation_id()
        );
        Ok(Arc::new(state))
    }
}

/// One check: `checking`, then `idle` on success.
pub fn tick(identity: &RuntimeIdentity, routine: &dyn PatrolRoutine, marker: &PatrolThread) -> GuardResult<()> {
    marker.set_phase(PatrolPhase::Checking);
    routine.run(identity)?;
    marker.ticks.fetch_add(1, Ordering::AcqRel);
    marker.set_phase(PatrolPhase::Idle);
    Ok(())
}

fn patrol_loop(
    identity: &RuntimeIdentity,
    routine: &dyn PatrolRoutine,
    marker: &PatrolThread,
    (min_secs, max_secs): (f64, f64),
    escalation: Escalation,
) {
    loop {
        marker.set_phase(PatrolPhase::Sleeping);
        thread::sleep(random_interval(min_secs, max_secs));
        match tick(identity, routine, marker) {
            Ok(()) => debug!(message = "patrol tick clean", thread = %marker.name, label = marker.label),
            Err(e) => {
                marker.set_phase(PatrolPhase::Fatal);
                escalate(marker, e, escalation);
                return;
            }
        }
    }
}

fn escalate(marker: &PatrolThread, error: GuardError, escalation: Escalation) {
    error!(
        message = "patrol check failed",
        thread = %marker.name,
        label = marker.label,
        error = %error
    );
    let error = match escalation {
        Escalation::Supervisor(sender) => match sender.send(PatrolFailure {
            thread: marker.name.clone(),
            label: marker.label,
            error,
        }) {
            Ok(()) => return,
            Err(unsent) => unsent.0.error,
        },
        Escalation::ExitProcess => error,
    };
    eprintln!("depgate: {error}");
    std::process::exit(FATAL_EXIT_CODE);
}
