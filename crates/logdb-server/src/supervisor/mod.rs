//! Process supervisor
//!
//! Keeps exactly one process alive per registered worker class. Each class
//! has a monitor task that launches the process, waits for it to exit and
//! launches it again after a short cooldown, forever. A shared tick loop
//! inspects every class: it restarts monitors that are gone, turns pending
//! liveness signals into a fresh deadline, and kills processes that passed
//! their deadline or failed a health check. Killing is always forceful; the
//! monitor then relaunches.

pub mod health;
pub mod process;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;
use crate::liveness::LivenessReceiver;

pub use health::{HealthCheck, HealthVerdict, OpenConnectionLimit};
pub use process::{ProcessSpec, SpawnedProcess};

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub tick_period: Duration,
    pub max_frozen_time: Duration,
    pub restart_cooldown: Duration,
}

impl From<&SupervisorConfig> for Timing {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            tick_period: config.tick_period(),
            max_frozen_time: config.max_frozen_time(),
            restart_cooldown: config.restart_cooldown(),
        }
    }
}

/// A kind of worker the supervisor keeps running.
#[derive(Clone)]
pub struct WorkerClass {
    pub name: String,
    pub spec: ProcessSpec,
    pub health: Vec<Arc<dyn HealthCheck>>,
}

impl WorkerClass {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            health: Vec::new(),
        }
    }

    pub fn with_health(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health.push(check);
        self
    }
}

/// Bookkeeping for the current launch of one class. Replaced wholesale on
/// every launch; nothing carries over to the next process.
struct WorkerDescriptor {
    generation: u64,
    pid: u32,
    liveness: LivenessReceiver,
    deadline: Instant,
    kill: Arc<Notify>,
}

struct ClassState {
    class: WorkerClass,
    descriptor: Mutex<Option<WorkerDescriptor>>,
    launches: AtomicU64,
    restarts: AtomicU64,
}

impl ClassState {
    fn descriptor(&self) -> MutexGuard<'_, Option<WorkerDescriptor>> {
        self.descriptor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let descriptor = self.descriptor();
        WorkerSnapshot {
            class: self.class.name.clone(),
            pid: descriptor.as_ref().map(|d| d.pid),
            generation: descriptor.as_ref().map_or(0, |d| d.generation),
            launches: self.launches.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
            deadline: descriptor.as_ref().map(|d| d.deadline),
        }
    }
}

/// Point-in-time view of one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub class: String,
    /// `None` between an exit and the next launch
    pub pid: Option<u32>,
    pub generation: u64,
    pub launches: u64,
    pub restarts: u64,
    pub deadline: Option<Instant>,
}

struct ClassSlot {
    state: Arc<ClassState>,
    monitor: Option<JoinHandle<()>>,
}

pub struct Supervisor {
    slots: Vec<ClassSlot>,
    timing: Timing,
}

impl Supervisor {
    pub fn new(timing: Timing) -> Self {
        Self {
            slots: Vec::new(),
            timing,
        }
    }

    pub fn register(&mut self, class: WorkerClass) {
        info!(class = %class.name, "Registered worker class");
        self.slots.push(ClassSlot {
            state: Arc::new(ClassState {
                class,
                descriptor: Mutex::new(None),
                launches: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
            }),
            monitor: None,
        });
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.slots.iter().map(|slot| slot.state.snapshot()).collect()
    }

    /// One inspection round over every class.
    ///
    /// The deadline moves when signals are drained, not when they were
    /// written, so a worker that goes quiet is killed between
    /// `max_frozen_time` and `max_frozen_time + 2 * tick_period` after its
    /// last signal.
    pub fn inspect(&mut self) {
        let timing = self.timing;

        for slot in &mut self.slots {
            if slot.monitor.as_ref().map_or(true, JoinHandle::is_finished) {
                if slot.monitor.is_some() {
                    error!(class = %slot.state.class.name, "Monitor task ended, starting a new one");
                }
                slot.monitor = Some(tokio::spawn(monitor(Arc::clone(&slot.state), timing)));
            }

            let mut guard = slot.state.descriptor();
            let Some(descriptor) = guard.as_mut() else {
                continue;
            };

            let now = Instant::now();
            if descriptor.liveness.drain() {
                descriptor.deadline = now + timing.max_frozen_time;
            }

            if now > descriptor.deadline {
                warn!(
                    class = %slot.state.class.name,
                    pid = descriptor.pid,
                    "Process appears to be frozen, killing"
                );
                descriptor.kill.notify_one();
                continue;
            }

            for check in &slot.state.class.health {
                if let HealthVerdict::Kill(reason) = check.check(descriptor.pid) {
                    warn!(
                        class = %slot.state.class.name,
                        pid = descriptor.pid,
                        check = check.name(),
                        %reason,
                        "Health check failed, killing"
                    );
                    descriptor.kill.notify_one();
                    break;
                }
            }
        }
    }

    /// Inspect every `tick_period`, forever.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.timing.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            classes = self.slots.len(),
            tick_period_ms = self.timing.tick_period.as_millis() as u64,
            max_frozen_time_ms = self.timing.max_frozen_time.as_millis() as u64,
            "Supervisor started"
        );

        loop {
            ticker.tick().await;
            self.inspect();
        }
    }

    /// Run in the background. Dropping the handle stops supervision and
    /// kills every worker.
    pub fn start(self) -> SupervisorHandle {
        let states = self.slots.iter().map(|slot| Arc::clone(&slot.state)).collect();
        SupervisorHandle {
            states,
            task: tokio::spawn(self.run()),
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Some(monitor) = &slot.monitor {
                monitor.abort();
            }
        }
    }
}

/// Launch, wait, cool down, repeat. Never returns.
async fn monitor(state: Arc<ClassState>, timing: Timing) {
    let class = state.class.name.as_str();

    loop {
        let generation = state.launches.fetch_add(1, Ordering::SeqCst) + 1;

        match process::spawn(class, &state.class.spec).await {
            Ok(SpawnedProcess { mut child, pid, stdout }) => {
                let kill = Arc::new(Notify::new());
                *state.descriptor() = Some(WorkerDescriptor {
                    generation,
                    pid,
                    liveness: LivenessReceiver::attach(stdout),
                    deadline: Instant::now() + timing.max_frozen_time,
                    kill: Arc::clone(&kill),
                });
                info!(class, pid, generation, "Worker started");

                let status = tokio::select! {
                    status = child.wait() => status,
                    () = kill.notified() => {
                        if let Err(e) = child.start_kill() {
                            warn!(class, pid, error = %e, "Failed to kill worker");
                        }
                        child.wait().await
                    },
                };

                state.descriptor().take();
                match status {
                    Ok(status) => warn!(class, pid, %status, "Worker exited"),
                    Err(e) => error!(class, pid, error = %e, "Failed to wait for worker"),
                }
                state.restarts.fetch_add(1, Ordering::SeqCst);
            },
            Err(e) => error!(class, error = %e, "Failed to launch worker"),
        }

        tokio::time::sleep(timing.restart_cooldown).await;
    }
}

pub struct SupervisorHandle {
    states: Vec<Arc<ClassState>>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.states.iter().map(|state| state.snapshot()).collect()
    }

    pub fn class(&self, name: &str) -> Option<WorkerSnapshot> {
        self.states
            .iter()
            .find(|state| state.class.name == name)
            .map(|state| state.snapshot())
    }

    /// Wait for the tick loop, which only ends if it panics.
    pub async fn wait(mut self) -> Result<(), tokio::task::JoinError> {
        (&mut self.task).await
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
