//! Delivery worker
//!
//! A single thread drains the capture queue and hands each frame to the
//! registered sink in queue order. It is driven by typed commands on a
//! `crossbeam::channel`; requests that need a rendezvous (unregister,
//! suspend, shutdown) carry a reply sender and are waited on with a timeout.
//!
//! Every sink call happens under the delivery gate. Unregistering closes the
//! gate first, so it waits for at most the frame being delivered and no
//! call starts once it returns. Frames are also stamped with the sink
//! registration they were captured for; frames from an earlier registration
//! are dropped instead of reaching a newer sink.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::pool::PooledWrapper;
use crate::queue::CaptureQueue;
use crate::stats::CaptureStats;
use crate::vdev::{CapturedFrame, FrameSink};
use crate::{PktCaptureError, Result};

/// Lifecycle of the delivery worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Thread alive, no sink registered
    Idle,
    /// Sink registered, delivering
    Running,
    Suspending,
    /// Parked until resumed; posts are deferred
    Suspended,
    Resuming,
    ShuttingDown,
    Stopped,
}

/// Inputs to `WorkerState::transition`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Register,
    Unregister,
    Suspend,
    /// Drain finished and the suspend was acknowledged
    Parked,
    Resume,
    /// Deferred work drained after a resume
    Resumed { registered: bool },
    Shutdown,
    Exited,
}

impl WorkerState {
    /// Next state for `event`, `None` if the event is not valid here
    pub fn transition(self, event: WorkerEvent) -> Option<WorkerState> {
        use WorkerEvent as E;
        use WorkerState as S;

        match (self, event) {
            (S::Stopped, _) => None,
            (S::ShuttingDown, E::Exited) => Some(S::Stopped),
            (S::ShuttingDown, _) => None,
            (_, E::Shutdown) => Some(S::ShuttingDown),

            (S::Idle | S::Running, E::Register) => Some(S::Running),
            (S::Idle | S::Running, E::Unregister) => Some(S::Idle),
            (S::Idle | S::Running, E::Suspend) => Some(S::Suspending),
            (S::Suspending, E::Parked) => Some(S::Suspended),

            // Registration changes while parked take effect on resume
            (S::Suspended, E::Register | E::Unregister) => Some(S::Suspended),
            (S::Suspended, E::Resume) => Some(S::Resuming),
            (S::Resuming, E::Resumed { registered: true }) => Some(S::Running),
            (S::Resuming, E::Resumed { registered: false }) => Some(S::Idle),

            _ => None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, WorkerState::Suspending | WorkerState::Suspended)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::ShuttingDown | WorkerState::Stopped)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Suspending => "suspending",
            WorkerState::Suspended => "suspended",
            WorkerState::Resuming => "resuming",
            WorkerState::ShuttingDown => "shutting-down",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

enum Command {
    /// Queue has new wrappers; coalesced through `Shared::post_pending`
    Post,
    Register {
        sink: Arc<dyn FrameSink>,
        generation: u64,
    },
    Unregister(Sender<()>),
    Suspend(Sender<()>),
    Resume,
    Shutdown(Sender<()>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Post => "Post",
            Command::Register { .. } => "Register",
            Command::Unregister(_) => "Unregister",
            Command::Suspend(_) => "Suspend",
            Command::Resume => "Resume",
            Command::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Timeouts for the rendezvous requests
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimeouts {
    /// Suspend and unregister acknowledgements
    pub suspend: Duration,
    pub shutdown: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            suspend: Duration::from_millis(crate::DEFAULT_SUSPEND_TIMEOUT_MS),
            shutdown: Duration::from_millis(crate::DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

#[derive(Debug)]
struct Shared {
    post_pending: AtomicBool,
    state: Mutex<WorkerState>,
    /// Held across every sink call
    gate: Mutex<()>,
    /// Sink may be called; checked under `gate`
    attached: AtomicBool,
    /// Current sink registration
    generation: AtomicU64,
}

impl Shared {
    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the delivery thread
pub struct Worker {
    name: String,
    commands: Sender<Command>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    shutdown_requested: AtomicBool,
    timeouts: WorkerTimeouts,
}

impl Worker {
    /// Start the delivery thread for `queue`
    pub fn spawn(
        name: &str,
        queue: Arc<CaptureQueue>,
        stats: Arc<CaptureStats>,
        timeouts: WorkerTimeouts,
    ) -> Result<Self> {
        let (commands, receiver) = channel::unbounded();
        let shared = Arc::new(Shared {
            post_pending: AtomicBool::new(false),
            state: Mutex::new(WorkerState::Idle),
            gate: Mutex::new(()),
            attached: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        let mut worker_loop = WorkerLoop {
            name: name.to_string(),
            commands: receiver,
            queue,
            stats,
            shared: Arc::clone(&shared),
            sink: None,
            generation: 0,
            draining: VecDeque::new(),
        };
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop.run())?;

        log::info!("capture worker '{}' started", name);

        Ok(Self {
            name: name.to_string(),
            commands,
            shared,
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
            shutdown_requested: AtomicBool::new(false),
            timeouts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Registration that newly captured frames belong to
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Signal that the queue has work; never blocks
    pub fn post(&self) {
        if !self.shared.post_pending.swap(true, Ordering::AcqRel) && self.commands.send(Command::Post).is_err() {
            self.shared.post_pending.store(false, Ordering::Release);
        }
    }

    /// Attach `sink`; returns the registration frames must be stamped with
    pub fn register(&self, sink: Arc<dyn FrameSink>) -> Result<u64> {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.send(Command::Register { sink, generation })?;
        self.shared.attached.store(true, Ordering::SeqCst);
        self.post();
        Ok(generation)
    }

    /// Detach the sink; no delivery starts once this returns `Ok`
    ///
    /// Waits for the frame currently inside the sink, if any. On `Timeout`
    /// the sink is still attached. Must not be called from the sink.
    pub fn unregister(&self) -> Result<()> {
        if thread::current().id() == self.thread_id {
            return Err(PktCaptureError::InvalidParameter(
                "sink cannot be detached from its own delivery".to_string(),
            ));
        }
        self.close_gate()?;

        let (ack, done) = channel::bounded(1);
        self.send(Command::Unregister(ack))?;
        match done.recv_timeout(self.timeouts.suspend) {
            Ok(()) => Ok(()),
            // The gate is closed; the worker drops whatever it still holds
            Err(RecvTimeoutError::Timeout) => {
                log::debug!("capture worker '{}': unregister acknowledged late", self.name);
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => Err(PktCaptureError::WorkerStopped),
        }
    }

    /// Stop new sink calls and wait out the one in progress
    fn close_gate(&self) -> Result<()> {
        self.shared.attached.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + self.timeouts.suspend;
        loop {
            match self.shared.gate.try_lock() {
                Ok(_) | Err(TryLockError::Poisoned(_)) => return Ok(()),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    self.shared.attached.store(true, Ordering::SeqCst);
                    return Err(PktCaptureError::Timeout(format!(
                        "worker '{}': sink still busy after {:?}",
                        self.name, self.timeouts.suspend
                    )));
                }
                Err(TryLockError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Park the worker once its current drain completes
    pub fn suspend(&self) -> Result<()> {
        let (ack, done) = channel::bounded(1);
        self.send(Command::Suspend(ack))?;
        match done.recv_timeout(self.timeouts.suspend) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                // Withdraw the request: the worker will not park on a dropped
                // reply, and a late park is undone by the queued resume.
                drop(done);
                let _ = self.commands.send(Command::Resume);
                Err(PktCaptureError::Timeout(format!(
                    "worker '{}' did not acknowledge suspend within {:?}",
                    self.name, self.timeouts.suspend
                )))
            }
            // The worker drops the reply sender to refuse the request
            Err(RecvTimeoutError::Disconnected) if self.state().is_terminal() => {
                Err(PktCaptureError::WorkerStopped)
            }
            Err(RecvTimeoutError::Disconnected) => Err(PktCaptureError::SuspendRejected(
                "worker is already suspended".to_string(),
            )),
        }
    }

    pub fn resume(&self) -> Result<()> {
        match self.state() {
            WorkerState::Suspended => self.send(Command::Resume),
            state if state.is_terminal() => Err(PktCaptureError::WorkerStopped),
            state => Err(PktCaptureError::SuspendRejected(format!(
                "resume while {}",
                state
            ))),
        }
    }

    /// Stop and join the thread; repeated calls are no-ops
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (ack, done) = channel::bounded(1);
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            match done.recv_timeout(self.timeouts.shutdown) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    // Leave the thread detached rather than block on it
                    log::warn!("capture worker '{}' did not stop in time", self.name);
                    return Err(PktCaptureError::Timeout(format!(
                        "worker '{}' shutdown",
                        self.name
                    )));
                }
            }
        }

        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("capture worker '{}' panicked", self.name);
            }
        }
        log::info!("capture worker '{}' stopped", self.name);
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.shutdown_requested.load(Ordering::Acquire) {
            return Err(PktCaptureError::WorkerStopped);
        }
        self.commands
            .send(command)
            .map_err(|_| PktCaptureError::WorkerStopped)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("capture worker '{}': {}", self.name, e);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

enum Flow {
    Continue,
    Exit,
}

/// State owned by the delivery thread
struct WorkerLoop {
    name: String,
    commands: Receiver<Command>,
    queue: Arc<CaptureQueue>,
    stats: Arc<CaptureStats>,
    shared: Arc<Shared>,
    sink: Option<Arc<dyn FrameSink>>,
    /// Registration of `sink`
    generation: u64,
    /// Reused between drains
    draining: VecDeque<PooledWrapper>,
}

impl WorkerLoop {
    fn run(&mut self) {
        while let Ok(command) = self.commands.recv() {
            if let Flow::Exit = self.handle(command) {
                break;
            }
        }
        self.advance(WorkerEvent::Exited);
        log::debug!("capture worker '{}' exiting", self.name);
    }

    fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Post => {
                self.shared.post_pending.store(false, Ordering::Release);
                self.drain();
            }
            Command::Register { sink, generation } => self.attach(sink, generation),
            Command::Unregister(ack) => self.detach(ack),
            Command::Suspend(ack) => return self.park(ack),
            Command::Resume => {
                log::debug!("capture worker '{}': resume while not suspended", self.name);
            }
            Command::Shutdown(ack) => {
                self.shut_down(ack);
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    /// Acknowledge a suspend and block until resumed or shut down
    fn park(&mut self, ack: Sender<()>) -> Flow {
        self.advance(WorkerEvent::Suspend);
        // The drain in progress when the request arrived has completed
        self.advance(WorkerEvent::Parked);
        if ack.send(()).is_err() {
            log::warn!("capture worker '{}': suspend withdrawn, not parking", self.name);
            self.advance(WorkerEvent::Resume);
            self.advance(WorkerEvent::Resumed {
                registered: self.sink.is_some(),
            });
            return Flow::Continue;
        }
        log::debug!("capture worker '{}' suspended", self.name);

        loop {
            let command = match self.commands.recv() {
                Ok(command) => command,
                Err(_) => return Flow::Exit,
            };
            match command {
                Command::Resume => break,
                // Left pending so producers stop posting; handled on resume
                Command::Post => {}
                Command::Register { sink, generation } => self.attach(sink, generation),
                Command::Unregister(ack) => self.detach(ack),
                Command::Suspend(rejected) => {
                    log::warn!("capture worker '{}': suspend while suspended", self.name);
                    drop(rejected);
                }
                Command::Shutdown(ack) => {
                    self.shut_down(ack);
                    return Flow::Exit;
                }
            }
        }

        self.advance(WorkerEvent::Resume);
        self.shared.post_pending.store(false, Ordering::Release);
        self.drain();
        self.advance(WorkerEvent::Resumed {
            registered: self.sink.is_some(),
        });
        log::debug!("capture worker '{}' resumed", self.name);
        Flow::Continue
    }

    fn attach(&mut self, sink: Arc<dyn FrameSink>, generation: u64) {
        self.sink = Some(sink);
        self.generation = generation;
        self.advance(WorkerEvent::Register);
    }

    fn detach(&mut self, ack: Sender<()>) {
        self.sink = None;
        self.advance(WorkerEvent::Unregister);
        let _ = ack.send(());
    }

    fn shut_down(&mut self, ack: Sender<()>) {
        self.advance(WorkerEvent::Shutdown);
        self.sink = None;
        let _ = ack.send(());
    }

    /// Deliver everything queued so far, in order
    fn drain(&mut self) {
        self.queue.drain_into(&mut self.draining);

        while let Some(wrapper) = self.draining.pop_front() {
            let gate = self.shared.gate();
            let open = self.shared.attached.load(Ordering::SeqCst);
            match &self.sink {
                Some(sink) if open && wrapper.generation == self.generation => {
                    let frame = CapturedFrame::from_wrapper(&wrapper);
                    match sink.deliver(&frame) {
                        Ok(()) => self.stats.record_delivered(),
                        Err(e) => {
                            log::debug!("capture worker '{}': delivery failed: {}", self.name, e);
                            self.stats.record_delivery_failed();
                        }
                    }
                }
                _ => self.stats.record_dropped_unregistered(),
            }
            drop(gate);
            // wrapper returns to the pool here
        }
    }

    fn advance(&self, event: WorkerEvent) {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.transition(event) {
            Some(next) => *state = next,
            None => log::warn!(
                "capture worker '{}': ignoring {:?} while {}",
                self.name,
                event,
                *state
            ),
        }
    }
}
