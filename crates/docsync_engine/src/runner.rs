//! The background sync loop.
//!
//! One dedicated thread per synchronizer runs a pass every `sync_interval`,
//! or sooner when woken. The thread only holds a weak reference to the
//! synchronizer and exits once the synchronizer is gone or the loop is
//! stopped.

use crate::adapters::NetworkStateListener;
use crate::synchronizer::Inner;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct LoopState {
    running: bool,
    wake: bool,
    generation: u64,
}

/// Run flag and wake-up signal shared with the loop thread.
#[derive(Debug, Default)]
pub(crate) struct LoopSignal {
    state: Mutex<LoopState>,
    condvar: Condvar,
}

impl LoopSignal {
    /// Returns true while the loop of `generation` should keep going.
    pub(crate) fn is_running(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.running && state.generation == generation
    }

    /// Requests a pass as soon as possible.
    pub(crate) fn wake(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.wake = true;
            self.condvar.notify_all();
        }
    }

    /// Blocks until woken, stopped or `interval` elapsed.
    ///
    /// Returns false when the loop of `generation` must exit.
    fn wait(&self, generation: u64, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if state.running && state.generation == generation && !state.wake {
            self.condvar.wait_for(&mut state, interval);
        }
        state.wake = false;
        state.running && state.generation == generation
    }
}

struct LoopThread {
    handle: JoinHandle<()>,
    id: ThreadId,
}

/// Owner of the loop thread.
#[derive(Default)]
pub(crate) struct SyncLoop {
    signal: Arc<LoopSignal>,
    thread: Mutex<Option<LoopThread>>,
}

impl SyncLoop {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn signal(&self) -> &Arc<LoopSignal> {
        &self.signal
    }

    pub(crate) fn is_running(&self) -> bool {
        self.signal.state.lock().running
    }

    /// Starts the loop thread. Returns false if it was already running.
    pub(crate) fn start(&self, inner: Weak<Inner>, name: String, interval: Duration) -> bool {
        let mut thread_slot = self.thread.lock();
        let generation = {
            let mut state = self.signal.state.lock();
            if state.running {
                return false;
            }
            state.running = true;
            state.wake = false;
            state.generation += 1;
            state.generation
        };

        let signal = Arc::clone(&self.signal);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(signal, generation, inner, interval));

        match spawned {
            Ok(handle) => {
                let id = handle.thread().id();
                *thread_slot = Some(LoopThread { handle, id });
                info!(
                    thread = %name,
                    interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                    "sync loop started"
                );
                true
            }
            Err(e) => {
                self.signal.state.lock().running = false;
                error!(thread = %name, error = %e, "failed to spawn sync loop thread");
                false
            }
        }
    }

    /// Stops the loop and waits for the thread unless called from it.
    ///
    /// A pass in flight finishes its current document before the thread exits.
    pub(crate) fn stop(&self) -> bool {
        {
            let mut state = self.signal.state.lock();
            if !state.running {
                return false;
            }
            state.running = false;
            state.wake = false;
            self.signal.condvar.notify_all();
        }

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.id == thread::current().id() {
                debug!("sync loop stopped from its own thread");
            } else if thread.handle.join().is_err() {
                error!("sync loop thread panicked");
            }
        }
        info!("sync loop stopped");
        true
    }
}

fn run(signal: Arc<LoopSignal>, generation: u64, inner: Weak<Inner>, interval: Duration) {
    while signal.wait(generation, interval) {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!(generation, "sync loop woke");
        inner.run_loop_pass(&|| signal.is_running(generation));
    }
    debug!(generation, "sync loop exited");
}

/// Wakes the loop when connectivity returns.
pub(crate) struct LoopWaker {
    signal: Weak<LoopSignal>,
}

impl LoopWaker {
    pub(crate) fn new(signal: &Arc<LoopSignal>) -> Self {
        Self {
            signal: Arc::downgrade(signal),
        }
    }
}

impl NetworkStateListener for LoopWaker {
    fn on_network_state_changed(&self, connected: bool) {
        if !connected {
            return;
        }
        if let Some(signal) = self.signal.upgrade() {
            debug!("network reconnected, waking sync loop");
            signal.wake();
        }
    }
}
