//! Debounce and in-flight state machine for saves.
//!
//! ```text
//! Idle ──edit──▶ Waiting ──quiet period / flush──▶ Saving
//!                 ▲  │edit (timer restarts)          │edit (next generation)
//!                 │  ▼                               │
//!                 Waiting ◀──done, edits pending─────┤
//! Idle ◀──────────────────done, nothing pending──────┘
//! ```
//!
//! The scheduler owns the timer task but not the save itself; the engine
//! passes in the callback to run when the quiet period ends.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Where a domain's save cycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerPhase {
    /// Nothing pending.
    Idle,
    /// Edits pending, debounce timer running.
    Waiting,
    /// A save is in flight.
    Saving,
}

impl SchedulerPhase {
    /// Returns true while a save is in flight.
    pub fn is_saving(&self) -> bool {
        matches!(self, SchedulerPhase::Saving)
    }

    /// Returns true if `flush` would start a save.
    pub fn can_flush(&self) -> bool {
        matches!(self, SchedulerPhase::Waiting)
    }
}

/// A restartable one-shot timer backed by a Tokio task.
#[derive(Debug, Default)]
pub(crate) struct DebounceTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl DebounceTimer {
    /// Cancels any running countdown and starts a new one. Returns the
    /// generation `fire` will be called with.
    pub(crate) fn arm<F, Fut>(&mut self, runtime: &Handle, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        self.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fire(generation).await;
        }));
        generation
    }

    /// Aborts the countdown, if one is running.
    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Called from the timer task when it fires. Returns false if the timer
    /// was re-armed or cancelled after this countdown elapsed.
    ///
    /// The handle is released rather than aborted: the caller *is* that
    /// task and goes on to run the save.
    pub(crate) fn claim(&mut self, generation: u64) -> bool {
        if self.generation == generation && self.handle.is_some() {
            self.handle = None;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

/// The save state machine of one domain.
#[derive(Debug)]
pub(crate) struct SaveScheduler {
    phase: SchedulerPhase,
    timer: DebounceTimer,
    debounce: Duration,
}

impl SaveScheduler {
    pub(crate) fn new(debounce: Duration) -> Self {
        Self {
            phase: SchedulerPhase::Idle,
            timer: DebounceTimer::default(),
            debounce,
        }
    }

    pub(crate) fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    /// An edit was recorded. Restarts the countdown unless a save is in
    /// flight, in which case the edit waits for that save to finish.
    pub(crate) fn on_edit<F, Fut>(&mut self, runtime: &Handle, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.phase.is_saving() {
            return;
        }
        self.timer.arm(runtime, self.debounce, fire);
        self.phase = SchedulerPhase::Waiting;
    }

    /// The countdown with `generation` elapsed. Returns true if a save
    /// should start.
    pub(crate) fn on_timer(&mut self, generation: u64) -> bool {
        self.phase == SchedulerPhase::Waiting && self.timer.claim(generation)
    }

    /// `flush` was called. Returns true if a save should start.
    pub(crate) fn on_flush(&mut self) -> bool {
        if !self.phase.can_flush() {
            return false;
        }
        self.timer.cancel();
        true
    }

    /// A save was dispatched.
    pub(crate) fn begin_save(&mut self) {
        self.timer.cancel();
        self.phase = SchedulerPhase::Saving;
    }

    /// The in-flight save (and any reload) finished.
    pub(crate) fn finish_save<F, Fut>(&mut self, pending: bool, runtime: &Handle, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.phase = SchedulerPhase::Idle;
        if pending {
            self.on_edit(runtime, fire);
        }
    }

    /// Drops a waiting countdown. An in-flight save keeps its phase until
    /// it completes.
    pub(crate) fn reset(&mut self) {
        self.timer.cancel();
        if self.phase == SchedulerPhase::Waiting {
            self.phase = SchedulerPhase::Idle;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }
}
