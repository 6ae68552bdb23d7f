//! Restartable single-shot timer.
//!
//! `start` arms the timer, replacing any pending one; `stop` disarms it. When
//! the delay elapses the callback runs exactly once and the timer is idle
//! again. Dropping the timer disarms it.

use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Armed,
}

#[derive(Debug, Default)]
pub struct IdleTimer {
    pending: Option<JoinHandle<()>>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer. Must be called from within a tokio runtime.
    ///
    /// The callback runs on a runtime task; a panic inside it is not caught
    /// here.
    pub fn start<F>(&mut self, duration: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            callback();
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    pub fn state(&self) -> TimerState {
        match &self.pending {
            Some(handle) if !handle.is_finished() => TimerState::Armed,
            _ => TimerState::Idle,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state() == TimerState::Armed
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
