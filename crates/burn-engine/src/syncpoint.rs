use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Signaled,
    Failed(String),
}

/// Events the cache thread signals as each package becomes available to the
/// execute thread.
#[derive(Debug, Default)]
pub struct Syncpoints {
    states: Mutex<HashMap<u32, State>>,
    changed: Condvar,
}

impl Syncpoints {
    pub fn new(count: u32) -> Self {
        let states = (0..count).map(|id| (id, State::Pending)).collect();
        Self {
            states: Mutex::new(states),
            changed: Condvar::new(),
        }
    }

    pub fn signal(&self, id: u32) {
        self.set(id, State::Signaled);
    }

    pub fn fail(&self, id: u32, reason: &str) {
        self.set(id, State::Failed(reason.to_string()));
    }

    /// Fails every syncpoint still pending, so no waiter blocks forever.
    pub fn fail_pending(&self, reason: &str) {
        let mut states = self.lock();
        for state in states.values_mut() {
            if *state == State::Pending {
                *state = State::Failed(reason.to_string());
            }
        }
        drop(states);
        self.changed.notify_all();
    }

    /// Blocks until the syncpoint is signaled or failed.
    pub fn wait(&self, id: u32) -> Result<()> {
        let mut states = self.lock();
        loop {
            match states.get(&id) {
                None => return Err(anyhow!("unknown syncpoint {id}")),
                Some(State::Signaled) => return Ok(()),
                Some(State::Failed(reason)) => {
                    return Err(anyhow!("caching for syncpoint {id} failed: {reason}"))
                }
                Some(State::Pending) => {
                    states = self
                        .changed
                        .wait(states)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    fn set(&self, id: u32, state: State) {
        self.lock().insert(id, state);
        self.changed.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, State>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn waiter_wakes_on_signal_from_another_thread() {
        let syncpoints = Arc::new(Syncpoints::new(2));
        let signaler = Arc::clone(&syncpoints);
        let handle = thread::spawn(move || {
            signaler.signal(1);
            signaler.signal(0);
        });
        syncpoints.wait(0).expect("syncpoint 0 signaled");
        syncpoints.wait(1).expect("syncpoint 1 signaled");
        handle.join().expect("signaler joins");
    }

    #[test]
    fn failed_and_unknown_syncpoints_are_errors() {
        let syncpoints = Syncpoints::new(2);
        syncpoints.signal(0);
        syncpoints.fail_pending("download failed");
        syncpoints.wait(0).expect("signaled stays signaled");
        let err = syncpoints.wait(1).expect_err("pending became failed");
        assert!(err.to_string().contains("download failed"));
        assert!(syncpoints.wait(7).is_err());
    }
}
