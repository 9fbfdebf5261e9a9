//! Flow-wait timer.
//!
//! Armed on the receiver while granted bytes are outstanding. Firing never
//! touches connection state: it sets the deferred flags and posts an event to
//! the stack's driver task, which does the work under the connection lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::connection::{TOKEN_DEFERRED, WAIT_DEFERRED};
use super::stack::EngineEvent;
use crate::core::{FlowId, lock};

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

/// One restartable timer per connection.
#[derive(Debug, Default)]
pub(crate) struct FlowWaitTimer {
    state: Arc<Mutex<TimerState>>,
}

impl FlowWaitTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Push the deadline to `now + timeout`, spawning the sleeper if needed.
    pub(crate) fn arm(
        &self,
        runtime: &Handle,
        timeout: Duration,
        flow: FlowId,
        flags: &Arc<AtomicU8>,
        events: &UnboundedSender<EngineEvent>,
    ) {
        let mut state = lock(&self.state);
        state.deadline = Some(Instant::now() + timeout);
        if state.task.is_some() {
            return;
        }

        let shared = Arc::clone(&self.state);
        let flags = Arc::clone(flags);
        let events = events.clone();
        state.task = Some(runtime.spawn(async move {
            loop {
                let at = {
                    let mut state = lock(&shared);
                    match state.deadline {
                        Some(at) if Instant::now() >= at => {
                            state.deadline = None;
                            state.task = None;
                            break;
                        }
                        Some(at) => at,
                        None => {
                            state.task = None;
                            return;
                        }
                    }
                };
                sleep_until(at).await;
            }
            flags.fetch_or(TOKEN_DEFERRED | WAIT_DEFERRED, Ordering::AcqRel);
            let _ = events.send(EngineEvent::FlowWait(flow));
        }));
    }

    /// Stop the timer; a pending expiry is dropped.
    pub(crate) fn cancel(&self) {
        let mut state = lock(&self.state);
        state.deadline = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        lock(&self.state).deadline.is_some()
    }
}

impl Drop for FlowWaitTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
