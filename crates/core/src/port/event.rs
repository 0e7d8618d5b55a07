// State-change event hook
//
// Closing a job announces the outcome before it is applied. Listeners see a
// mutable event and may substitute a different final state; the substituted
// state is what the close actually applies.

use crate::domain::{Job, JobState};

/// Channel jobs' state changes are dispatched on.
pub const JOB_STATE_CHANGE: &str = "job_state_change";

#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub job: Job,
    pub new_state: JobState,
}

pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, channel: &str, event: &mut StateChangeEvent);
}

pub type StateChangeListener = Box<dyn Fn(&str, &mut StateChangeEvent) + Send + Sync>;

/// Dispatcher backed by an ordered listener list. Zero listeners is valid and
/// makes this a no-op sink.
#[derive(Default)]
pub struct ListenerDispatcher {
    listeners: Vec<StateChangeListener>,
}

impl ListenerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(
        mut self,
        listener: impl Fn(&str, &mut StateChangeEvent) + Send + Sync + 'static,
    ) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }
}

impl EventDispatcher for ListenerDispatcher {
    fn dispatch(&self, channel: &str, event: &mut StateChangeEvent) {
        for listener in &self.listeners {
            listener(channel, event);
        }
    }
}
