use std::collections::HashMap;

use crate::runtime::Runtime;

/// Identifier of a pending completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u64);

type Action = Box<dyn FnOnce(&mut Runtime)>;

struct EventState {
    done: bool,
    actions: Vec<Action>,
}

/// Completion registry behind [`RequestHolder`]: every "send, then wait
/// via the scheduler" pattern in the runtime funnels through one of these
/// events.
pub struct PendingEvents {
    next: u64,
    states: HashMap<u64, EventState>,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self {
            next: 0,
            states: HashMap::new(),
        }
    }

    pub fn create(&mut self) -> EventId {
        let id = self.next;
        self.next += 1;
        self.states.insert(
            id,
            EventState {
                done: false,
                actions: Vec::new(),
            },
        );
        EventId(id)
    }

    pub fn is_done(&self, event: EventId) -> bool {
        self.states.get(&event.0).map_or(true, |state| state.done)
    }

    /// Marks the event complete and hands back its queued actions; the
    /// caller runs them (they need `&mut Runtime`).
    pub(crate) fn complete(&mut self, event: EventId) -> Vec<Action> {
        match self.states.get_mut(&event.0) {
            Some(state) => {
                state.done = true;
                std::mem::take(&mut state.actions)
            }
            None => Vec::new(),
        }
    }

    /// Queues an action; returns it back if the event already completed so
    /// the caller can run it immediately.
    pub(crate) fn add_action(&mut self, event: EventId, action: Action) -> Option<Action> {
        match self.states.get_mut(&event.0) {
            Some(state) if !state.done => {
                state.actions.push(action);
                None
            }
            _ => Some(action),
        }
    }
}

impl Default for PendingEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an asynchronous runtime operation. Obtain completion either
/// by blocking ([`Runtime::request_wait`]) or by registering a
/// continuation ([`Runtime::request_add_action`]).
#[derive(Debug, Clone, Copy)]
pub struct RequestHolder {
    pub(crate) event: EventId,
}

impl RequestHolder {
    pub(crate) fn new(event: EventId) -> Self {
        Self { event }
    }
}

impl Runtime {
    /// Spins the scheduler until the request completes.
    pub fn request_wait(&mut self, request: RequestHolder) {
        self.run_scheduler_while(|rt| !rt.events.is_done(request.event));
    }

    pub fn request_is_done(&self, request: RequestHolder) -> bool {
        self.events.is_done(request.event)
    }

    /// Fires `action` exactly once when the request completes (immediately
    /// if it already has).
    pub fn request_add_action(
        &mut self,
        request: RequestHolder,
        action: impl FnOnce(&mut Runtime) + 'static,
    ) {
        if let Some(action) = self.events.add_action(request.event, Box::new(action)) {
            action(self);
        }
    }

    /// Completes an event and runs its queued actions.
    pub(crate) fn complete_event(&mut self, event: EventId) {
        let actions = self.events.complete(event);
        for action in actions {
            action(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_counts_as_done() {
        let events = PendingEvents::new();
        assert!(events.is_done(EventId(99)));
    }

    #[test]
    fn actions_queue_until_completion() {
        let mut events = PendingEvents::new();
        let event = events.create();
        assert!(!events.is_done(event));
        assert!(events.add_action(event, Box::new(|_| {})).is_none());
        let actions = events.complete(event);
        assert_eq!(actions.len(), 1);
        assert!(events.is_done(event));
        // late action is returned for immediate execution
        assert!(events.add_action(event, Box::new(|_| {})).is_some());
    }
}
