use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::dispatch::foreground::ForegroundHandle;
use crate::error::SerialError;
use crate::event::{SerialEvent, SerialListener};

/// Callback run when a fatal event is buffered because no consumer is attached.
pub(crate) type FatalHook = Arc<dyn Fn() + Send + Sync>;

/// Routes connection events to a consumer that may come and go.
///
/// While a consumer is attached, events are handed to the foreground loop in arrival
/// order. While none is attached they are buffered, and `attach` replays them before
/// anything newer.
pub(crate) struct EventDispatcher {
    foreground: ForegroundHandle,
    on_fatal_buffered: FatalHook,
    state: Mutex<DispatchState>,
}

#[derive(Default)]
struct DispatchState {
    consumer: Option<Arc<dyn SerialListener>>,
    /// Events posted to the foreground loop and not yet delivered.
    in_flight: VecDeque<SerialEvent>,
    /// Posted events that found no consumer when their task ran.
    immediate: VecDeque<SerialEvent>,
    /// Events that arrived while no consumer was attached.
    deferred: VecDeque<SerialEvent>,
}

impl EventDispatcher {
    pub(crate) fn new(foreground: ForegroundHandle, on_fatal_buffered: FatalHook) -> Self {
        Self {
            foreground,
            on_fatal_buffered,
            state: Mutex::new(DispatchState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Accepts one event from any thread.
    pub(crate) fn dispatch(self: &Arc<Self>, event: SerialEvent) {
        let mut state = self.lock();
        if state.consumer.is_some() {
            trace!(kind = event.kind(), "posting event to foreground");
            state.in_flight.push_back(event);
            drop(state);
            let dispatcher = Arc::clone(self);
            if !self.foreground.post(Box::new(move || dispatcher.deliver_next())) {
                debug!("foreground loop closed, event kept for replay");
            }
            return;
        }
        let fatal = event.is_fatal();
        trace!(kind = event.kind(), "buffering event without consumer");
        state.deferred.push_back(event);
        drop(state);
        if fatal {
            (self.on_fatal_buffered)();
        }
    }

    /// Foreground task: delivers the oldest in-flight event.
    fn deliver_next(&self) {
        let mut state = self.lock();
        let Some(event) = state.in_flight.pop_front() else {
            return;
        };
        if let Some(consumer) = state.consumer.clone() {
            drop(state);
            consumer.on_event(event);
            return;
        }
        let fatal = event.is_fatal();
        trace!(kind = event.kind(), "consumer detached before delivery");
        state.immediate.push_back(event);
        drop(state);
        if fatal {
            (self.on_fatal_buffered)();
        }
    }

    /// Installs a consumer and replays buffered events to it, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SerialError::NotOnForeground`] when called off the foreground thread.
    pub(crate) fn attach(&self, consumer: Arc<dyn SerialListener>) -> Result<(), SerialError> {
        if !self.foreground.is_current() {
            return Err(SerialError::NotOnForeground);
        }
        let replay: Vec<SerialEvent> = {
            let mut state = self.lock();
            state.consumer = Some(Arc::clone(&consumer));
            let DispatchState {
                in_flight,
                immediate,
                deferred,
                ..
            } = &mut *state;
            immediate
                .drain(..)
                .chain(in_flight.drain(..))
                .chain(deferred.drain(..))
                .collect()
        };
        debug!(replayed = replay.len(), "consumer attached");
        for event in replay {
            consumer.on_event(event);
        }
        Ok(())
    }

    /// Removes the consumer. Later events are buffered.
    pub(crate) fn detach(&self) {
        self.lock().consumer = None;
        debug!("consumer detached");
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.lock().consumer.is_some()
    }

    /// Number of events waiting for a consumer.
    pub(crate) fn buffered_len(&self) -> usize {
        let state = self.lock();
        state.immediate.len() + state.in_flight.len() + state.deferred.len()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("attached", &self.is_attached())
            .field("buffered", &self.buffered_len())
            .finish_non_exhaustive()
    }
}
