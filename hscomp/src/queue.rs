//! FIFO event queue owned by a dispatcher thread

use crate::event::{Event, RuntimeId};
use crate::sync::WaitTimeout;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Default)]
struct QueueState {
    events: VecDeque<Box<dyn Event>>,
    closed: bool,
}

/// Thread-safe FIFO of events.
///
/// Any thread may push; only the owning dispatcher pops. A single lock
/// guards the whole queue.
#[derive(Default)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event and wakes the owner. A closed queue hands the event back.
    pub fn push_event(&self, event: Box<dyn Event>) -> Result<(), Box<dyn Event>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(event);
        }
        state.events.push_back(event);
        self.available.notify_one();
        Ok(())
    }

    /// Takes the oldest event, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or when the queue is closed.
    pub fn pop_event(&self, timeout: WaitTimeout) -> Option<Box<dyn Event>> {
        let deadline = timeout.deadline();
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            match (timeout, deadline) {
                (WaitTimeout::DoNotWait, _) => return None,
                (_, None) => self.available.wait(&mut state),
                (_, Some(deadline)) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return state.events.pop_front();
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Destroys all pending events and returns how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.state.lock().events.drain(..).collect();
        drained.len()
    }

    /// Destroys pending events of one runtime type.
    pub fn remove_events(&self, runtime: RuntimeId) -> usize {
        let mut state = self.state.lock();
        let before = state.events.len();
        state.events.retain(|event| event.runtime_id() != runtime);
        before - state.events.len()
    }

    /// Refuses further pushes, wakes the owner and drops pending events.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            self.available.notify_all();
            state.events.drain(..).collect()
        };
        drained.len()
    }

    /// Accepts pushes again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    struct Numbered(u32);

    impl Event for Numbered {}

    #[derive(Debug)]
    struct Other;

    impl Event for Other {}

    fn number(event: Box<dyn Event>) -> u32 {
        event.downcast_ref::<Numbered>().map(|n| n.0).unwrap_or(u32::MAX)
    }

    #[test]
    fn test_fifo_order_single_producer() {
        let queue = Arc::new(EventQueue::new());
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    queue.push_event(Box::new(Numbered(i))).unwrap();
                }
            })
        };
        let mut received = Vec::new();
        while received.len() < 100 {
            if let Some(event) = queue.pop_event(WaitTimeout::millis(1000)) {
                received.push(number(event));
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_pop_times_out_on_empty_queue() {
        let queue = EventQueue::new();
        let start = Instant::now();
        assert!(queue.pop_event(WaitTimeout::millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert!(queue.pop_event(WaitTimeout::DoNotWait).is_none());
    }

    #[test]
    fn test_close_wakes_blocked_owner_and_rejects_pushes() {
        let queue = Arc::new(EventQueue::new());
        let owner = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop_event(WaitTimeout::Infinite).is_none())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(owner.join().unwrap());
        assert!(queue.push_event(Box::new(Other)).is_err());
        queue.reopen();
        assert!(queue.push_event(Box::new(Other)).is_ok());
    }

    #[test]
    fn test_remove_events_by_type() {
        let queue = EventQueue::new();
        queue.push_event(Box::new(Numbered(1))).unwrap();
        queue.push_event(Box::new(Other)).unwrap();
        queue.push_event(Box::new(Numbered(2))).unwrap();
        assert_eq!(queue.remove_events(RuntimeId::of::<Other>()), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
