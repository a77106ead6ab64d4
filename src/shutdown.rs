/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A one-shot shutdown signal shared by every thread a node starts.
//!
//! Each long-running loop [subscribes](Shutdown::subscribe) once and polls its [ShutdownSignal]
//! between units of work. Triggering is idempotent, and a subscriber that arrives after the trigger
//! sees the signal immediately.

use std::cell::Cell;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct Shutdown(Arc<Mutex<ShutdownState>>);

struct ShutdownState {
    triggered: bool,
    subscribers: Vec<Sender<()>>,
}

impl Shutdown {
    pub(crate) fn new() -> Shutdown {
        Shutdown(Arc::new(Mutex::new(ShutdownState {
            triggered: false,
            subscribers: Vec::new(),
        })))
    }

    pub(crate) fn subscribe(&self) -> ShutdownSignal {
        let (sender, receiver) = mpsc::channel();
        let mut state = self.0.lock().unwrap();
        if state.triggered {
            let _ = sender.send(());
        }
        state.subscribers.push(sender);
        ShutdownSignal {
            receiver,
            received: Cell::new(false),
        }
    }

    pub(crate) fn trigger(&self) {
        let mut state = self.0.lock().unwrap();
        if state.triggered {
            return;
        }
        state.triggered = true;
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.send(());
        }
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.0.lock().unwrap().triggered
    }
}

pub(crate) struct ShutdownSignal {
    receiver: Receiver<()>,
    received: Cell<bool>,
}

impl ShutdownSignal {
    /// Returns whether shutdown has been triggered, without blocking. Stays true once true.
    pub(crate) fn received(&self) -> bool {
        if self.received.get() {
            return true;
        }
        let received = match self.receiver.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        };
        self.received.set(received);
        received
    }

    /// Sleeps for at most `timeout`, waking early if shutdown is triggered. Returns whether it was.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        if self.received.get() {
            return true;
        }
        let received = match self.receiver.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        self.received.set(received);
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let first = shutdown.subscribe();
        let second = shutdown.subscribe();
        assert!(!first.received());

        shutdown.trigger();
        shutdown.trigger();
        assert!(first.received());
        assert!(first.received());
        assert!(second.wait(Duration::from_secs(5)));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.subscribe().received());
    }

    #[test]
    fn wait_times_out_without_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        let start = Instant::now();
        assert!(!signal.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
