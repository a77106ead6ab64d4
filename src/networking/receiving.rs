/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The poller thread, which moves raft messages from the [`Transport`] to the event loop.

use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use raft::eraftpb::Message;

use crate::shutdown::ShutdownSignal;

use super::network::Transport;

const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Spawn the poller thread. Every message received is converted into the event loop's input type and
/// sent on `to_event_loop`. The thread exits on shutdown or when the event loop is gone.
pub(crate) fn start_polling<T: Transport, I: From<Message> + Send + 'static>(
    mut transport: T,
    to_event_loop: Sender<I>,
    shutdown_signal: ShutdownSignal,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if shutdown_signal.received() {
            return;
        }

        if let Some(msg) = transport.recv() {
            if to_event_loop.send(I::from(msg)).is_err() {
                return;
            }
        } else {
            thread::sleep(IDLE_BACKOFF)
        }
    })
}
