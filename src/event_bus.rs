/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which hands published [events](crate::events) to their handlers.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;
use crate::shutdown::ShutdownSignal;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct EventHandlers {
    pub(crate) insert_block_handlers: Vec<HandlerPtr<InsertBlockEvent>>,
    pub(crate) skip_block_handlers: Vec<HandlerPtr<SkipBlockEvent>>,
    pub(crate) invalid_ordering_handlers: Vec<HandlerPtr<InvalidOrderingEvent>>,
    pub(crate) mint_block_handlers: Vec<HandlerPtr<MintBlockEvent>>,
    pub(crate) propose_block_handlers: Vec<HandlerPtr<ProposeBlockEvent>>,
    pub(crate) become_leader_handlers: Vec<HandlerPtr<BecomeLeaderEvent>>,
    pub(crate) step_down_handlers: Vec<HandlerPtr<StepDownEvent>>,
    pub(crate) add_peer_handlers: Vec<HandlerPtr<AddPeerEvent>>,
    pub(crate) remove_peer_handlers: Vec<HandlerPtr<RemovePeerEvent>>,
    pub(crate) take_snapshot_handlers: Vec<HandlerPtr<TakeSnapshotEvent>>,
    pub(crate) apply_snapshot_handlers: Vec<HandlerPtr<ApplySnapshotEvent>>,
}

// The default logger (if enabled) runs before the user's handler.
fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        insert_block_handler: Option<HandlerPtr<InsertBlockEvent>>,
        skip_block_handler: Option<HandlerPtr<SkipBlockEvent>>,
        invalid_ordering_handler: Option<HandlerPtr<InvalidOrderingEvent>>,
        mint_block_handler: Option<HandlerPtr<MintBlockEvent>>,
        propose_block_handler: Option<HandlerPtr<ProposeBlockEvent>>,
        become_leader_handler: Option<HandlerPtr<BecomeLeaderEvent>>,
        step_down_handler: Option<HandlerPtr<StepDownEvent>>,
        add_peer_handler: Option<HandlerPtr<AddPeerEvent>>,
        remove_peer_handler: Option<HandlerPtr<RemovePeerEvent>>,
        take_snapshot_handler: Option<HandlerPtr<TakeSnapshotEvent>>,
        apply_snapshot_handler: Option<HandlerPtr<ApplySnapshotEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            insert_block_handlers: handlers(log_events, insert_block_handler),
            skip_block_handlers: handlers(log_events, skip_block_handler),
            invalid_ordering_handlers: handlers(log_events, invalid_ordering_handler),
            mint_block_handlers: handlers(log_events, mint_block_handler),
            propose_block_handlers: handlers(log_events, propose_block_handler),
            become_leader_handlers: handlers(log_events, become_leader_handler),
            step_down_handlers: handlers(log_events, step_down_handler),
            add_peer_handlers: handlers(log_events, add_peer_handler),
            remove_peer_handlers: handlers(log_events, remove_peer_handler),
            take_snapshot_handlers: handlers(log_events, take_snapshot_handler),
            apply_snapshot_handlers: handlers(log_events, apply_snapshot_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.insert_block_handlers.is_empty()
            && self.skip_block_handlers.is_empty()
            && self.invalid_ordering_handlers.is_empty()
            && self.mint_block_handlers.is_empty()
            && self.propose_block_handlers.is_empty()
            && self.become_leader_handlers.is_empty()
            && self.step_down_handlers.is_empty()
            && self.add_peer_handlers.is_empty()
            && self.remove_peer_handlers.is_empty()
            && self.take_snapshot_handlers.is_empty()
            && self.apply_snapshot_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::InsertBlock(insert_block_event) =>
                self.insert_block_handlers.iter().for_each(|handler| handler(&insert_block_event)),

            Event::SkipBlock(skip_block_event) =>
                self.skip_block_handlers.iter().for_each(|handler| handler(&skip_block_event)),

            Event::InvalidOrdering(invalid_ordering_event) =>
                self.invalid_ordering_handlers.iter().for_each(|handler| handler(&invalid_ordering_event)),

            Event::MintBlock(mint_block_event) =>
                self.mint_block_handlers.iter().for_each(|handler| handler(&mint_block_event)),

            Event::ProposeBlock(propose_block_event) =>
                self.propose_block_handlers.iter().for_each(|handler| handler(&propose_block_event)),

            Event::BecomeLeader(become_leader_event) =>
                self.become_leader_handlers.iter().for_each(|handler| handler(&become_leader_event)),

            Event::StepDown(step_down_event) =>
                self.step_down_handlers.iter().for_each(|handler| handler(&step_down_event)),

            Event::AddPeer(add_peer_event) =>
                self.add_peer_handlers.iter().for_each(|handler| handler(&add_peer_event)),

            Event::RemovePeer(remove_peer_event) =>
                self.remove_peer_handlers.iter().for_each(|handler| handler(&remove_peer_event)),

            Event::TakeSnapshot(take_snapshot_event) =>
                self.take_snapshot_handlers.iter().for_each(|handler| handler(&take_snapshot_event)),

            Event::ApplySnapshot(apply_snapshot_event) =>
                self.apply_snapshot_handlers.iter().for_each(|handler| handler(&apply_snapshot_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: ShutdownSignal,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if shutdown_signal.received() {
            return;
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone, so there is nothing left to handle.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
