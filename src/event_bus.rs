/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [`Event`]s from every component of a node and fires the
//! handlers registered for them.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) start_instance_handlers: Vec<HandlerPtr<StartInstanceEvent>>,
    pub(crate) stop_instance_handlers: Vec<HandlerPtr<StopInstanceEvent>>,
    pub(crate) round_timeout_handlers: Vec<HandlerPtr<RoundTimeoutEvent>>,
    pub(crate) decide_handlers: Vec<HandlerPtr<DecideEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) prepare_handlers: Vec<HandlerPtr<PrepareEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) round_change_handlers: Vec<HandlerPtr<RoundChangeEvent>>,
    pub(crate) receive_message_handlers: Vec<HandlerPtr<ReceiveMessageEvent>>,
    pub(crate) start_sync_handlers: Vec<HandlerPtr<StartSyncEvent>>,
    pub(crate) end_sync_handlers: Vec<HandlerPtr<EndSyncEvent>>,
    pub(crate) sync_failed_handlers: Vec<HandlerPtr<SyncFailedEvent>>,
    pub(crate) receive_sync_request_handlers: Vec<HandlerPtr<ReceiveSyncRequestEvent>>,
    pub(crate) send_sync_response_handlers: Vec<HandlerPtr<SendSyncResponseEvent>>,
}

/// Register the default logger of `T` in `handlers` if `log_events` is set, and then the user's
/// handler, if any.
fn handlers_for<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        start_instance_handler: Option<HandlerPtr<StartInstanceEvent>>,
        stop_instance_handler: Option<HandlerPtr<StopInstanceEvent>>,
        round_timeout_handler: Option<HandlerPtr<RoundTimeoutEvent>>,
        decide_handler: Option<HandlerPtr<DecideEvent>>,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        prepare_handler: Option<HandlerPtr<PrepareEvent>>,
        commit_handler: Option<HandlerPtr<CommitEvent>>,
        round_change_handler: Option<HandlerPtr<RoundChangeEvent>>,
        receive_message_handler: Option<HandlerPtr<ReceiveMessageEvent>>,
        start_sync_handler: Option<HandlerPtr<StartSyncEvent>>,
        end_sync_handler: Option<HandlerPtr<EndSyncEvent>>,
        sync_failed_handler: Option<HandlerPtr<SyncFailedEvent>>,
        receive_sync_request_handler: Option<HandlerPtr<ReceiveSyncRequestEvent>>,
        send_sync_response_handler: Option<HandlerPtr<SendSyncResponseEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            start_instance_handlers: handlers_for(log_events, start_instance_handler),
            stop_instance_handlers: handlers_for(log_events, stop_instance_handler),
            round_timeout_handlers: handlers_for(log_events, round_timeout_handler),
            decide_handlers: handlers_for(log_events, decide_handler),
            propose_handlers: handlers_for(log_events, propose_handler),
            prepare_handlers: handlers_for(log_events, prepare_handler),
            commit_handlers: handlers_for(log_events, commit_handler),
            round_change_handlers: handlers_for(log_events, round_change_handler),
            receive_message_handlers: handlers_for(log_events, receive_message_handler),
            start_sync_handlers: handlers_for(log_events, start_sync_handler),
            end_sync_handlers: handlers_for(log_events, end_sync_handler),
            sync_failed_handlers: handlers_for(log_events, sync_failed_handler),
            receive_sync_request_handlers: handlers_for(log_events, receive_sync_request_handler),
            send_sync_response_handlers: handlers_for(log_events, send_sync_response_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start_instance_handlers.is_empty()
            && self.stop_instance_handlers.is_empty()
            && self.round_timeout_handlers.is_empty()
            && self.decide_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.round_change_handlers.is_empty()
            && self.receive_message_handlers.is_empty()
            && self.start_sync_handlers.is_empty()
            && self.end_sync_handlers.is_empty()
            && self.sync_failed_handlers.is_empty()
            && self.receive_sync_request_handlers.is_empty()
            && self.send_sync_response_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartInstance(start_instance_event) => self
                .start_instance_handlers
                .iter()
                .for_each(|handler| handler(&start_instance_event)),

            Event::StopInstance(stop_instance_event) => self
                .stop_instance_handlers
                .iter()
                .for_each(|handler| handler(&stop_instance_event)),

            Event::RoundTimeout(round_timeout_event) => self
                .round_timeout_handlers
                .iter()
                .for_each(|handler| handler(&round_timeout_event)),

            Event::Decide(decide_event) => self
                .decide_handlers
                .iter()
                .for_each(|handler| handler(&decide_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::Prepare(prepare_event) => self
                .prepare_handlers
                .iter()
                .for_each(|handler| handler(&prepare_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::RoundChange(round_change_event) => self
                .round_change_handlers
                .iter()
                .for_each(|handler| handler(&round_change_event)),

            Event::ReceiveMessage(receive_message_event) => self
                .receive_message_handlers
                .iter()
                .for_each(|handler| handler(&receive_message_event)),

            Event::StartSync(start_sync_event) => self
                .start_sync_handlers
                .iter()
                .for_each(|handler| handler(&start_sync_event)),

            Event::EndSync(end_sync_event) => self
                .end_sync_handlers
                .iter()
                .for_each(|handler| handler(&end_sync_event)),

            Event::SyncFailed(sync_failed_event) => self
                .sync_failed_handlers
                .iter()
                .for_each(|handler| handler(&sync_failed_event)),

            Event::ReceiveSyncRequest(receive_sync_request_event) => self
                .receive_sync_request_handlers
                .iter()
                .for_each(|handler| handler(&receive_sync_request_event)),

            Event::SendSyncResponse(send_sync_response_event) => self
                .send_sync_response_handlers
                .iter()
                .for_each(|handler| handler(&send_sync_response_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher has been dropped. Wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(10)),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            mpsc,
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::{Instant, SystemTime},
    };

    use super::*;
    use crate::types::data_types::{Lambda, SeqNumber, ValidatorPk};

    #[test]
    fn handlers_fire_for_their_event_only() {
        let starts = Arc::new(AtomicUsize::new(0));
        let starts_clone = starts.clone();
        let handlers = EventHandlers::new(
            false,
            Some(Box::new(move |_: &StartInstanceEvent| {
                starts_clone.fetch_add(1, Ordering::SeqCst);
            })),
            None, None, None, None, None, None, None, None, None, None, None, None, None,
        );
        assert!(!handlers.is_empty());
        assert!(EventHandlers::default().is_empty());

        let (publisher, subscriber) = mpsc::channel();
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let event_bus = start_event_bus(handlers, subscriber, shutdown_receiver);

        Event::StartInstance(StartInstanceEvent {
            timestamp: SystemTime::now(),
            validator_pk: ValidatorPk::new(vec![1]),
            lambda: Lambda::new(b"duty".to_vec()),
            seq_number: SeqNumber::first(),
        })
        .publish(&Some(publisher.clone()));
        Event::StartSync(StartSyncEvent {
            timestamp: SystemTime::now(),
            validator_pk: ValidatorPk::new(vec![1]),
            trigger_seq_number: SeqNumber::new(9),
        })
        .publish(&Some(publisher));

        let deadline = Instant::now() + Duration::from_secs(5);
        while starts.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.send(()).unwrap();
        event_bus.join().unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }
}
