/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [config](crate::node::Configuration).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [Decide](crate::events::DecideEvent) is printed:
//!
//! ```text
//! Decide, 1701329264, AQEBAQE, ZHV0eS0, 7, 2, 3f1a9c0e, 3
//! ```
//!
//! In the snippet:
//! - The third and fourth values are the first seven characters of the Base64 encoding of the validator
//!   key and the lambda.
//! - The fifth and sixth values are the sequence number and round.
//! - The seventh value is the start of the hex-encoded SHA256 hash of the decided value.
//! - The eighth value is the number of signatures on the decided message.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::{
    events::*,
    history_sync::messages::{SyncRequest, SyncResponse},
    messages::SignedMessage,
};

// Names of each event in PascalCase for printing:
pub const START_INSTANCE: &str = "StartInstance";
pub const STOP_INSTANCE: &str = "StopInstance";
pub const ROUND_TIMEOUT: &str = "RoundTimeout";
pub const DECIDE: &str = "Decide";

pub const PROPOSE: &str = "Propose";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";
pub const ROUND_CHANGE: &str = "RoundChange";

pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";

pub const START_SYNC: &str = "StartSync";
pub const END_SYNC: &str = "EndSync";
pub const SYNC_FAILED: &str = "SyncFailed";
pub const RECEIVE_SYNC_REQUEST: &str = "ReceiveSyncRequest";
pub const SEND_SYNC_RESPONSE: &str = "SendSyncResponse";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for StartInstanceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_instance_event: &StartInstanceEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                START_INSTANCE,
                secs_since_unix_epoch(start_instance_event.timestamp),
                first_seven_base64_chars(start_instance_event.validator_pk.bytes()),
                first_seven_base64_chars(start_instance_event.lambda.bytes()),
                start_instance_event.seq_number
            )
        };
        Box::new(logger)
    }
}

impl Logger for StopInstanceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stop_instance_event: &StopInstanceEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                STOP_INSTANCE,
                secs_since_unix_epoch(stop_instance_event.timestamp),
                first_seven_base64_chars(stop_instance_event.lambda.bytes()),
                stop_instance_event.seq_number,
                stop_instance_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoundTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |round_timeout_event: &RoundTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                ROUND_TIMEOUT,
                secs_since_unix_epoch(round_timeout_event.timestamp),
                first_seven_base64_chars(round_timeout_event.lambda.bytes()),
                round_timeout_event.seq_number,
                round_timeout_event.round,
                round_timeout_event.timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for DecideEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |decide_event: &DecideEvent| {
            log::info!(
                "{}, {}, {}, {}",
                DECIDE,
                secs_since_unix_epoch(decide_event.timestamp),
                signed_message_info(&decide_event.decided),
                decide_event.decided.signer_count()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                signed_message_info(&propose_event.pre_prepare)
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepare_event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(prepare_event.timestamp),
                signed_message_info(&prepare_event.prepare)
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                signed_message_info(&commit_event.commit)
            )
        };
        Box::new(logger)
    }
}

impl Logger for RoundChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |round_change_event: &RoundChangeEvent| {
            log::info!(
                "{}, {}, {}, {:?}",
                ROUND_CHANGE,
                secs_since_unix_epoch(round_change_event.timestamp),
                signed_message_info(&round_change_event.round_change),
                round_change_event
                    .round_change
                    .message
                    .prepared_round
                    .map(|round| round.int())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveMessageEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_message_event: &ReceiveMessageEvent| {
            log::info!(
                "{}, {}, {}, {:?}, {}",
                RECEIVE_MESSAGE,
                secs_since_unix_epoch(receive_message_event.timestamp),
                receive_message_event.signer,
                receive_message_event.msg.msg_type(),
                signed_message_info(&receive_message_event.msg)
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_sync_event: &StartSyncEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_SYNC,
                secs_since_unix_epoch(start_sync_event.timestamp),
                first_seven_base64_chars(start_sync_event.validator_pk.bytes()),
                start_sync_event.trigger_seq_number
            )
        };
        Box::new(logger)
    }
}

impl Logger for EndSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |end_sync_event: &EndSyncEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                END_SYNC,
                secs_since_unix_epoch(end_sync_event.timestamp),
                first_seven_base64_chars(end_sync_event.validator_pk.bytes()),
                end_sync_event
                    .highest_seq_number
                    .map_or(String::from("none"), |seq| seq.to_string()),
                end_sync_event.entries_saved
            )
        };
        Box::new(logger)
    }
}

impl Logger for SyncFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |sync_failed_event: &SyncFailedEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                SYNC_FAILED,
                secs_since_unix_epoch(sync_failed_event.timestamp),
                first_seven_base64_chars(sync_failed_event.validator_pk.bytes()),
                sync_failed_event.reason
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveSyncRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_sync_request_event: &ReceiveSyncRequestEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_SYNC_REQUEST,
                secs_since_unix_epoch(receive_sync_request_event.timestamp),
                receive_sync_request_event.peer,
                sync_request_info(&receive_sync_request_event.request)
            )
        };
        Box::new(logger)
    }
}

impl Logger for SendSyncResponseEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |send_sync_response_event: &SendSyncResponseEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SEND_SYNC_RESPONSE,
                secs_since_unix_epoch(send_sync_response_event.timestamp),
                send_sync_response_event.peer,
                sync_response_info(&send_sync_response_event.response)
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn signed_message_info(msg: &SignedMessage) -> String {
    format!(
        "{}, {}, {}, {}, {}",
        first_seven_base64_chars(msg.message.validator_pk.bytes()),
        first_seven_base64_chars(msg.message.lambda.bytes()),
        msg.message.seq_number,
        msg.message.round,
        msg.message.value.hash()
    )
}

fn sync_request_info(request: &SyncRequest) -> String {
    match request {
        SyncRequest::GetHighest { validator_pk } => {
            format!("GetHighest, {}", first_seven_base64_chars(validator_pk.bytes()))
        }
        SyncRequest::GetRange {
            validator_pk,
            start,
            end,
        } => format!(
            "GetRange, {}, {}, {}",
            first_seven_base64_chars(validator_pk.bytes()),
            start,
            end
        ),
    }
}

fn sync_response_info(response: &SyncResponse) -> String {
    match response {
        SyncResponse::Highest {
            validator_pk,
            decided,
        } => format!(
            "Highest, {}, {}",
            first_seven_base64_chars(validator_pk.bytes()),
            decided
                .as_ref()
                .map_or(String::from("none"), |decided| decided
                    .message
                    .seq_number
                    .to_string())
        ),
        SyncResponse::Range {
            validator_pk,
            start,
            decided,
        } => format!(
            "Range, {}, {}, {}",
            first_seven_base64_chars(validator_pk.bytes()),
            start,
            decided.len()
        ),
    }
}
