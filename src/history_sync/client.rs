/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Catches a lagging node up with the decided messages that the rest of the committee has for one
//! validator.
//!
//! A [`HistorySync`] run goes through these states:
//!
//! ```text
//! Idle -> Discovering -> Fetching -> Idle
//!                    \           \
//!                     `-----------`-> Failed
//! ```
//!
//! ## Discovering
//!
//! [`find_highest_instance`](HistorySync::find_highest_instance) asks every other committee member for
//! the highest decided message it has, and waits until `quorum_size - 1` of them have answered or the
//! response timeout passes. A response only counts if it is empty or carries a decided message signed by
//! a quorum, so a lying peer cannot make the node chase a sequence number nobody decided. The decided
//! message that triggered the run is a candidate too. The highest candidate wins.
//!
//! ## Fetching
//!
//! [`fetch_validate_and_save_instances`](HistorySync::fetch_validate_and_save_instances) requests the
//! missing range in chunks of at most `request_limit` entries. It tries the peer that reported the
//! highest entry first and the other peers in random order after that. Every entry is checked before it
//! is saved:
//! 1. It is a decided message for the validator being synced.
//! 2. It has the next sequence number expected, so entries are saved in increasing order without gaps.
//! 3. It is signed by a quorum of committee members.
//!
//! While waiting for a peer's answer, responses from other peers and answers to earlier requests are
//! skipped. Only an answer that does not arrive in time, or that does not move the sync forward because
//! it is empty or its first entry is invalid, counts as a failed attempt, and then the next peer is
//! asked. After `max_retries` failed attempts the run fails. The entries saved before that
//! are all valid, and a later run picks up where this one stopped.

use std::{
    collections::BTreeSet,
    sync::mpsc::Sender,
    time::{Duration, Instant, SystemTime},
};

use rand::seq::SliceRandom;

use crate::{
    decided_store::{DecidedStore, DecidedStoreError, SaveDecidedOutcome},
    events::{EndSyncEvent, Event, StartSyncEvent, SyncFailedEvent},
    messages::SignedMessage,
    networking::{
        receiving::{SyncClientStub, SyncResponseReceiveError},
        sending::SenderHandle,
        Network,
    },
    types::{
        committee::Committee,
        data_types::{NodeID, SeqNumber, SyncRequestLimit, ValidatorPk},
    },
};

use super::messages::{SyncRequest, SyncResponse};

/// Immutable parameters that define the behaviour of a [`HistorySync`] run.
#[derive(Clone)]
pub(crate) struct HistorySyncConfiguration {
    pub(crate) me: NodeID,
    pub(crate) committee: Committee,
    pub(crate) quorum_size: usize,
    pub(crate) request_limit: SyncRequestLimit,
    pub(crate) response_timeout: Duration,
    pub(crate) max_retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistorySyncState {
    Idle,
    Discovering,
    Fetching,
    Failed,
}

/// The highest decided message found while discovering, and the peer that reported it.
#[derive(Clone, Debug)]
pub(crate) struct HighestDecided {
    pub(crate) decided: SignedMessage,
    pub(crate) reported_by: Option<NodeID>,
}

/// Summary of a successful run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncSummary {
    pub highest_seq_number: Option<SeqNumber>,
    pub entries_saved: u64,
}

#[derive(Debug)]
pub enum HistorySyncError {
    /// The committee has no member other than the local node to sync from.
    NoPeers,
    /// Every attempt to fetch the entry at `next` failed.
    RetriesExhausted { next: SeqNumber, attempts: u32 },
    /// The node is shutting down.
    Disconnected,
    DecidedStoreError(DecidedStoreError),
}

impl From<DecidedStoreError> for HistorySyncError {
    fn from(value: DecidedStoreError) -> Self {
        HistorySyncError::DecidedStoreError(value)
    }
}

impl From<SyncResponseReceiveError> for HistorySyncError {
    fn from(_: SyncResponseReceiveError) -> Self {
        HistorySyncError::Disconnected
    }
}

pub(crate) struct HistorySync<N: Network, S: DecidedStore> {
    config: HistorySyncConfiguration,
    validator_pk: ValidatorPk,
    decided_store: S,
    sender: SenderHandle<N>,
    responses: SyncClientStub,
    state: HistorySyncState,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, S: DecidedStore> HistorySync<N, S> {
    pub(crate) fn new(
        config: HistorySyncConfiguration,
        validator_pk: ValidatorPk,
        decided_store: S,
        network: N,
        responses: SyncClientStub,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            config,
            validator_pk,
            decided_store,
            sender: SenderHandle::new(network),
            responses,
            state: HistorySyncState::Idle,
            event_publisher,
        }
    }

    pub(crate) fn state(&self) -> HistorySyncState {
        self.state
    }

    /// Discover the highest decided entry and save every entry between the local highest and it.
    ///
    /// `trigger` is the decided message that revealed that the local node is behind. It must already be
    /// known to be valid.
    pub(crate) fn run(&mut self, trigger: &SignedMessage) -> Result<SyncSummary, HistorySyncError> {
        Event::StartSync(StartSyncEvent {
            timestamp: SystemTime::now(),
            validator_pk: self.validator_pk.clone(),
            trigger_seq_number: trigger.message.seq_number,
        })
        .publish(&self.event_publisher);

        match self.sync(trigger) {
            Ok(summary) => {
                self.state = HistorySyncState::Idle;
                Event::EndSync(EndSyncEvent {
                    timestamp: SystemTime::now(),
                    validator_pk: self.validator_pk.clone(),
                    highest_seq_number: summary.highest_seq_number,
                    entries_saved: summary.entries_saved,
                })
                .publish(&self.event_publisher);
                Ok(summary)
            }
            Err(err) => {
                self.state = HistorySyncState::Failed;
                Event::SyncFailed(SyncFailedEvent {
                    timestamp: SystemTime::now(),
                    validator_pk: self.validator_pk.clone(),
                    reason: format!("{:?}", err),
                })
                .publish(&self.event_publisher);
                Err(err)
            }
        }
    }

    fn sync(&mut self, trigger: &SignedMessage) -> Result<SyncSummary, HistorySyncError> {
        let local_highest = self.decided_store.highest_decided_seq(&self.validator_pk)?;

        self.state = HistorySyncState::Discovering;
        let highest = match self.find_highest_instance(Some(trigger))? {
            Some(highest) => highest,
            None => {
                return Ok(SyncSummary {
                    highest_seq_number: local_highest,
                    entries_saved: 0,
                })
            }
        };
        let end = highest.decided.message.seq_number;
        if local_highest.is_some_and(|local_highest| local_highest >= end) {
            return Ok(SyncSummary {
                highest_seq_number: local_highest,
                entries_saved: 0,
            });
        }

        self.state = HistorySyncState::Fetching;
        let start = local_highest.map_or(SeqNumber::first(), |seq| seq.next());
        let entries_saved = self.fetch_validate_and_save_instances(start, end, highest.reported_by)?;

        Ok(SyncSummary {
            highest_seq_number: Some(end),
            entries_saved,
        })
    }

    /// Ask the other committee members for their highest decided message for the validator, and get the
    /// highest valid one among the responses and `trigger`.
    pub(crate) fn find_highest_instance(
        &mut self,
        trigger: Option<&SignedMessage>,
    ) -> Result<Option<HighestDecided>, HistorySyncError> {
        let peers = self.peers();
        if peers.is_empty() {
            return Err(HistorySyncError::NoPeers);
        }

        let mut highest = trigger
            .filter(|trigger| self.is_valid_entry(trigger))
            .map(|trigger| HighestDecided {
                decided: trigger.clone(),
                reported_by: None,
            });

        for peer in &peers {
            self.sender.send(
                *peer,
                SyncRequest::GetHighest {
                    validator_pk: self.validator_pk.clone(),
                },
            );
        }

        let wanted = self.config.quorum_size.saturating_sub(1).min(peers.len());
        let mut respondents = BTreeSet::new();
        let deadline = Instant::now() + self.config.response_timeout;
        while respondents.len() < wanted {
            let (origin, response) = match self.responses.recv_any(deadline) {
                Ok(received) => received,
                Err(SyncResponseReceiveError::Timeout) => break,
                Err(err) => return Err(err.into()),
            };
            if !peers.contains(&origin) || respondents.contains(&origin) {
                continue;
            }
            let decided = match response {
                SyncResponse::Highest { decided, .. } => decided,
                SyncResponse::Range { .. } => continue,
            };

            match decided {
                None => {
                    respondents.insert(origin);
                }
                Some(decided) if self.is_valid_entry(&decided) => {
                    respondents.insert(origin);
                    let is_higher = highest.as_ref().map_or(true, |highest| {
                        decided.message.seq_number > highest.decided.message.seq_number
                    });
                    if is_higher {
                        highest = Some(HighestDecided {
                            decided,
                            reported_by: Some(origin),
                        });
                    }
                }
                Some(_) => log::warn!(
                    "Ignoring invalid highest decided message from node {} for validator {:?}",
                    origin,
                    self.validator_pk
                ),
            }
        }

        if respondents.len() < wanted {
            log::debug!(
                "Only {} of {} peers reported their highest decided message for validator {:?}",
                respondents.len(),
                wanted,
                self.validator_pk
            );
        }

        Ok(highest)
    }

    /// Fetch the decided messages in `start..=end` from peers, and save each one that is valid in
    /// increasing sequence order. Returns the number of entries newly saved.
    pub(crate) fn fetch_validate_and_save_instances(
        &mut self,
        start: SeqNumber,
        end: SeqNumber,
        preferred_peer: Option<NodeID>,
    ) -> Result<u64, HistorySyncError> {
        let mut peers = self.peers();
        if peers.is_empty() {
            return Err(HistorySyncError::NoPeers);
        }
        peers.shuffle(&mut rand::thread_rng());
        if let Some(preferred) = preferred_peer {
            if let Some(position) = peers.iter().position(|peer| *peer == preferred) {
                peers.swap(0, position);
            }
        }

        // Answers to the discovery requests that came in after it ended.
        self.responses.drain();

        let limit = u64::from(self.config.request_limit.int());
        let mut next = start;
        let mut entries_saved = 0;
        let mut attempts = 0;
        let mut peer_index = 0;
        while next <= end {
            if attempts >= self.config.max_retries {
                return Err(HistorySyncError::RetriesExhausted { next, attempts });
            }

            let peer = peers[peer_index % peers.len()];
            let chunk_end = (next + (limit - 1)).min(end);
            self.sender.send(
                peer,
                SyncRequest::GetRange {
                    validator_pk: self.validator_pk.clone(),
                    start: next,
                    end: chunk_end,
                },
            );

            let deadline = Instant::now() + self.config.response_timeout;
            let decided = match self.recv_range(peer, next, deadline)? {
                Some(decided) => decided,
                None => {
                    log::debug!(
                        "Sync range request to node {} for validator {:?} timed out",
                        peer,
                        self.validator_pk
                    );
                    Vec::new()
                }
            };

            let (saved, reached) = self.save_valid_prefix(peer, next, chunk_end, decided)?;
            entries_saved += saved;
            if reached == next {
                attempts += 1;
                peer_index += 1;
            }
            next = reached;
        }

        Ok(entries_saved)
    }

    /// Wait for `peer` to answer the range request starting at `start`. Responses from other peers and
    /// answers to earlier requests are skipped. Returns `None` if no answer arrives before `deadline`.
    fn recv_range(
        &self,
        peer: NodeID,
        start: SeqNumber,
        deadline: Instant,
    ) -> Result<Option<Vec<SignedMessage>>, HistorySyncError> {
        loop {
            match self.responses.recv_any(deadline) {
                Ok((
                    origin,
                    SyncResponse::Range {
                        start: range_start,
                        decided,
                        ..
                    },
                )) if origin == peer && range_start == start => return Ok(Some(decided)),
                Ok((origin, _)) => log::trace!(
                    "Skipping sync response from node {} while waiting for node {}, seq {}",
                    origin,
                    peer,
                    start
                ),
                Err(SyncResponseReceiveError::Timeout) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Save the entries of a range response that continue the sequence from `next`, stopping at the
    /// first entry that is missing or invalid. Returns the number of entries newly saved and the next
    /// sequence number still missing.
    fn save_valid_prefix(
        &mut self,
        peer: NodeID,
        mut next: SeqNumber,
        chunk_end: SeqNumber,
        mut decided: Vec<SignedMessage>,
    ) -> Result<(u64, SeqNumber), HistorySyncError> {
        decided.sort_by_key(|entry| entry.message.seq_number);

        let mut saved = 0;
        for entry in decided {
            let seq_number = entry.message.seq_number;
            // Before what was asked for.
            if seq_number < next {
                continue;
            }
            if seq_number != next || seq_number > chunk_end {
                break;
            }
            if !self.is_valid_entry(&entry) {
                log::warn!(
                    "Discarding invalid decided message from node {} for validator {:?}, seq {}",
                    peer,
                    self.validator_pk,
                    seq_number
                );
                break;
            }

            if self.decided_store.save_decided(&entry)? == SaveDecidedOutcome::Saved {
                saved += 1;
            }
            next = next.next();
        }

        Ok((saved, next))
    }

    fn is_valid_entry(&self, decided: &SignedMessage) -> bool {
        decided.message.validator_pk == self.validator_pk
            && decided.is_valid_decided(&self.config.committee, self.config.quorum_size)
    }

    fn peers(&self) -> Vec<NodeID> {
        self.config
            .committee
            .ids()
            .filter(|id| *id != self.config.me)
            .collect()
    }
}
