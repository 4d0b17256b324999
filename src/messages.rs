/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Consensus messages exchanged between the nodes of a committee.
//!
//! Every message travelling between nodes is a [`SignedMessage`]: a [`Message`] plus one Ed25519
//! signature per signer. Pre-prepare, prepare, commit, and round-change messages carry exactly one
//! signature. Decided messages aggregate the commit signatures of a quorum.
//!
//! ## Signing payload
//!
//! Signers sign the Borsh serialization of the message's [signing payload](Message::signing_bytes).
//! The payload of a [`MessageType::Decided`] message is identical to that of the
//! [`MessageType::Commit`] message it aggregates, which lets the commit signatures collected by an
//! instance be copied into the decided message unchanged.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    committee::Committee,
    crypto_primitives::{verify, Keypair, SigningKey},
    data_types::{Lambda, NodeID, Round, SeqNumber, SignatureBytes, ValidatorPk, Value},
};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub enum MessageType {
    PrePrepare,
    Prepare,
    Commit,
    RoundChange,
    Decided,
}

impl MessageType {
    /// The message type whose signatures are valid for this message type.
    fn signing_domain(&self) -> MessageType {
        match self {
            MessageType::Decided => MessageType::Commit,
            other => *other,
        }
    }
}

/// The unsigned content of a consensus message.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub round: Round,
    pub lambda: Lambda,
    pub seq_number: SeqNumber,
    pub validator_pk: ValidatorPk,
    /// For decided messages, the agreed value. For round-change messages, the highest prepared value
    /// known to the sender, or an empty value if it never prepared.
    pub value: Value,
    /// For round-change messages, the round in which `value` was prepared. `None` everywhere else.
    pub prepared_round: Option<Round>,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        round: Round,
        lambda: Lambda,
        seq_number: SeqNumber,
        validator_pk: ValidatorPk,
        value: Value,
    ) -> Self {
        Self {
            msg_type,
            round,
            lambda,
            seq_number,
            validator_pk,
            value,
            prepared_round: None,
        }
    }

    /// Create a round-change message for `round`, carrying the sender's prepared round and value, if any.
    pub fn round_change(
        round: Round,
        lambda: Lambda,
        seq_number: SeqNumber,
        validator_pk: ValidatorPk,
        prepared: Option<(Round, Value)>,
    ) -> Self {
        let (prepared_round, value) = match prepared {
            Some((prepared_round, value)) => (Some(prepared_round), value),
            None => (None, Value::default()),
        };
        Self {
            msg_type: MessageType::RoundChange,
            round,
            lambda,
            seq_number,
            validator_pk,
            value,
            prepared_round,
        }
    }

    /// Get the bytes that are passed as input into the signing function.
    pub fn signing_bytes(&self) -> Vec<u8> {
        (
            self.msg_type.signing_domain(),
            self.round,
            self.lambda.clone(),
            self.seq_number,
            self.validator_pk.clone(),
            self.value.clone(),
            self.prepared_round,
        )
            .try_to_vec()
            .unwrap()
    }

    /// Get the prepared round and value carried by a round-change message.
    pub fn prepared(&self) -> Option<(Round, &Value)> {
        self.prepared_round.map(|round| (round, &self.value))
    }
}

/// A [`Message`] together with the signatures of the nodes that signed it, keyed by signer.
///
/// Because signatures are keyed by [`NodeID`], a signer can appear in a `SignedMessage` at most once.
///
/// ## Justification
///
/// `justification` is not covered by the signatures. It carries other signed messages that back the
/// claims made by `message`, and every one of them is verified on its own:
/// - A round-change message that reports a prepared value carries the quorum of prepare messages for
///   that value.
/// - A pre-prepare message for a round above the first carries the quorum of round-change messages that
///   started the round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedMessage {
    pub message: Message,
    pub signatures: BTreeMap<NodeID, SignatureBytes>,
    pub justification: Vec<SignedMessage>,
}

// Written by hand because the derive cannot handle the recursive `justification` field. The encoding is
// the same as the derive's: fields in declaration order.
impl BorshSerialize for SignedMessage {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.message.serialize(writer)?;
        self.signatures.serialize(writer)?;
        self.justification.serialize(writer)
    }
}

impl BorshDeserialize for SignedMessage {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            message: BorshDeserialize::deserialize_reader(reader)?,
            signatures: BorshDeserialize::deserialize_reader(reader)?,
            justification: BorshDeserialize::deserialize_reader(reader)?,
        })
    }
}

impl SignedMessage {
    /// Sign `message` as `signer` with `signing_key`.
    pub fn sign(message: Message, signer: NodeID, signing_key: &SigningKey) -> Self {
        Self::sign_with(message, signer, &Keypair::new(signing_key.clone()))
    }

    pub(crate) fn sign_with(message: Message, signer: NodeID, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&message.signing_bytes());
        let mut signatures = BTreeMap::new();
        signatures.insert(signer, signature);
        Self {
            message,
            signatures,
            justification: Vec::new(),
        }
    }

    /// Replace the justification of this message.
    pub fn with_justification(mut self, justification: Vec<SignedMessage>) -> Self {
        self.justification = justification;
        self
    }

    /// Merge the signatures of `parts` into a single `SignedMessage` over `message`.
    ///
    /// The caller is responsible for making sure every part was signed over the same signing payload as
    /// `message`, otherwise the result will not verify.
    pub fn aggregate<'a>(message: Message, parts: impl IntoIterator<Item = &'a SignedMessage>) -> Self {
        let signatures = parts
            .into_iter()
            .flat_map(|part| part.signatures.iter().map(|(id, sig)| (*id, *sig)))
            .collect();
        Self {
            message,
            signatures,
            justification: Vec::new(),
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.message.msg_type
    }

    pub fn signer_ids(&self) -> impl Iterator<Item = NodeID> + '_ {
        self.signatures.keys().copied()
    }

    pub fn signer_count(&self) -> usize {
        self.signatures.len()
    }

    /// The signer of a message that is expected to have exactly one signature.
    pub fn single_signer(&self) -> Option<NodeID> {
        if self.signatures.len() == 1 {
            self.signatures.keys().next().copied()
        } else {
            None
        }
    }

    /// Check that the message has at least one signature, that every signer is a member of
    /// `committee`, and that every signature verifies against the signer's public key.
    pub fn is_correctly_signed(&self, committee: &Committee) -> bool {
        if self.signatures.is_empty() {
            return false;
        }
        let signing_bytes = self.message.signing_bytes();
        self.signatures
            .iter()
            .all(|(signer, signature)| match committee.public_key(signer) {
                Some(public_key) => verify(public_key, &signing_bytes, signature),
                None => false,
            })
    }

    /// Check that this is a decided message that is correctly signed by at least `quorum_size` distinct
    /// committee members.
    pub fn is_valid_decided(&self, committee: &Committee, quorum_size: usize) -> bool {
        self.msg_type() == MessageType::Decided
            && self.signatures.len() >= quorum_size
            && self.is_correctly_signed(committee)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;
    use crate::types::committee::Node;

    fn committee_of(keys: &[SigningKey]) -> Committee {
        keys.iter()
            .enumerate()
            .map(|(i, key)| Node::new(NodeID::new(i as u64), key.verifying_key()))
            .collect()
    }

    fn commit(value: &[u8]) -> Message {
        Message::new(
            MessageType::Commit,
            Round::first(),
            Lambda::new(b"lambda".to_vec()),
            SeqNumber::first(),
            ValidatorPk::new(vec![7; 48]),
            Value::new(value.to_vec()),
        )
    }

    #[test]
    fn aggregated_commits_verify_as_decided() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let committee = committee_of(&keys);

        let commits: Vec<SignedMessage> = (0..3)
            .map(|i| SignedMessage::sign(commit(b"v"), NodeID::new(i), &keys[i as usize]))
            .collect();
        let mut decided_msg = commit(b"v");
        decided_msg.msg_type = MessageType::Decided;
        let decided = SignedMessage::aggregate(decided_msg, &commits);

        assert_eq!(decided.signer_count(), 3);
        assert!(decided.is_valid_decided(&committee, committee.quorum_size()));

        // Two signatures are not a quorum of four.
        let forged = SignedMessage::aggregate(decided.message.clone(), &commits[0..2]);
        assert!(forged.is_correctly_signed(&committee));
        assert!(!forged.is_valid_decided(&committee, committee.quorum_size()));
    }

    #[test]
    fn tampered_value_fails_verification() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let committee = committee_of(&keys);

        let mut msg = SignedMessage::sign(commit(b"v"), NodeID::new(0), &keys[0]);
        assert!(msg.is_correctly_signed(&committee));

        msg.message.value = Value::new(b"w".to_vec());
        assert!(!msg.is_correctly_signed(&committee));
    }

    #[test]
    fn unknown_signer_fails_verification() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let committee = committee_of(&keys[0..3]);

        let msg = SignedMessage::sign(commit(b"v"), NodeID::new(3), &keys[3]);
        assert!(!msg.is_correctly_signed(&committee));
        assert_eq!(msg.single_signer(), Some(NodeID::new(3)));
    }

    #[test]
    fn prepare_signature_is_not_a_commit_signature() {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let committee = committee_of(&keys);

        let mut msg = SignedMessage::sign(commit(b"v"), NodeID::new(0), &keys[0]);
        msg.message.msg_type = MessageType::Prepare;
        assert!(!msg.is_correctly_signed(&committee));
    }
}
