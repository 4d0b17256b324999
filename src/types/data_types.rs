/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or integers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::crypto_primitives::{CryptoHasher, Digest};

/// Opaque byte string naming the logical object that a consensus instance agrees on, for example a
/// validator and duty key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Lambda(Vec<u8>);

impl Lambda {
    /// Create a new `Lambda` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner bytes of this `Lambda`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for Lambda {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Lambda({})", String::from_utf8_lossy(&self.0))
    }
}

/// Index of a decided value in the sequence of values agreed on for one validator.
///
/// The first instance for a validator runs at [`SeqNumber::first`], and every later instance runs at
/// one more than the highest decided sequence number on record.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct SeqNumber(u64);

impl SeqNumber {
    /// Create a new `SeqNumber` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The sequence number that a validator's very first instance runs at.
    pub const fn first() -> Self {
        Self(1)
    }

    /// Get the inner `u64` value of this `SeqNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the big-endian representation of the inner value. Big-endian keeps byte-wise key order equal
    /// to numeric order.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Get the sequence number that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SeqNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SeqNumber {
    type Output = SeqNumber;
    fn add(self, rhs: u64) -> Self::Output {
        SeqNumber(self.0 + rhs)
    }
}

/// Sub-attempt within a consensus instance. Starts at 1 and increases on every round change.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Round(u64);

impl Round {
    /// Create a new `Round` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The round every instance starts in.
    pub const fn first() -> Self {
        Self(1)
    }

    /// Get the inner `u64` value of this `Round`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Round {
    type Output = Round;
    fn add(self, rhs: u64) -> Self::Output {
        Round(self.0 + rhs)
    }
}

impl AddAssign<u64> for Round {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Identifier of a committee member, unique within the committee.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct NodeID(u64);

impl NodeID {
    /// Create a new `NodeID` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `NodeID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Public key of the validator that owns the values being agreed on. Decided messages are stored and
/// synced per `ValidatorPk`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ValidatorPk(Vec<u8>);

impl ValidatorPk {
    /// Create a new `ValidatorPk` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner bytes of this `ValidatorPk`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for ValidatorPk {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorPk({:02x?})", &self.0)
    }
}

/// The opaque value an instance agrees on.
#[derive(Clone, PartialEq, Eq, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct Value(Vec<u8>);

impl Value {
    /// Create a new `Value` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner bytes of this `Value`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the SHA256 hash of this `Value`. Used to shorten values in logs and to group votes.
    pub fn hash(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(&self.0);
        CryptoHash::new(hasher.finalize().into())
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.hash())
    }
}

/// 32-byte cryptographic hash. Within this crate these are always SHA256 hashes of [`Value`]s.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[0..4] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Ed25519 digital signature.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({:02x?}..)", &self.0[0..4])
    }
}

/// Number of decided entries requested in one history sync round-trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncRequestLimit(u32);

impl SyncRequestLimit {
    /// Create a new `SyncRequestLimit`. A limit of zero is treated as one.
    pub const fn new(int: u32) -> Self {
        if int == 0 {
            Self(1)
        } else {
            Self(int)
        }
    }

    /// Get the inner `u32` value of this `SyncRequestLimit`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}
