/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the crate.
//!
//! Types specific to a single component can be found in that component's module, e.g.,
//! [`crate::instance::types`].

pub mod committee;

pub mod crypto_primitives;

pub mod data_types;
