/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared by the coordinator, the minter and the persistence layer.

pub mod address;

pub mod block;

pub mod crypto_primitives;

pub mod data_types;

pub mod encoding;
