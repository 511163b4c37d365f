/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared across the sub-protocols: inert newtypes, the replica status
//! enum, the validator set, and the chained block.

pub mod basic;

pub mod block;

pub use basic::*;
pub use block::*;
