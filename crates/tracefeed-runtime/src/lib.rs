#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod assembler;
pub mod coordinator;
pub mod learner;
pub mod observer;
pub mod pool;
pub mod selector;
pub mod shard;
pub mod synthetic;
pub mod training;
