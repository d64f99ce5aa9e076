//! Rollout verification for generated machine configuration
//!
//! A generated MachineConfig only takes effect once the machine config
//! operator merges it into a pool's rendered configuration and every node in
//! the pool reboots into it. [`RolloutVerifier`] observes that progress by
//! polling the pool, with a timeout proportional to the pool's size.

#![deny(missing_docs)]

mod client;
mod verifier;

pub use client::{KubePoolClient, PoolClient};
pub use verifier::{
    compute_timeout, Reached, RolloutRequest, RolloutSnapshot, RolloutVerifier, VerifierConfig,
    CONDITION_DEGRADED, CONDITION_UPDATED, CONDITION_UPDATING,
};
