//! Ratekeeper - Request Rate Enforcement for API Gateways
//!
//! This crate implements the rate limiting policy of an API gateway. Each
//! request is mapped to a bucket key and a cost, then admitted or rejected by
//! a GCRA or fixed-window limiter whose state lives either in process memory
//! or in Redis, where an atomic script keeps decisions consistent across
//! gateway instances.

pub mod clock;
pub mod config;
pub mod error;
pub mod extract;
pub mod policy;
pub mod ratelimit;
