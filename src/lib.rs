//! Tollgate - Distributed Coordination for HTTP Services
//!
//! This crate provides two coordination primitives that share an external
//! atomic key-value store: a sliding-window rate limiter with per-route
//! policy resolution for axum services, and a locking task executor that
//! guarantees at most one node runs a named task at a time.
//!
//! The limiter interpolates between two fixed counter windows, so a burst at
//! a window boundary cannot double the admitted rate. The executor follows
//! ShedLock-style semantics with `lock_at_most_for` and `lock_at_least_for`
//! bounds. Both ship with in-memory backends for single-node deployments and
//! tests, and Redis backends for fleets.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod locking;
pub mod ratelimit;
pub mod redis;
