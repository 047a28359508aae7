//! Tollgate - Admission Control for HTTP Services
//!
//! This crate gates inbound HTTP requests with a per-client, per-endpoint-class
//! sliding-window rate limiter. Clients that keep hammering a limit past a
//! multiple of it are blocked outright for a fixed period. State lives either
//! in process or in a shared Redis store, and a failing store never takes the
//! service down with it: requests are let through instead.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
