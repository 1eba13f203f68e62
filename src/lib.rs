//! Beacon - geofenced emergency alert fanout.
//!
//! # Overview
//!
//! Beacon turns one SOS event into a bounded, partial-failure-tolerant
//! notification fanout: the validated event is broadcast to live map
//! observers and pushed to registered devices within 500 m, with per-alert
//! delivery accounting. The two branches run concurrently and fail
//! independently: a dead broadcast channel never delays a push, and a
//! down geodata store never blocks the broadcast.
//!
//! # Modules
//!
//! - [`model`]: Event, candidate, and report types; the payload validation gate
//! - [`error`]: The pipeline error taxonomy
//! - [`storage`]: SQLite device registry and reputation ledger
//! - [`geo`]: Geospatial neighbor resolution (haversine over a bounding box)
//! - [`broadcast`]: Fire-and-forget realtime publisher for live observers
//! - [`push`]: Batched multicast push dispatch and delivery accounting
//! - [`pipeline`]: Two-branch fanout orchestration
//! - [`identity`]: Reputation-ranked, time-boxed identity tokens
//! - [`api`]: HTTP API handlers

pub mod api;
pub mod broadcast;
pub mod error;
pub mod geo;
pub mod identity;
pub mod model;
pub mod pipeline;
pub mod push;
pub mod storage;
