/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Cluster placement and power-management policy engine.
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── types       – ids, CPU/VM/SLA enums, power states, descriptors
//! ├── error       – backend, engine, placement and invariant errors
//! ├── config/     – EngineConfig + strategy selection (YAML)
//! ├── backend/    – ClusterBackend trait + in-memory MemoryCluster
//! ├── tracker     – Cluster State Tracker
//! ├── deferral    – Admission & Deferral Queue
//! ├── power       – wake book, idle consolidation, PowerPolicy
//! ├── placement/  – PlacementPolicy, strategy table, decide()
//! ├── offload     – origin / victim selection
//! ├── engine/     – ClusterContext + Scheduler event handlers
//! └── sim/        – scenario files + discrete-event replay driver
//! ```

pub mod backend;
pub mod config;
pub mod deferral;
pub mod engine;
pub mod error;
pub mod offload;
pub mod placement;
pub mod power;
pub mod sim;
pub mod tracker;
pub mod types;
