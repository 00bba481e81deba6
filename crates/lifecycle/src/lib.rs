//! Lifecycle orchestration for per-pull-request preview environments.
//!
//! [`Manager`] exposes `create`, `update` and `delete`. Each runs under the
//! pull request's preemptive lock from the `locker` crate, so operations on
//! one pull request are serialized and a newer request aborts an older one.
//!
//! # Architecture
//!
//! - [`manager`] drives the state machine: config resolution, chart
//!   fetch, global limit enforcement, install or upgrade, and reporting
//! - [`persistence`], [`repo`], [`metadata`], [`installer`],
//!   [`notifications`], [`namegen`] and [`metrics`] are the collaborator
//!   seams, each with an in-process implementation where one is useful
//! - [`context`] carries cancellation and its reason through an operation
//!
//! Environment status moves `Spawned` to `Success` or `Failure`, and to
//! `Destroyed` on delete. An operation that is preempted, times out or is
//! cancelled by its caller leaves the environment `Cancelled`.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod commit_status;
pub mod config;
pub mod context;
pub mod error;
pub mod installer;
pub mod manager;
pub mod metadata;
pub mod metrics;
pub mod models;
pub mod namegen;
pub mod notifications;
pub mod persistence;
pub mod repo;

pub use config::ManagerConfig;
pub use context::{CancelReason, OpContext};
pub use error::{LifecycleError, StepContext};
pub use manager::{Collaborators, Manager};
pub use models::{DestroyReason, Environment, EnvironmentStatus, RepoRevisionData};
pub use persistence::{DataLayer, MemoryDataLayer};
