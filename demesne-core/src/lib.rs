//! Distributed expression evaluation for Rust.
//!
//! Demesne coordinates fleets of lightweight virtual machines hosted on
//! *farms* and orchestrated by a *villein* — a client session that
//! allocates farms, scatters work across their VMs and gathers the
//! outcomes. Each VM is a sandboxed evaluation context with its own
//! binding table: jobs submitted to it run in order, and assignments one
//! job makes are visible to the next.
//!
//! Features:
//! - **Typed protocol**: every farm operation is a request variant with a
//!   typed response or [`Fault`](crate::error::Fault) — nothing fails
//!   silently.
//! - **Partial-success coordination**: the [`villein::patterns`] take
//!   whatever the fleet gives them; a refused or silent remote costs one
//!   branch, never the batch.
//! - **Transport agnostic**: farms and villeins meet over the
//!   [`Cloud`](crate::cloud::Cloud) trait. An in-memory implementation is
//!   provided for tests and single-process deployments.
//!
//! # How to use Demesne
//!
//! A computation runs in four movements: allocate farms from the presence
//! feed, scatter VM spawns across them, scatter jobs across the VMs, and
//! gather the outcomes.
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use demesne::{
//!     cloud::InMemoryCloud,
//!     config::Config,
//!     engine::EngineRegistry,
//!     farm::Farm,
//!     villein::{patterns, JobStruct, Villein},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cloud = Arc::new(InMemoryCloud::default());
//!     let _farm = Farm::start(
//!         cloud.clone(),
//!         &Config::default(),
//!         EngineRegistry::with_defaults(),
//!     )
//!     .await?;
//!
//!     let villein = Villein::connect(cloud).await?;
//!     let farms = patterns::allocate_farms(&villein, 1, Duration::from_secs(1)).await;
//!     let vms = patterns::scatter_spawn_vm(&farms, "calc", 1, Duration::from_secs(1)).await;
//!
//!     let outcomes = patterns::scatter_submit_job(
//!         vms.iter().cloned().map(|vm| (vm, JobStruct::new("20 + 52;"))),
//!         Duration::from_secs(5),
//!     )
//!     .await;
//!     for job in outcomes.values() {
//!         assert_eq!(job.result.as_ref().unwrap().to_string(), "72");
//!     }
//!
//!     patterns::scatter_terminate_vm(vms).await;
//!     Ok(())
//! }
//! ```
//!
//! The villein in this example talks to a farm in its own process. Against
//! a real fleet nothing changes but the [`Cloud`](crate::cloud::Cloud)
//! handed to [`Farm::start`](crate::farm::Farm::start) and
//! [`Villein::connect`](crate::villein::Villein::connect).
pub mod binding;
pub mod cloud;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod farm;
pub mod init;
pub mod job;
pub mod packet;
pub mod villein;

pub use async_trait::async_trait;
pub use futures;

use rand::{distributions::Alphanumeric, Rng};

/// Mint a prefixed random identifier, e.g. `job/mRfk3Lq0XAb2`.
pub(crate) fn fresh_token(prefix: &str, len: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    format!("{prefix}/{suffix}")
}
