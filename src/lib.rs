//! # gsmbridge - USB GSM modem fleet bridge
//!
//! gsmbridge discovers USB-attached GSM modems, reads SIM and network telemetry from them
//! over AT commands, queries prepaid balances over USSD and retrieves SMS on request. All
//! results land in an embedded device registry keyed by ICCID.
//!
//! ## Features
//!
//! - **Discovery**: periodic enumeration of host serial ports, readiness probe
//!   (`AT`, `AT+CPIN?`) before a port is tracked, eviction when a port vanishes.
//! - **Telemetry**: fixed AT battery per tracked port (registration, operator, ICCID,
//!   signal, network info, IMSI) with per-command timings.
//! - **Identity guard**: a port's ICCID is rechecked before balance or SMS work, and a
//!   swapped SIM releases the stale binding.
//! - **Balance**: USSD balance query for SIMs whose balance is missing or stale.
//! - **SMS**: text-mode listing, alphanumeric sender decoding, idempotent storage.
//! - **Supervised loops**: failures are contained per iteration; graceful shutdown.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gsmbridge::config::Config;
//! use gsmbridge::fleet::Bridge;
//! use gsmbridge::modem::mock::MockModem;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let bridge = Bridge::open(config, Arc::new(MockModem::new()))?;
//!     bridge.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`modem`] - AT channel, serial link providers and response decoders
//! - [`fleet`] - port registry, background loops, identity guard and request gateway
//! - [`storage`] - SIM and SMS records, sled-backed registry
//! - [`config`] - configuration loading and validation
//! - [`retry`] - bounded retry policies shared by channel, store and loops
//! - [`metrics`] - process-wide exchange and fleet counters
//! - [`logutil`] - single-line rendering of raw modem traffic
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  Discovery / Telemetry /     │ ← supervised loops, SMS on request
//! │  Balance / SMS retriever     │
//! └──────────────────────────────┘
//!          │               │
//! ┌────────────────┐ ┌────────────────┐
//! │  AT channel    │ │  Registry      │
//! │  (per-port     │ │  (sled, retry) │
//! │   lock)        │ │                │
//! └────────────────┘ └────────────────┘
//!          │
//! ┌────────────────┐
//! │  Serial link   │ ← serialport or scripted mock
//! └────────────────┘
//! ```

pub mod config;
pub mod fleet;
pub mod logutil;
pub mod metrics;
pub mod modem;
pub mod retry;
pub mod storage;
