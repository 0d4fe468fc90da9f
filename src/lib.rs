#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! wsrelay library: reverse HTTP proxy tunneled over pooled WebSocket connections.
//!
//! - `tunnel`: tunnel connection state machine, frame hand-off and pools
//! - `gateway`: agent registration, pool registry, request dispatch, HTTP surface
//! - `agent`: per-target pools, maintenance loops, request execution
//! - `record`: JSON request/response records and the greeting
//! - `config`: configuration loading
//! - `error`: error taxonomy

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;
pub mod record;
pub mod tunnel;

pub use agent::Agent;
pub use config::Config;
pub use error::TunnelError;
pub use gateway::{gateway_router, GatewayState};
