//! Capture → detect → stream pipeline behind the camera server binary.
//!
//! The module is split into focused submodules:
//! - `config`: layered configuration and validation.
//! - `pipeline`: startup, lifecycle and shutdown of every component.
//! - `capture`: camera read loop with retry and reopen policy.
//! - `inference`: detector scheduling and result publication.
//! - `encoding`: JPEG encode and multipart framing.
//! - `annotation`: drawing primitives for boxes, labels and overlays.
//! - `server`: Actix Web endpoints.
//! - `watchdog`: camera staleness and Serving/Degraded evaluation.
//! - `health`: lifecycle state and health flags.
//! - `data`: shared slots passed between stages.

/// Re-export configuration so callers can build a run without reaching into
/// submodules.
pub use config::{ServerConfig, TelemetryOptions};
/// Launch the camera server with a resolved configuration.
pub use pipeline::run;

mod annotation;
mod capture;
mod config;
mod data;
mod encoding;
mod health;
mod inference;
mod pipeline;
mod server;
pub(crate) mod telemetry;
mod watchdog;
