// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Payload-generic broadcast bus with delivery accounting.
pub mod bus;
/// The broker event taxonomy.
pub mod events;
/// Thread-safe event counters.
pub mod metrics;
/// Structured trace sink.
pub mod trace;

pub use bus::{Bus, BusStats, BusSubscription, EventBus, EventSubscription};
pub use events::BrokerEvent;
pub use metrics::MetricsCollector;
pub use trace::{JsonLineTracer, RecordingTracer, TraceContext, Tracer};
