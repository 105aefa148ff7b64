//! FluxLite core - force-plate stream ingestion and gain analysis.
//!
//! This library consumes the frame stream of a force-plate backend, tags
//! every frame with the virtual device it belongs to, conditions it for
//! display and tracks capture sessions. An offline engine reuses the same
//! scaling math to measure how a calibration coefficient propagates through
//! the backend's model.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          FluxLite Core                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌───────────┐   ┌────────────┐   ┌───────────┐  │
//! │  │ Transport │──▶│ Resolver  │──▶│ Aggregator │──▶│Conditioner│  │
//! │  │(socket.io)│   │  (roles)  │   │ (history)  │   │  (EWMA)   │  │
//! │  └───────────┘   └───────────┘   └────────────┘   └───────────┘  │
//! │        ▲                                                │        │
//! │        │ commands        ┌─────────────┐                ▼        │
//! │        └─────────────────│   Capture   │────────▶  observers     │
//! │                          │ controller  │                         │
//! │                          └─────────────┘                         │
//! │                                                                  │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐   │
//! │  │ Archives │──▶│ Scaling  │──▶│  Gain    │──▶│ Summary CSVs │   │
//! │  └──────────┘   └──────────┘   └──────────┘   └──────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fluxlite_core::{core::Pipeline, telemetry, transport::NullSink, Config};
//!
//! let config = Config::default();
//! let stats = telemetry::create_shared_stats();
//! let (mut pipeline, events) =
//!     Pipeline::new(config.pipeline, Arc::new(NullSink), stats).expect("valid config");
//!
//! let line = r#"{"event":"jsonData","data":{"deviceId":"g1.Launch Zone","time":0,"recordId":1,"sensors":[]}}"#;
//! fluxlite_core::core::replay_lines(&mut pipeline, [line]);
//! while let Ok(event) = events.try_recv() {
//!     println!("{event:?}");
//! }
//! ```

pub mod config;
pub mod core;
pub mod gain;
pub mod stream;
pub mod telemetry;
pub mod transport;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, GainSettings};
pub use crate::core::{CaptureController, ConditionedSample, Pipeline, PipelineConfig, PipelineEvent, SignalConditioner};
pub use gain::{CoefSweep, GainError, GainRunConfig, GainRunner};
pub use stream::{DeviceAggregator, DeviceIdentityResolver, RawFrame, VirtualDeviceRole};
pub use telemetry::{Metric, SharedStats, Stats};
pub use transport::{Command, ConnectionConfig, ConnectionState, EventSink, InboundEvent, TransportSession};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
