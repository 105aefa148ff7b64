//! Core processing for the live stream.
//!
//! This module contains:
//! - Unit and temperature scaling shared with the gain engine
//! - The signal conditioner (noise gate, EWMA, marker radius)
//! - The capture session state machine
//! - The backend rate mirror and validators
//! - The pipeline that routes inbound events through all of the above

pub mod capture;
pub mod conditioner;
pub mod dynamo;
pub mod events;
pub mod pipeline;
pub mod scaling;

// Re-export commonly used types
pub use capture::{
    transition, CaptureController, CaptureError, CapturePhase, CaptureRequest, CaptureSession,
    CaptureStatus, CaptureTransition, CaptureUpdate, Transition,
};
pub use conditioner::{
    ewma, ConditionedSample, ConditionerConfig, RadiusMapping, SignalConditioner, SmoothingState,
};
pub use dynamo::{validate_emission_rate, validate_sampling_rate, ConfigValueError, DynamoConfig};
pub use events::{LiveSample, PipelineEvent};
pub use pipeline::{replay_lines, replay_lines_draining, Pipeline, PipelineConfig};
pub use scaling::{cop_to_display_mm, pct_change, vertical_force, SENSOR_LAYOUT};
