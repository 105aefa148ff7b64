//! Observer-facing events emitted by the live pipeline.

use serde::Serialize;
use serde_json::Value;

use crate::core::capture::CaptureTransition;
use crate::core::conditioner::ConditionedSample;
use crate::core::dynamo::DynamoConfig;
use crate::stream::groups::GroupInfo;
use crate::stream::types::VirtualDeviceRole;
use crate::transport::{ConnectionState, ModelStatusKind};

/// One display-ready sample with its stream context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveSample {
    pub group_id: String,
    pub role: VirtualDeviceRole,
    pub device_id: String,
    pub time: i64,
    pub record_id: u32,
    pub data_rate: Option<f64>,
    pub sample: ConditionedSample,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Sample(LiveSample),
    Connection(ConnectionState),
    DynamoConfig(DynamoConfig),
    Capture(CaptureTransition),
    Groups {
        groups: Vec<GroupInfo>,
        /// Groups that disappeared since the previous list
        removed: Vec<String>,
    },
    Model(ModelStatusKind, Value),
    Battery(Value),
    /// Explicit backend `error` event; not a connection failure
    BackendError(Value),
}
