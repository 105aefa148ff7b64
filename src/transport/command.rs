//! Outbound control vocabulary.
//!
//! Every command is fire-and-forget: [`EventSink::emit`] returns nothing and
//! whether a command took effect is only ever observed through later inbound
//! status events.

use serde_json::{json, Value};
use std::sync::Mutex;

use crate::transport::envelope::Envelope;

/// A control event sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetGroups,
    GetDynamoConfig,
    SetSamplingRate(i32),
    SetDataEmissionRate(i32),
    StartCapture {
        group_id: String,
        capture_type: String,
        capture_name: Option<String>,
        tags: Vec<String>,
    },
    StopCapture {
        group_id: String,
    },
    SetReferenceTime(i64),
    Tare {
        group_ids: Vec<String>,
    },
    GetModelMetadata {
        device_id: String,
    },
    ActivateModel {
        device_id: String,
        model_id: String,
    },
    DeactivateModel {
        device_id: String,
        model_id: String,
    },
    DeleteModel {
        device_id: String,
        model_id: String,
    },
    PackageModel {
        force_model_dir: String,
        moments_model_dir: String,
        output_dir: String,
    },
    LoadModel {
        model_dir: String,
    },
}

impl Command {
    /// Wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Command::GetGroups => "getGroups",
            Command::GetDynamoConfig => "getDynamoConfig",
            Command::SetSamplingRate(_) => "setSamplingRate",
            Command::SetDataEmissionRate(_) => "setDataEmissionRate",
            Command::StartCapture { .. } => "startCapture",
            Command::StopCapture { .. } => "stopCapture",
            Command::SetReferenceTime(_) => "setReferenceTime",
            Command::Tare { .. } => "tare",
            Command::GetModelMetadata { .. } => "getModelMetadata",
            Command::ActivateModel { .. } => "activateModel",
            Command::DeactivateModel { .. } => "deactivateModel",
            Command::DeleteModel { .. } => "deleteModel",
            Command::PackageModel { .. } => "packageModel",
            Command::LoadModel { .. } => "loadModel",
        }
    }

    fn payload(&self) -> Value {
        match self {
            Command::GetGroups | Command::GetDynamoConfig => Value::Null,
            Command::SetSamplingRate(rate) | Command::SetDataEmissionRate(rate) => json!(rate),
            Command::StartCapture {
                group_id,
                capture_type,
                capture_name,
                tags,
            } => {
                let mut payload = json!({
                    "groupId": group_id,
                    "captureType": capture_type,
                    "captureConfiguration": capture_type,
                    "tags": tags,
                });
                if let Some(name) = capture_name {
                    payload["captureName"] = json!(name);
                }
                payload
            }
            Command::StopCapture { group_id } => json!({ "groupId": group_id }),
            Command::SetReferenceTime(t) => json!(t),
            Command::Tare { group_ids } => json!(group_ids),
            Command::GetModelMetadata { device_id } => json!({ "deviceId": device_id }),
            Command::ActivateModel {
                device_id,
                model_id,
            }
            | Command::DeactivateModel {
                device_id,
                model_id,
            }
            | Command::DeleteModel {
                device_id,
                model_id,
            } => json!({ "deviceId": device_id, "modelId": model_id }),
            Command::PackageModel {
                force_model_dir,
                moments_model_dir,
                output_dir,
            } => json!({
                "forceModelDir": force_model_dir,
                "momentsModelDir": moments_model_dir,
                "outputDir": output_dir,
            }),
            Command::LoadModel { model_dir } => json!({ "modelDir": model_dir }),
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.event_name(), self.payload())
    }
}

/// One-way outbound emission.
///
/// Implementations must not block the caller; they are invoked from the
/// ingestion thread and from UI-driven threads alike.
pub trait EventSink: Send + Sync {
    fn emit(&self, command: Command);
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _command: Command) {}
}

/// Sink that keeps every command in memory, for offline replays.
#[derive(Debug, Default)]
pub struct RecordingSink {
    commands: Mutex<Vec<Command>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands emitted so far, oldest first.
    pub fn commands(&self) -> Vec<Command> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Number of emitted commands with the given event name.
    pub fn count(&self, event_name: &str) -> usize {
        self.commands
            .lock()
            .map(|c| c.iter().filter(|cmd| cmd.event_name() == event_name).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.clear();
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, command: Command) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_capture_payload() {
        let cmd = Command::StartCapture {
            group_id: "g1".to_string(),
            capture_type: "weight".to_string(),
            capture_name: Some("morning".to_string()),
            tags: vec!["warmup".to_string()],
        };
        let env = cmd.to_envelope();
        assert_eq!(env.event, "startCapture");
        assert_eq!(env.data["groupId"], "g1");
        assert_eq!(env.data["captureType"], "weight");
        assert_eq!(env.data["captureName"], "morning");
        assert_eq!(env.data["tags"][0], "warmup");
    }

    #[test]
    fn test_optional_capture_name_omitted() {
        let cmd = Command::StartCapture {
            group_id: "g1".to_string(),
            capture_type: "simple".to_string(),
            capture_name: None,
            tags: vec![],
        };
        assert!(cmd.to_envelope().data.get("captureName").is_none());
    }

    #[test]
    fn test_scalar_and_list_payloads() {
        assert_eq!(Command::SetSamplingRate(1000).to_envelope().data, json!(1000));
        assert_eq!(Command::SetReferenceTime(-1).to_envelope().data, json!(-1));
        assert_eq!(
            Command::Tare {
                group_ids: vec!["g1".to_string()]
            }
            .to_envelope()
            .data,
            json!(["g1"])
        );
        assert_eq!(Command::GetGroups.to_envelope().data, Value::Null);
    }

    #[test]
    fn test_recording_sink_counts_by_name() {
        let sink = RecordingSink::new();
        sink.emit(Command::GetGroups);
        sink.emit(Command::GetDynamoConfig);
        sink.emit(Command::GetGroups);
        assert_eq!(sink.count("getGroups"), 2);
        assert_eq!(sink.commands().len(), 3);
        sink.clear();
        assert!(sink.commands().is_empty());
    }
}
