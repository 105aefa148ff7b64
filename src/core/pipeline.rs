//! Live ingestion pipeline.
//!
//! A single consumer owns the aggregator, conditioner and capture controller
//! and handles inbound events one at a time, so per-device frame order is the
//! arrival order. Outbound commands go through the shared [`EventSink`] and
//! never block.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::core::capture::{CaptureController, CaptureError, CaptureRequest};
use crate::core::conditioner::{ConditionerConfig, SignalConditioner};
use crate::core::dynamo::{validate_emission_rate, validate_sampling_rate, ConfigValueError, DynamoConfig};
use crate::core::events::{LiveSample, PipelineEvent};
use crate::stream::aggregator::{AggregatorConfig, DeviceAggregator};
use crate::stream::resolver::{DeviceIdentityResolver, RoleKeyword};
use crate::stream::types::{RawFrame, VirtualDeviceRole};
use crate::telemetry::{Metric, SharedStats};
use crate::transport::{Command, ConnectionState, EventSink, InboundEvent};

/// Observer queue depth.
const OBSERVER_CAPACITY: usize = 10_000;

/// How long [`Pipeline::run`] waits before re-checking the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub aggregator: AggregatorConfig,
    pub conditioner: ConditionerConfig,
    pub role_keywords: Vec<RoleKeyword>,
    /// Capture types that trigger a refresh once stopped
    pub follow_up_capture_types: Vec<String>,
    /// Only forward samples for groups with an active capture
    pub forward_only_while_recording: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            conditioner: ConditionerConfig::default(),
            role_keywords: crate::stream::resolver::default_role_keywords(),
            follow_up_capture_types: vec!["weight".to_string()],
            forward_only_while_recording: false,
        }
    }
}

pub struct Pipeline {
    sink: Arc<dyn EventSink>,
    observer: Sender<PipelineEvent>,
    stats: SharedStats,
    aggregator: DeviceAggregator,
    conditioner: SignalConditioner,
    capture: CaptureController,
    dynamo: DynamoConfig,
    forward_only_while_recording: bool,
}

impl Pipeline {
    /// Build a pipeline and the receiver its observers read from.
    pub fn new(
        config: PipelineConfig,
        sink: Arc<dyn EventSink>,
        stats: SharedStats,
    ) -> Result<(Self, Receiver<PipelineEvent>), ConfigValueError> {
        let conditioner = SignalConditioner::new(config.conditioner)?;
        let resolver = DeviceIdentityResolver::new(&config.role_keywords);
        let (observer, events) = bounded(OBSERVER_CAPACITY);

        let pipeline = Self {
            sink,
            observer,
            stats,
            aggregator: DeviceAggregator::new(config.aggregator, resolver),
            conditioner,
            capture: CaptureController::new(config.follow_up_capture_types),
            dynamo: DynamoConfig::default(),
            forward_only_while_recording: config.forward_only_while_recording,
        };
        Ok((pipeline, events))
    }

    pub fn aggregator(&self) -> &DeviceAggregator {
        &self.aggregator
    }

    pub fn capture(&self) -> &CaptureController {
        &self.capture
    }

    pub fn dynamo_config(&self) -> DynamoConfig {
        self.dynamo
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    /// Consume events until `running` is cleared or the channel closes.
    /// Returns the number of events handled.
    pub fn run(&mut self, inbound: &Receiver<InboundEvent>, running: &AtomicBool) -> u64 {
        let mut handled = 0;
        while running.load(Ordering::SeqCst) {
            match inbound.recv_timeout(POLL_INTERVAL) {
                Ok(event) => {
                    self.handle(event);
                    handled += 1;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        handled
    }

    /// Route one inbound event.
    pub fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Frame(frame) => self.on_frame(frame),
            InboundEvent::Connection(state) => {
                if state == ConnectionState::Connected {
                    // Wake the backend and refresh its view
                    self.sink.emit(Command::GetDynamoConfig);
                    self.sink.emit(Command::GetGroups);
                }
                self.notify(PipelineEvent::Connection(state));
            }
            InboundEvent::Groups(groups) => {
                let removed = self.aggregator.set_groups(&groups);
                for group in &removed {
                    self.capture.remove_group(group);
                }
                debug!("Group list: {} groups, {} removed", groups.len(), removed.len());
                self.notify(PipelineEvent::Groups { groups, removed });
            }
            InboundEvent::DynamoConfigStatus(payload) => match DynamoConfig::from_status(&payload) {
                Some(config) => {
                    if config != self.dynamo {
                        info!(
                            "Backend rates: sampling {} Hz, emission {} Hz",
                            config.sampling_rate, config.emission_rate
                        );
                    }
                    self.dynamo = config;
                    self.notify(PipelineEvent::DynamoConfig(config));
                }
                None => debug!("Ignoring unsuccessful getDynamoConfigStatus: {}", payload),
            },
            InboundEvent::CaptureUpdate(update) => {
                let stale_before = self.capture.stale_events();
                let transition = self.capture.on_update(&update, self.sink.as_ref());
                let stale = self.capture.stale_events() - stale_before;
                if stale > 0 {
                    self.stats.add(Metric::StaleCaptureEvents, stale);
                }
                if let Some(transition) = transition {
                    self.notify(PipelineEvent::Capture(transition));
                }
            }
            InboundEvent::Model(kind, payload) => self.notify(PipelineEvent::Model(kind, payload)),
            InboundEvent::Battery(payload) => self.notify(PipelineEvent::Battery(payload)),
            InboundEvent::Error(payload) => {
                warn!("Backend error: {}", payload);
                self.stats.record(Metric::BackendErrors);
                self.notify(PipelineEvent::BackendError(payload));
            }
        }
    }

    fn on_frame(&mut self, frame: RawFrame) {
        self.stats.record(Metric::FramesIngested);
        let snapshot = self.aggregator.ingest(frame, self.sink.as_ref());

        if snapshot.role == VirtualDeviceRole::Unidentified {
            self.stats.record(Metric::UnresolvedFrames);
        }
        if snapshot.record_gap.is_some() {
            self.stats.record(Metric::RecordGaps);
        }
        if snapshot.refresh_requested {
            self.stats.record(Metric::GroupRefreshRequests);
        }

        let Some(state) = self.aggregator.state_mut(&snapshot.key) else {
            return;
        };
        let sample = self.conditioner.condition(
            snapshot.role,
            snapshot.cop_mm,
            snapshot.fz_n,
            &mut state.smoothing,
        );

        if self.forward_only_while_recording && !self.capture.is_recording(&snapshot.group_id) {
            return;
        }
        self.notify(PipelineEvent::Sample(LiveSample {
            group_id: snapshot.group_id,
            role: snapshot.role,
            device_id: snapshot.frame.device_id.clone(),
            time: snapshot.frame.time,
            record_id: snapshot.frame.record_id,
            data_rate: snapshot.data_rate,
            sample,
        }));
    }

    fn notify(&self, event: PipelineEvent) {
        match self.observer.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("Observer queue full, dropping event");
                self.stats.record(Metric::ObserverEventsDropped);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn reject(&self, err: ConfigValueError) -> ConfigValueError {
        warn!("Rejected config value: {}", err);
        self.stats.record(Metric::RejectedConfigValues);
        err
    }

    fn require(&self, field: &'static str, value: &str) -> Result<String, ConfigValueError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(self.reject(ConfigValueError::Blank { field }));
        }
        Ok(value.to_string())
    }

    /// Validate and send a sampling rate, then re-read the backend's view.
    pub fn set_sampling_rate(&self, rate: i32) -> Result<(), ConfigValueError> {
        let rate = validate_sampling_rate(rate).map_err(|e| self.reject(e))?;
        self.sink.emit(Command::SetSamplingRate(rate));
        self.sink.emit(Command::GetDynamoConfig);
        Ok(())
    }

    pub fn set_emission_rate(&self, rate: i32) -> Result<(), ConfigValueError> {
        let rate = validate_emission_rate(rate).map_err(|e| self.reject(e))?;
        self.sink.emit(Command::SetDataEmissionRate(rate));
        self.sink.emit(Command::GetDynamoConfig);
        Ok(())
    }

    /// Adjust the COP marker scale (px per N).
    pub fn set_marker_scale(&mut self, scale_k: f64) -> Result<(), ConfigValueError> {
        let result = self.conditioner.set_scale(scale_k);
        result.map_err(|e| self.reject(e))
    }

    /// Zero a group's plates.
    pub fn tare(&self, group_id: &str) -> Result<(), ConfigValueError> {
        let group_id = self.require("groupId", group_id)?;
        self.sink.emit(Command::SetReferenceTime(-1));
        self.sink.emit(Command::Tare {
            group_ids: vec![group_id],
        });
        Ok(())
    }

    pub fn refresh_groups(&self) {
        self.sink.emit(Command::GetGroups);
    }

    pub fn start_capture(&mut self, group_id: &str, request: CaptureRequest) -> Result<Uuid, CaptureError> {
        self.capture.start_capture(group_id, request, self.sink.as_ref())
    }

    pub fn stop_capture(&mut self, group_id: &str) -> Result<(), CaptureError> {
        self.capture.stop_capture(group_id, self.sink.as_ref())
    }

    pub fn request_model_metadata(&self, device_id: &str) -> Result<(), ConfigValueError> {
        let device_id = self.require("deviceId", device_id)?;
        self.sink.emit(Command::GetModelMetadata { device_id });
        Ok(())
    }

    pub fn activate_model(&self, device_id: &str, model_id: &str) -> Result<(), ConfigValueError> {
        let device_id = self.require("deviceId", device_id)?;
        let model_id = self.require("modelId", model_id)?;
        self.sink.emit(Command::ActivateModel { device_id, model_id });
        Ok(())
    }

    pub fn deactivate_model(&self, device_id: &str, model_id: &str) -> Result<(), ConfigValueError> {
        let device_id = self.require("deviceId", device_id)?;
        let model_id = self.require("modelId", model_id)?;
        self.sink.emit(Command::DeactivateModel { device_id, model_id });
        Ok(())
    }

    pub fn delete_model(&self, device_id: &str, model_id: &str) -> Result<(), ConfigValueError> {
        let device_id = self.require("deviceId", device_id)?;
        let model_id = self.require("modelId", model_id)?;
        self.sink.emit(Command::DeleteModel { device_id, model_id });
        Ok(())
    }

    pub fn package_model(
        &self,
        force_model_dir: &str,
        moments_model_dir: &str,
        output_dir: &str,
    ) -> Result<(), ConfigValueError> {
        let force_model_dir = self.require("forceModelDir", force_model_dir)?;
        let moments_model_dir = self.require("momentsModelDir", moments_model_dir)?;
        let output_dir = self.require("outputDir", output_dir)?;
        self.sink.emit(Command::PackageModel {
            force_model_dir,
            moments_model_dir,
            output_dir,
        });
        Ok(())
    }

    pub fn load_model(&self, model_dir: &str) -> Result<(), ConfigValueError> {
        let model_dir = self.require("modelDir", model_dir)?;
        self.sink.emit(Command::LoadModel { model_dir });
        Ok(())
    }
}

/// Replay a newline-delimited envelope log through a pipeline.
///
/// Lines that fail to decode are skipped. Returns the number of events
/// handled. Observer events queue up unread, so a log producing more than
/// the observer capacity needs [`replay_lines_draining`].
pub fn replay_lines<'a>(pipeline: &mut Pipeline, lines: impl IntoIterator<Item = &'a str>) -> u64 {
    replay(pipeline, lines, || {})
}

/// Replay a log, handing observer events to `on_event` after every line so
/// the observer queue never fills.
pub fn replay_lines_draining<'a, F>(
    pipeline: &mut Pipeline,
    events: &Receiver<PipelineEvent>,
    lines: impl IntoIterator<Item = &'a str>,
    mut on_event: F,
) -> u64
where
    F: FnMut(PipelineEvent),
{
    replay(pipeline, lines, || events.try_iter().for_each(&mut on_event))
}

fn replay<'a, F>(pipeline: &mut Pipeline, lines: impl IntoIterator<Item = &'a str>, mut after_line: F) -> u64
where
    F: FnMut(),
{
    let mut handled = 0;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match InboundEvent::from_line(line) {
            Ok(Some(event)) => {
                pipeline.handle(event);
                handled += 1;
                after_line();
            }
            Ok(None) => {}
            Err(e) => debug!("Skipping undecodable line: {}", e),
        }
    }
    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::{CapturePhase, CaptureStatus, CaptureUpdate};
    use crate::stream::types::{Point2D, SensorReading, Vec3};
    use crate::telemetry::create_shared_stats;
    use crate::transport::RecordingSink;
    use serde_json::json;

    fn pipeline(config: PipelineConfig) -> (Pipeline, Receiver<PipelineEvent>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let (p, rx) = Pipeline::new(config, sink.clone(), create_shared_stats()).unwrap();
        (p, rx, sink)
    }

    fn frame(device_id: &str, record_id: u32, fz: f64) -> RawFrame {
        RawFrame {
            device_id: device_id.to_string(),
            time: record_id as i64,
            record_id,
            sensors: vec![SensorReading::new("Sum", Vec3::new(0.0, 0.0, fz))],
            cop: Point2D::new(0.1, 0.2),
            ..Default::default()
        }
    }

    fn samples(rx: &Receiver<PipelineEvent>) -> Vec<LiveSample> {
        rx.try_iter()
            .filter_map(|e| match e {
                PipelineEvent::Sample(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connected_wakes_backend() {
        let (mut p, rx, sink) = pipeline(PipelineConfig::default());
        p.handle(InboundEvent::Connection(ConnectionState::Connected));
        assert_eq!(sink.count("getDynamoConfig"), 1);
        assert_eq!(sink.count("getGroups"), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(PipelineEvent::Connection(ConnectionState::Connected))
        ));
    }

    #[test]
    fn test_frames_produce_conditioned_samples() {
        let (mut p, rx, _sink) = pipeline(PipelineConfig::default());
        p.handle(InboundEvent::Frame(frame("g.Launch Zone", 1, -700.0)));
        let out = samples(&rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, VirtualDeviceRole::LaunchZone);
        assert!(out[0].sample.loaded);
        assert_eq!(out[0].sample.fz_n, 700.0);
        let cop = out[0].sample.cop_mm.unwrap();
        assert!((cop.x + 100.0).abs() < 1e-9);
        assert!((cop.y - 200.0).abs() < 1e-9);
        assert_eq!(p.stats().get(Metric::FramesIngested), 1);
    }

    #[test]
    fn test_rate_validation_blocks_emission() {
        let (p, _rx, sink) = pipeline(PipelineConfig::default());
        assert!(p.set_sampling_rate(1201).is_err());
        assert!(p.set_emission_rate(-2).is_err());
        assert!(sink.commands().is_empty());
        assert_eq!(p.stats().get(Metric::RejectedConfigValues), 2);

        p.set_sampling_rate(1000).unwrap();
        assert_eq!(
            sink.commands(),
            vec![Command::SetSamplingRate(1000), Command::GetDynamoConfig]
        );
    }

    #[test]
    fn test_dynamo_mirror_updates_only_on_success() {
        let (mut p, _rx, _sink) = pipeline(PipelineConfig::default());
        p.handle(InboundEvent::DynamoConfigStatus(
            json!({"status": "error", "data": {"samplingRate": 100}}),
        ));
        assert_eq!(p.dynamo_config(), DynamoConfig::default());

        p.handle(InboundEvent::DynamoConfigStatus(
            json!({"status": "success", "data": {"samplingRate": 1000, "emissionRate": 50}}),
        ));
        assert_eq!(p.dynamo_config().sampling_rate, 1000);
        assert_eq!(p.dynamo_config().emission_rate, 50);
    }

    #[test]
    fn test_tare_emits_reference_reset_then_tare() {
        let (p, _rx, sink) = pipeline(PipelineConfig::default());
        assert!(p.tare("  ").is_err());
        p.tare("g1").unwrap();
        assert_eq!(
            sink.commands(),
            vec![
                Command::SetReferenceTime(-1),
                Command::Tare {
                    group_ids: vec!["g1".to_string()]
                }
            ]
        );
    }

    #[test]
    fn test_model_commands_reject_blank_ids() {
        let (p, _rx, sink) = pipeline(PipelineConfig::default());
        assert!(p.activate_model("dev", "").is_err());
        assert!(p.load_model("").is_err());
        p.delete_model("dev", "m1").unwrap();
        p.package_model("/f", "/m", "/out").unwrap();
        assert_eq!(sink.count("deleteModel"), 1);
        assert_eq!(sink.count("packageModel"), 1);
        assert_eq!(sink.commands().len(), 2);
    }

    #[test]
    fn test_recording_gate_holds_samples_until_active() {
        let config = PipelineConfig {
            forward_only_while_recording: true,
            ..Default::default()
        };
        let (mut p, rx, _sink) = pipeline(config);

        p.handle(InboundEvent::Frame(frame("g.Launch Zone", 1, 500.0)));
        assert!(samples(&rx).is_empty());

        p.start_capture(
            "g",
            CaptureRequest {
                capture_type: "simple".to_string(),
                phases: vec![CapturePhase {
                    phase_id: "p1".to_string(),
                    name: None,
                    start_time: None,
                    end_time: None,
                }],
                ..Default::default()
            },
        )
        .unwrap();
        p.handle(InboundEvent::CaptureUpdate(CaptureUpdate {
            group_id: "g".to_string(),
            current_phase_id: Some("p1".to_string()),
            ..Default::default()
        }));
        assert_eq!(
            p.capture().status("g"),
            CaptureStatus::Active {
                phase_id: "p1".to_string()
            }
        );

        p.handle(InboundEvent::Frame(frame("g.Launch Zone", 2, 500.0)));
        assert_eq!(samples(&rx).len(), 1);
    }

    #[test]
    fn test_backend_error_is_surfaced_not_fatal() {
        let (mut p, rx, _sink) = pipeline(PipelineConfig::default());
        p.handle(InboundEvent::Error(json!({"message": "boom"})));
        assert_eq!(p.stats().get(Metric::BackendErrors), 1);
        assert!(matches!(rx.try_recv(), Ok(PipelineEvent::BackendError(_))));
    }

    #[test]
    fn test_replay_skips_bad_lines() {
        let (mut p, rx, _sink) = pipeline(PipelineConfig::default());
        let lines = [
            r#"{"event":"jsonData","data":{"deviceId":"g.Launch Zone","recordId":1}}"#,
            "garbage",
            "",
            r#"{"event":"unknownThing","data":{}}"#,
            r#"{"event":"battery","data":{"level":80}}"#,
        ];
        assert_eq!(replay_lines(&mut p, lines), 2);
        assert_eq!(rx.try_iter().count(), 2);
    }
}
