//! Device Aggregator: one [`DeviceState`] per (group, role).
//!
//! Ingestion is synchronous; the snapshot for a frame is returned from the
//! same call that stored it, so per-device order is preserved. Record-id
//! continuity and the data rate are tracked per physical plate, since the
//! plates merged into one virtual device keep independent counters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::conditioner::{ewma, SmoothingState};
use crate::core::scaling::{cop_to_display_mm, vertical_force_magnitude};
use crate::stream::groups::GroupInfo;
use crate::stream::history::FrameHistory;
use crate::stream::resolver::DeviceIdentityResolver;
use crate::stream::types::{Point2D, RawFrame, VirtualDeviceRole};
use crate::transport::{Command, EventSink};

/// Record-id jumps at or beyond this are treated as a counter reset.
const RECORD_GAP_LIMIT: u32 = 1 << 31;

/// Decay for the derived data-rate estimate.
const DATA_RATE_ALPHA: f64 = 0.2;

/// Aggregator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Frames retained per device
    pub cache_size: usize,
    /// Minimum spacing between refresh requests for the same group (ms)
    pub refresh_cooldown_ms: u64,
    /// A plate silent for longer than this stops contributing (ms)
    pub member_stale_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cache_size: 512,
            refresh_cooldown_ms: 2_000,
            member_stale_ms: 1_000,
        }
    }
}

/// Identity of one [`DeviceState`].
///
/// Plates that resolve to a role are merged under it. Unidentified plates
/// are never merged, so their key carries the device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub group_id: String,
    pub role: VirtualDeviceRole,
    pub device_id: Option<String>,
}

impl DeviceKey {
    pub fn merged(group_id: impl Into<String>, role: VirtualDeviceRole) -> Self {
        Self {
            group_id: group_id.into(),
            role,
            device_id: None,
        }
    }

    pub fn unidentified(group_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            role: VirtualDeviceRole::Unidentified,
            device_id: Some(device_id.into()),
        }
    }

    fn for_frame(group_id: &str, role: VirtualDeviceRole, device_id: &str) -> Self {
        match role {
            VirtualDeviceRole::Unidentified => Self::unidentified(group_id, device_id),
            _ => Self::merged(group_id, role),
        }
    }
}

/// Latest reading of one physical plate contributing to a virtual device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemberReading {
    /// |Fz| (N)
    pub fz_n: f64,
    /// Device-local COP (m)
    pub cop_m: Point2D,
    pub time: i64,
    pub record_id: u32,
    /// This plate's frame rate (Hz)
    pub data_rate: Option<f64>,
    /// Local arrival time, for staleness
    pub seen_at: Instant,
}

impl MemberReading {
    fn from_frame(frame: &RawFrame, previous: Option<&MemberReading>, now: Instant) -> Self {
        Self {
            fz_n: vertical_force_magnitude(&frame.sensors),
            cop_m: frame.cop,
            time: frame.time,
            record_id: frame.record_id,
            data_rate: observe_rate(previous, frame),
            seen_at: now,
        }
    }
}

/// Missing records between two consecutive frames of one plate.
fn record_gap(previous: u32, record_id: u32) -> Option<u32> {
    let missing = record_id.wrapping_sub(previous).wrapping_sub(1);
    (missing > 0 && missing < RECORD_GAP_LIMIT).then_some(missing)
}

/// The frame's reported rate, else an EWMA of the timestamp spacing.
fn observe_rate(previous: Option<&MemberReading>, frame: &RawFrame) -> Option<f64> {
    if let Some(rate) = frame.data_rate.filter(|r| r.is_finite() && *r > 0.0) {
        return Some(rate);
    }
    let previous = previous?;
    let dt_ms = frame.time - previous.time;
    if dt_ms <= 0 {
        return previous.data_rate;
    }
    let instantaneous = 1000.0 / dt_ms as f64;
    Some(ewma(previous.data_rate, instantaneous, DATA_RATE_ALPHA))
}

/// Live state for one (group, role) pair, or one unidentified plate.
#[derive(Debug)]
pub struct DeviceState {
    pub key: DeviceKey,
    pub history: FrameHistory,
    pub smoothing: SmoothingState,
    /// Keyed by device id
    pub members: BTreeMap<String, MemberReading>,
    /// Rate of the most recently seen plate
    pub data_rate: Option<f64>,
    pub frames_seen: u64,
}

impl DeviceState {
    fn new(key: DeviceKey, capacity: usize) -> Self {
        Self {
            key,
            history: FrameHistory::with_capacity(capacity),
            smoothing: SmoothingState::default(),
            members: BTreeMap::new(),
            data_rate: None,
            frames_seen: 0,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.key.group_id
    }

    pub fn role(&self) -> VirtualDeviceRole {
        self.key.role
    }

    /// Aggregated |Fz| and |Fz|-weighted COP (device-local metres).
    pub fn aggregate(&self) -> (f64, Point2D) {
        let n = self.members.len();
        if n == 0 {
            return (0.0, Point2D::default());
        }
        let total: f64 = self.members.values().map(|m| m.fz_n).sum();
        let cop = if total > 0.0 {
            let (x, y) = self
                .members
                .values()
                .fold((0.0, 0.0), |(x, y), m| (x + m.cop_m.x * m.fz_n, y + m.cop_m.y * m.fz_n));
            Point2D::new(x / total, y / total)
        } else {
            let (x, y) = self
                .members
                .values()
                .fold((0.0, 0.0), |(x, y), m| (x + m.cop_m.x, y + m.cop_m.y));
            Point2D::new(x / n as f64, y / n as f64)
        };
        (total, cop)
    }

    /// Drop plates not heard from within `stale`, keeping `current`.
    fn evict_stale(&mut self, current: &str, now: Instant, stale: Duration) {
        let before = self.members.len();
        self.members
            .retain(|id, m| id == current || now.saturating_duration_since(m.seen_at) <= stale);
        let evicted = before - self.members.len();
        if evicted > 0 {
            debug!("Evicted {} silent plates from {:?}", evicted, self.key);
        }
    }
}

/// Current view of a device after one ingest.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub key: DeviceKey,
    pub group_id: String,
    pub role: VirtualDeviceRole,
    pub frame: Arc<RawFrame>,
    /// Aggregated |Fz| (N)
    pub fz_n: f64,
    /// Aggregated COP in display millimetres
    pub cop_mm: Point2D,
    /// Rate of the plate that sent this frame
    pub data_rate: Option<f64>,
    pub history_len: usize,
    /// Records skipped since this plate's previous frame, if any
    pub record_gap: Option<u32>,
    /// Whether this frame triggered a group-list refresh
    pub refresh_requested: bool,
}

/// Owner of all [`DeviceState`]s.
#[derive(Debug)]
pub struct DeviceAggregator {
    config: AggregatorConfig,
    resolver: DeviceIdentityResolver,
    devices: HashMap<DeviceKey, DeviceState>,
    known_groups: HashSet<String>,
    last_refresh: HashMap<String, Instant>,
    logged_unresolved: HashSet<String>,
    unresolved_frames: u64,
    refresh_requests: u64,
    record_gaps: u64,
}

impl DeviceAggregator {
    pub fn new(config: AggregatorConfig, resolver: DeviceIdentityResolver) -> Self {
        Self {
            config,
            resolver,
            devices: HashMap::new(),
            known_groups: HashSet::new(),
            last_refresh: HashMap::new(),
            logged_unresolved: HashSet::new(),
            unresolved_frames: 0,
            refresh_requests: 0,
            record_gaps: 0,
        }
    }

    pub fn ingest(&mut self, frame: RawFrame, sink: &dyn EventSink) -> FrameSnapshot {
        self.ingest_at(frame, Instant::now(), sink)
    }

    /// Ingest with an explicit clock, for the refresh cooldown and plate
    /// staleness.
    pub fn ingest_at(&mut self, frame: RawFrame, now: Instant, sink: &dyn EventSink) -> FrameSnapshot {
        let role = self.resolver.resolve(&frame.device_id);
        if role == VirtualDeviceRole::Unidentified {
            self.unresolved_frames += 1;
            if self.logged_unresolved.insert(frame.device_id.clone()) {
                debug!("Unresolved device identity {:?}", frame.device_id);
            }
        }

        let group_id = frame.group_key();
        let refresh_requested = self.maybe_request_refresh(&group_id, now, sink);

        let capacity = self.config.cache_size;
        let key = DeviceKey::for_frame(&group_id, role, &frame.device_id);
        let state = self.devices.entry(key.clone()).or_insert_with(|| {
            debug!("New device state {:?}", key);
            DeviceState::new(key.clone(), capacity)
        });

        let previous = state.members.get(&frame.device_id).copied();
        let record_gap = previous.and_then(|p| record_gap(p.record_id, frame.record_id));
        if record_gap.is_some() {
            self.record_gaps += 1;
        }
        let member = MemberReading::from_frame(&frame, previous.as_ref(), now);
        state.data_rate = member.data_rate;
        state.frames_seen += 1;
        state.members.insert(frame.device_id.clone(), member);
        state.evict_stale(
            &frame.device_id,
            now,
            Duration::from_millis(self.config.member_stale_ms),
        );

        let frame = Arc::new(frame);
        state.history.push(Arc::clone(&frame));

        let (fz_n, cop_m) = state.aggregate();
        FrameSnapshot {
            key,
            group_id,
            role,
            frame,
            fz_n,
            cop_mm: cop_to_display_mm(cop_m, role),
            data_rate: member.data_rate,
            history_len: state.history.len(),
            record_gap,
            refresh_requested,
        }
    }

    fn maybe_request_refresh(&mut self, group_id: &str, now: Instant, sink: &dyn EventSink) -> bool {
        if group_id.is_empty() || self.known_groups.contains(group_id) {
            return false;
        }
        let cooldown = Duration::from_millis(self.config.refresh_cooldown_ms);
        if let Some(last) = self.last_refresh.get(group_id) {
            if now.saturating_duration_since(*last) < cooldown {
                return false;
            }
        }
        self.last_refresh.insert(group_id.to_string(), now);
        self.refresh_requests += 1;
        info!("Frame for unknown group {:?}; requesting group list", group_id);
        sink.emit(Command::GetGroups);
        true
    }

    /// Replace the known group set. Returns ids of groups that disappeared
    /// and whose device states were dropped.
    pub fn set_groups(&mut self, groups: &[GroupInfo]) -> Vec<String> {
        let next: HashSet<String> = groups.iter().map(|g| g.id.clone()).collect();
        let mut removed: Vec<String> = self
            .known_groups
            .difference(&next)
            .cloned()
            .collect();
        removed.sort();
        for group in &removed {
            self.remove_group(group);
        }
        for group in &next {
            self.last_refresh.remove(group);
        }
        self.known_groups = next;
        removed
    }

    /// Drop every device state belonging to `group_id`.
    pub fn remove_group(&mut self, group_id: &str) -> usize {
        let before = self.devices.len();
        self.devices.retain(|key, _| key.group_id != group_id);
        self.known_groups.remove(group_id);
        self.last_refresh.remove(group_id);
        let removed = before - self.devices.len();
        if removed > 0 {
            info!("Removed {} device states for group {:?}", removed, group_id);
        }
        removed
    }

    pub fn is_known_group(&self, group_id: &str) -> bool {
        self.known_groups.contains(group_id)
    }

    /// State of a merged (identified) role.
    pub fn device(&self, group_id: &str, role: VirtualDeviceRole) -> Option<&DeviceState> {
        self.devices.get(&DeviceKey::merged(group_id, role))
    }

    pub fn state(&self, key: &DeviceKey) -> Option<&DeviceState> {
        self.devices.get(key)
    }

    pub fn state_mut(&mut self, key: &DeviceKey) -> Option<&mut DeviceState> {
        self.devices.get_mut(key)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn unresolved_frames(&self) -> u64 {
        self.unresolved_frames
    }

    pub fn refresh_requests(&self) -> u64 {
        self.refresh_requests
    }

    pub fn record_gaps(&self) -> u64 {
        self.record_gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::{SensorReading, Vec3};
    use crate::transport::RecordingSink;

    fn frame(device_id: &str, record_id: u32, fz: f64) -> RawFrame {
        RawFrame {
            device_id: device_id.to_string(),
            time: record_id as i64 * 10,
            record_id,
            sensors: vec![SensorReading::new("Sum", Vec3::new(0.0, 0.0, -fz))],
            cop: Point2D::new(0.01, 0.02),
            ..Default::default()
        }
    }

    fn aggregator(cache_size: usize) -> DeviceAggregator {
        DeviceAggregator::new(
            AggregatorConfig {
                cache_size,
                ..AggregatorConfig::default()
            },
            DeviceIdentityResolver::default(),
        )
    }

    #[test]
    fn test_one_state_per_group_and_role() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        agg.ingest(frame("g1.Launch Zone", 1, 100.0), &sink);
        agg.ingest(frame("g1.launch_zone", 2, 100.0), &sink);
        agg.ingest(frame("g1.Landing Zone", 1, 100.0), &sink);
        agg.ingest(frame("g2.Launch Zone", 1, 100.0), &sink);
        assert_eq!(agg.device_count(), 3);
        assert_eq!(
            agg.device("g1", VirtualDeviceRole::LaunchZone).map(|d| d.history.len()),
            Some(2)
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(4);
        for i in 1..=20 {
            let snap = agg.ingest(frame("g.Launch Zone", i, 50.0), &sink);
            assert!(snap.history_len <= 4);
        }
        let state = agg.device("g", VirtualDeviceRole::LaunchZone).unwrap();
        let ids: Vec<u32> = state.history.iter().map(|f| f.record_id).collect();
        assert_eq!(ids, vec![17, 18, 19, 20]);
    }

    #[test]
    fn test_refresh_is_rate_limited_per_group() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        let t0 = Instant::now();
        for i in 0..3 {
            agg.ingest_at(frame("g.Launch Zone", i, 10.0), t0 + Duration::from_millis(i as u64 * 100), &sink);
        }
        assert_eq!(sink.count("getGroups"), 1);

        agg.ingest_at(frame("g.Launch Zone", 4, 10.0), t0 + Duration::from_secs(3), &sink);
        assert_eq!(sink.count("getGroups"), 2);

        agg.set_groups(&[GroupInfo {
            id: "g".to_string(),
            name: None,
        }]);
        agg.ingest_at(frame("g.Launch Zone", 5, 10.0), t0 + Duration::from_secs(10), &sink);
        assert_eq!(sink.count("getGroups"), 2);
        assert_eq!(agg.refresh_requests(), 2);
    }

    #[test]
    fn test_unidentified_frames_are_kept_and_counted() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        let snap = agg.ingest(frame("g.Side Plate", 1, 10.0), &sink);
        assert_eq!(snap.role, VirtualDeviceRole::Unidentified);
        assert_eq!(agg.unresolved_frames(), 1);
        assert!(agg.state(&DeviceKey::unidentified("g", "g.Side Plate")).is_some());
    }

    #[test]
    fn test_unidentified_plates_stay_separate() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        agg.ingest(frame("g.Side Plate", 1, 100.0), &sink);
        let snap = agg.ingest(frame("g.Back Plate", 1, 40.0), &sink);
        assert!((snap.fz_n - 40.0).abs() < 1e-9);
        assert_eq!(agg.device_count(), 2);
        assert!(agg.device("g", VirtualDeviceRole::Unidentified).is_none());
    }

    #[test]
    fn test_merged_plates_track_sequence_and_rate_separately() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(64);
        let t0 = Instant::now();
        let mut last = None;
        for i in 1..=10u32 {
            for name in ["g.Landing Zone Upper", "g.Landing Zone Lower"] {
                let now = t0 + Duration::from_millis(i as u64 * 10);
                last = Some(agg.ingest_at(frame(name, i, 100.0), now, &sink));
            }
        }
        let snap = last.unwrap();
        assert_eq!(snap.role, VirtualDeviceRole::LandingZoneAggregate);
        assert_eq!(agg.record_gaps(), 0);
        assert!((snap.data_rate.unwrap() - 100.0).abs() < 1e-9);
        assert!((snap.fz_n - 200.0).abs() < 1e-9);
        let state = agg.device("g", VirtualDeviceRole::LandingZoneAggregate).unwrap();
        assert_eq!(state.members.len(), 2);
        assert_eq!(state.history.len(), 20);
    }

    #[test]
    fn test_silent_plate_stops_contributing() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        let t0 = Instant::now();
        agg.ingest_at(frame("g.Landing Zone A", 1, 300.0), t0, &sink);
        let snap = agg.ingest_at(frame("g.Landing Zone B", 1, 100.0), t0 + Duration::from_millis(500), &sink);
        assert!((snap.fz_n - 400.0).abs() < 1e-9);

        // A has been silent past the stale window
        let snap = agg.ingest_at(frame("g.Landing Zone B", 2, 100.0), t0 + Duration::from_millis(1_500), &sink);
        assert!((snap.fz_n - 100.0).abs() < 1e-9);
        let state = agg.device("g", VirtualDeviceRole::LandingZoneAggregate).unwrap();
        assert_eq!(state.members.keys().collect::<Vec<_>>(), vec!["g.Landing Zone B"]);
    }

    #[test]
    fn test_record_gaps_wrap() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        agg.ingest(frame("g.Launch Zone", u32::MAX - 1, 10.0), &sink);
        let snap = agg.ingest(frame("g.Launch Zone", 0, 10.0), &sink);
        assert_eq!(snap.record_gap, Some(1));
        let snap = agg.ingest(frame("g.Launch Zone", 1, 10.0), &sink);
        assert_eq!(snap.record_gap, None);
        assert_eq!(agg.record_gaps(), 1);
    }

    #[test]
    fn test_data_rate_prefers_payload_then_timestamps() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        let mut f = frame("g.Launch Zone", 1, 10.0);
        f.data_rate = Some(500.0);
        assert_eq!(agg.ingest(f, &sink).data_rate, Some(500.0));

        let mut agg = aggregator(8);
        agg.ingest(frame("g.Launch Zone", 1, 10.0), &sink);
        // 10 ms spacing -> 100 Hz
        let snap = agg.ingest(frame("g.Launch Zone", 2, 10.0), &sink);
        assert!((snap.data_rate.unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_landing_members_are_force_weighted() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        let mut a = frame("g.Landing Zone A", 1, 300.0);
        a.cop = Point2D::new(0.0, 0.0);
        let mut b = frame("g.Landing Zone B", 1, 100.0);
        b.cop = Point2D::new(0.4, 0.0);
        agg.ingest(a, &sink);
        let snap = agg.ingest(b, &sink);
        assert_eq!(snap.role, VirtualDeviceRole::LandingZoneAggregate);
        assert!((snap.fz_n - 400.0).abs() < 1e-9);
        // 0.1 m weighted, inverted into display mm
        assert!((snap.cop_mm.x + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_removed_groups_drop_states() {
        let sink = RecordingSink::new();
        let mut agg = aggregator(8);
        let groups = |ids: &[&str]| -> Vec<GroupInfo> {
            ids.iter()
                .map(|id| GroupInfo {
                    id: id.to_string(),
                    name: None,
                })
                .collect()
        };
        agg.set_groups(&groups(&["a", "b"]));
        agg.ingest(frame("a.Launch Zone", 1, 10.0), &sink);
        agg.ingest(frame("b.Launch Zone", 1, 10.0), &sink);

        let removed = agg.set_groups(&groups(&["b"]));
        assert_eq!(removed, vec!["a".to_string()]);
        assert!(agg.device("a", VirtualDeviceRole::LaunchZone).is_none());
        assert!(agg.device("b", VirtualDeviceRole::LaunchZone).is_some());
    }
}
