//! Live frame stream: wire types, identity resolution, per-device history.

pub mod aggregator;
pub mod groups;
pub mod history;
pub mod resolver;
pub mod types;

pub use aggregator::{AggregatorConfig, DeviceAggregator, DeviceKey, DeviceState, FrameSnapshot};
pub use groups::{parse_group_list, GroupInfo};
pub use history::FrameHistory;
pub use resolver::{default_role_keywords, device_name, normalize_identifier, DeviceIdentityResolver, RoleKeyword};
pub use types::{Point2D, RawFrame, SensorReading, Vec3, VirtualDeviceRole};
