//! Free-text device identity resolution.
//!
//! The wire payload carries no structural role for a device, only an
//! operator-controlled label such as `"grp.Launch Zone"` or
//! `"LANDING-zone_upper"`. Only the virtual-device name after the last `.`
//! is considered, so a group prefix never decides the role. The name is
//! normalized (lowercase, runs of spaces, hyphens and underscores collapsed
//! to one space) and matched against an injectable keyword table.

use crate::stream::types::VirtualDeviceRole;
use serde::{Deserialize, Serialize};

/// One entry in the keyword table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleKeyword {
    /// Keyword matched as a substring of the normalized identifier
    pub keyword: String,
    /// Role assigned on match
    pub role: VirtualDeviceRole,
}

impl RoleKeyword {
    pub fn new(keyword: impl Into<String>, role: VirtualDeviceRole) -> Self {
        Self {
            keyword: keyword.into(),
            role,
        }
    }
}

/// Default keyword table.
pub fn default_role_keywords() -> Vec<RoleKeyword> {
    vec![
        RoleKeyword::new("launch", VirtualDeviceRole::LaunchZone),
        RoleKeyword::new("landing", VirtualDeviceRole::LandingZoneAggregate),
    ]
}

/// Normalize an identifier for matching.
pub fn normalize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for ch in raw.trim().chars() {
        if ch == ' ' || ch == '-' || ch == '_' || ch.is_whitespace() {
            pending_separator = true;
            continue;
        }
        if pending_separator && !out.is_empty() {
            out.push(' ');
        }
        pending_separator = false;
        out.extend(ch.to_lowercase());
    }

    out
}

/// Virtual-device name of a `"<group>.<name>"` identifier.
pub fn device_name(identifier: &str) -> &str {
    identifier
        .rsplit_once('.')
        .map_or(identifier, |(_, name)| name)
}

/// Maps device identifiers to virtual-device roles.
///
/// Stateless apart from the immutable keyword table, so a shared reference
/// can be used from any thread.
#[derive(Debug, Clone)]
pub struct DeviceIdentityResolver {
    /// Keywords, pre-normalized, in priority order
    keywords: Vec<(String, VirtualDeviceRole)>,
}

impl DeviceIdentityResolver {
    pub fn new(table: &[RoleKeyword]) -> Self {
        let keywords = table
            .iter()
            .map(|entry| (normalize_identifier(&entry.keyword), entry.role))
            .filter(|(keyword, _)| !keyword.is_empty())
            .collect();
        Self { keywords }
    }

    /// Resolve an identifier by its device name. First matching keyword wins.
    pub fn resolve(&self, identifier: &str) -> VirtualDeviceRole {
        let normalized = normalize_identifier(device_name(identifier));
        if normalized.is_empty() {
            return VirtualDeviceRole::Unidentified;
        }

        self.keywords
            .iter()
            .find(|(keyword, _)| normalized.contains(keyword.as_str()))
            .map(|(_, role)| *role)
            .unwrap_or(VirtualDeviceRole::Unidentified)
    }
}

impl Default for DeviceIdentityResolver {
    fn default() -> Self {
        Self::new(&default_role_keywords())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_separators() {
        assert_eq!(normalize_identifier("Launch Zone"), "launch zone");
        assert_eq!(normalize_identifier("launch--_ zone"), "launch zone");
        assert_eq!(normalize_identifier("  LAUNCH_ZONE  "), "launch zone");
        assert_eq!(normalize_identifier("grp.Landing-Zone"), "grp.landing zone");
        assert_eq!(normalize_identifier(""), "");
    }

    #[test]
    fn test_case_and_separator_variants_resolve_identically() {
        let resolver = DeviceIdentityResolver::default();
        let variants = [
            "Launch Zone",
            "launch zone",
            "LAUNCH-ZONE",
            "launch_zone",
            "Launch - Zone",
            "grp-9.Launch_Zone",
        ];
        for v in variants {
            assert_eq!(resolver.resolve(v), VirtualDeviceRole::LaunchZone, "{v}");
        }

        for v in ["Landing Zone", "landing-zone", "UPPER_LANDING_ZONE"] {
            assert_eq!(
                resolver.resolve(v),
                VirtualDeviceRole::LandingZoneAggregate,
                "{v}"
            );
        }
    }

    #[test]
    fn test_group_prefix_does_not_decide_role() {
        let resolver = DeviceIdentityResolver::default();
        assert_eq!(
            resolver.resolve("launchrig.Landing Zone"),
            VirtualDeviceRole::LandingZoneAggregate
        );
        assert_eq!(
            resolver.resolve("Landing-Bay.Launch_Zone"),
            VirtualDeviceRole::LaunchZone
        );
        assert_eq!(resolver.resolve("launch.Side Plate"), VirtualDeviceRole::Unidentified);
        assert_eq!(resolver.resolve("launch."), VirtualDeviceRole::Unidentified);
    }

    #[test]
    fn test_device_name_is_last_segment() {
        assert_eq!(device_name("07.00000051.Launch Zone"), "Launch Zone");
        assert_eq!(device_name("Launch Zone"), "Launch Zone");
        assert_eq!(device_name("g."), "");
    }

    #[test]
    fn test_unmatched_identifier_is_unidentified() {
        let resolver = DeviceIdentityResolver::default();
        assert_eq!(resolver.resolve("07.00000051"), VirtualDeviceRole::Unidentified);
        assert_eq!(resolver.resolve(""), VirtualDeviceRole::Unidentified);
        assert_eq!(resolver.resolve("   "), VirtualDeviceRole::Unidentified);
    }

    #[test]
    fn test_keyword_table_is_injectable() {
        let resolver = DeviceIdentityResolver::new(&[RoleKeyword::new(
            "mound_front",
            VirtualDeviceRole::LaunchZone,
        )]);
        assert_eq!(resolver.resolve("Mound-Front plate"), VirtualDeviceRole::LaunchZone);
        assert_eq!(resolver.resolve("Launch Zone"), VirtualDeviceRole::Unidentified);
    }
}
