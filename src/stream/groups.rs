//! Group list decoding (`getGroupsStatus`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A device group as advertised by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Extract groups from a `getGroupsStatus` payload.
///
/// Accepts a bare list or a `{status, data: [...]}` wrapper. The id is taken
/// from `axfId`, then `groupId`, then `id`; entries without any are skipped.
pub fn parse_group_list(payload: &Value) -> Vec<GroupInfo> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("data").or_else(|| map.get("groups")) {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let id = ["axfId", "groupId", "id"]
                .iter()
                .filter_map(|key| item.get(*key))
                .find_map(value_as_id)?;
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(GroupInfo { id, name })
        })
        .collect()
}

fn value_as_id(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_wrapped_and_bare_lists() {
        let wrapped = json!({"status": "success", "data": [
            {"axfId": "07.1", "name": "Mound A"},
            {"groupId": "g2"},
            {"id": 42},
            {"name": "no id"}
        ]});
        let groups = parse_group_list(&wrapped);
        let ids: Vec<&str> = groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["07.1", "g2", "42"]);
        assert_eq!(groups[0].name.as_deref(), Some("Mound A"));

        let bare = json!([{"groupId": "x"}]);
        assert_eq!(parse_group_list(&bare).len(), 1);
    }

    #[test]
    fn test_axf_id_takes_precedence() {
        let groups = parse_group_list(&json!([{"axfId": "a", "groupId": "b", "id": "c"}]));
        assert_eq!(groups[0].id, "a");

        let blank = parse_group_list(&json!([{"axfId": " ", "groupId": "b"}]));
        assert_eq!(blank[0].id, "b");
    }

    #[test]
    fn test_unexpected_shapes_yield_nothing() {
        assert!(parse_group_list(&json!(null)).is_empty());
        assert!(parse_group_list(&json!({"status": "error"})).is_empty());
    }
}
