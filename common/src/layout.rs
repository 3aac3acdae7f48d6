use serde::{Deserialize, Serialize};

const MEMBERS_DIR: &str = "members";
const HEARTBEAT_KEY: &str = "heartbeat";
const LEADER_KEY: &str = "leader";

/// Key layout of the coordination store below the discovery root:
///
/// ```text
/// <root>/<group>/members/<node>/heartbeat
/// <root>/<group>/leader
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLayout {
    root: String,
}

/// A store key classified against the layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPath {
    Group { group: String },
    Members { group: String },
    Member { group: String, node: String },
    Heartbeat { group: String, node: String },
    Leader { group: String },
}

impl KeyLayout {
    pub fn new(root: impl AsRef<str>) -> Self {
        let trimmed = root.as_ref().trim_end_matches('/');
        let root = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        };
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn group_dir(&self, group: &str) -> String {
        format!("{}/{}", self.root, group)
    }

    pub fn members_dir(&self, group: &str) -> String {
        format!("{}/{}/{}", self.root, group, MEMBERS_DIR)
    }

    pub fn member_dir(&self, group: &str, node: &str) -> String {
        format!("{}/{}", self.members_dir(group), node)
    }

    pub fn heartbeat_key(&self, group: &str, node: &str) -> String {
        format!("{}/{}", self.member_dir(group, node), HEARTBEAT_KEY)
    }

    pub fn leader_key(&self, group: &str) -> String {
        format!("{}/{}", self.group_dir(group), LEADER_KEY)
    }

    /// Classify a full key. Returns `None` for keys outside the root or
    /// keys that do not fit the layout.
    pub fn parse(&self, key: &str) -> Option<KeyPath> {
        let rest = key.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }

        let group = segments[0].to_string();
        match segments.as_slice() {
            [_] => Some(KeyPath::Group { group }),
            [_, LEADER_KEY] => Some(KeyPath::Leader { group }),
            [_, MEMBERS_DIR] => Some(KeyPath::Members { group }),
            [_, MEMBERS_DIR, node] => Some(KeyPath::Member {
                group,
                node: node.to_string(),
            }),
            [_, MEMBERS_DIR, node, HEARTBEAT_KEY] => Some(KeyPath::Heartbeat {
                group,
                node: node.to_string(),
            }),
            _ => None,
        }
    }
}

/// Last segment of a store key (`/a/b/c` -> `c`)
pub fn base_name(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}
