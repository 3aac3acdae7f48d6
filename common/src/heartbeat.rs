use crate::error::{KeeperError, Result};
use std::str::FromStr;

/// Minimum number of `-`-separated fields in a heartbeat value
pub const HEARTBEAT_MIN_FIELDS: usize = 3;

/// A member heartbeat as published under `<group>/members/<node>/heartbeat`.
///
/// The value looks like `"<field>-<field>-<unixTimestampSeconds>"`. Only the
/// third field carries meaning for the daemon; anything after it is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Unix timestamp (seconds) of the member's last liveness signal
    pub timestamp: i64,
}

impl Heartbeat {
    pub fn parse(value: &str) -> Result<Self> {
        let fields: Vec<&str> = value.split('-').collect();
        if fields.len() < HEARTBEAT_MIN_FIELDS {
            return Err(invalid(value, "expected at least 3 fields"));
        }

        let raw = fields[2];
        if raw.is_empty() {
            return Err(invalid(value, "timestamp field is empty"));
        }

        let timestamp = raw
            .parse::<i64>()
            .map_err(|e| invalid(value, &format!("timestamp is not an integer: {}", e)))?;

        Ok(Self { timestamp })
    }
}

impl FromStr for Heartbeat {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(value: &str, reason: &str) -> KeeperError {
    KeeperError::InvalidHeartbeat {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_heartbeat() {
        let hb = Heartbeat::parse("a-b-1000").unwrap();
        assert_eq!(hb.timestamp, 1000);

        let hb: Heartbeat = "host-4242-1700000000-extra".parse().unwrap();
        assert_eq!(hb.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            Heartbeat::parse("a-b"),
            Err(KeeperError::InvalidHeartbeat { .. })
        ));
        assert!(matches!(
            Heartbeat::parse("a-b-"),
            Err(KeeperError::InvalidHeartbeat { .. })
        ));
        assert!(matches!(
            Heartbeat::parse("a-b-12x"),
            Err(KeeperError::InvalidHeartbeat { .. })
        ));
        assert!(Heartbeat::parse("").is_err());
    }
}
