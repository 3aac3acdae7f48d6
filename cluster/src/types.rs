use keeper_common::KeeperError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kind of state transition carried by an [`Exchange`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpEvent {
    /// Reassign the group's leader
    Update,

    /// Destroy the group's monitor
    Exit,

    /// Suspend request; currently only logged
    Stop,
}

impl From<OpEvent> for u8 {
    fn from(event: OpEvent) -> Self {
        match event {
            OpEvent::Update => 1,
            OpEvent::Exit => 2,
            OpEvent::Stop => 3,
        }
    }
}

impl TryFrom<u8> for OpEvent {
    type Error = KeeperError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OpEvent::Update),
            2 => Ok(OpEvent::Exit),
            3 => Ok(OpEvent::Stop),
            other => Err(KeeperError::UnknownOpEvent(other.to_string())),
        }
    }
}

impl FromStr for OpEvent {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "update" => Ok(OpEvent::Update),
            "exit" => Ok(OpEvent::Exit),
            "stop" => Ok(OpEvent::Stop),
            _ => Err(KeeperError::UnknownOpEvent(s.to_string())),
        }
    }
}

impl std::fmt::Display for OpEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpEvent::Update => write!(f, "UPDATE"),
            OpEvent::Exit => write!(f, "EXIT"),
            OpEvent::Stop => write!(f, "STOP"),
        }
    }
}

/// A state-transition request for one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub from: String,
    pub to: String,
    pub group: String,
    pub op_event: OpEvent,
}

impl Exchange {
    pub fn update(group: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            group: group.into(),
            op_event: OpEvent::Update,
        }
    }

    pub fn exit(group: impl Into<String>) -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            group: group.into(),
            op_event: OpEvent::Exit,
        }
    }

    pub fn stop(group: impl Into<String>) -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            group: group.into(),
            op_event: OpEvent::Stop,
        }
    }
}

/// Read-only view of a group monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub group: String,
    pub working_node: String,
    pub last_working_node: String,
    /// Unix seconds of the last accepted heartbeat
    pub last_keepalive: Option<i64>,
}

/// Which branch a health check took
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// No leader assigned
    Idle,
    /// Another check or reconciliation step holds the group
    Busy,
    /// Monitor already removed from the registry
    Retired,
    /// Members directory is gone; an `Exit` was emitted
    GroupGone,
    /// Membership could not be read; retried next tick
    MembersUnavailable,
    /// Leader heartbeat could not be read; retried next tick
    HeartbeatUnavailable,
    Healthy,
    /// An `Update` towards `to` was emitted
    FailoverRequested { to: String },
    /// Leader looks dead but no other member qualifies
    NoAlternate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_event_codes() {
        for event in [OpEvent::Update, OpEvent::Exit, OpEvent::Stop] {
            let code: u8 = event.into();
            assert_eq!(OpEvent::try_from(code).unwrap(), event);
        }

        assert!(matches!(
            OpEvent::try_from(9),
            Err(KeeperError::UnknownOpEvent(_))
        ));
    }

    #[test]
    fn test_op_event_names() {
        assert_eq!("Update".parse::<OpEvent>().unwrap(), OpEvent::Update);
        assert_eq!("exit".parse::<OpEvent>().unwrap(), OpEvent::Exit);
        assert!("finish".parse::<OpEvent>().is_err());
    }

    #[test]
    fn test_exchange_constructors() {
        let ex = Exchange::update("g1", "n1", "n2");
        assert_eq!(ex.op_event, OpEvent::Update);
        assert_eq!(ex.from, "n1");
        assert_eq!(ex.to, "n2");

        let ex = Exchange::exit("g1");
        assert_eq!(ex.op_event, OpEvent::Exit);
        assert!(ex.from.is_empty() && ex.to.is_empty());
    }
}
