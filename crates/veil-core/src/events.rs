//! Bus topics and event payloads.
//!
//! Every component communicates through the event bus using these types.
//! Topic constants live next to the payloads they carry so a subscriber
//! can't pair the wrong type with a topic without it being obvious in review.

use serde::{Deserialize, Serialize};

use crate::ids::{ServiceId, SessionId};
use crate::state::{
    ConnectionState, ConnectionStatistics, Identity, Proposal, RegistrationStatus, ServiceSession,
    ServiceStatus,
};

/// Well-known bus topic names.
pub mod topic {
    /// Node lifecycle: [`super::NodeEvent`].
    pub const NODE: &str = "node-lifecycle";
    /// Full state snapshot announcements: [`crate::state::NodeState`].
    pub const STATE: &str = "state";
    /// NAT traversal outcome updates: [`super::NatEvent`].
    pub const NAT: &str = "nat";
    /// Service lifecycle changes: [`super::ServiceStatusEvent`].
    pub const SERVICE_STATUS: &str = "service-status";
    /// Service session add/ack/remove: [`super::SessionEvent`].
    pub const SERVICE_SESSION: &str = "service-session";
    /// Per-session traffic counters: [`super::SessionStatisticsEvent`].
    pub const SESSION_STATISTICS: &str = "session-statistics";
    /// Consumer connection lifecycle: [`super::ConnectionStateEvent`].
    pub const CONNECTION_STATE: &str = "connection-state";
    /// Consumer connection traffic samples: [`super::ConnectionStatisticsEvent`].
    pub const CONNECTION_STATISTICS: &str = "connection-statistics";
    /// Identity registration/balance changes: [`super::IdentityEvent`].
    pub const IDENTITY: &str = "identity";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Started,
    Stopped,
}

/// Emitted once when the node finishes starting and once when it shuts down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub status: NodeStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatEvent {
    pub status: String,
    pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceStatusEvent {
    pub id: ServiceId,
    pub provider_id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Proposal>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEventKind {
    Created,
    Acknowledged,
    Removed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub service_id: ServiceId,
    pub session: ServiceSession,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStatisticsEvent {
    pub id: SessionId,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionStateEvent {
    pub state: ConnectionState,
    pub session_id: String,
    pub consumer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<Proposal>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConnectionStatisticsEvent {
    pub statistics: ConnectionStatistics,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IdentityEvent {
    Added(Identity),
    RegistrationChanged {
        address: String,
        status: RegistrationStatus,
    },
    BalanceChanged {
        address: String,
        balance: u64,
    },
    EarningsChanged {
        address: String,
        earnings: u64,
        earnings_total: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_status_event_renames_type() {
        let event = ServiceStatusEvent {
            id: ServiceId::from_raw("service_1"),
            provider_id: "0xprovider".into(),
            service_type: "wireguard".into(),
            status: ServiceStatus::Running,
            proposal: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "wireguard");
        assert_eq!(value["status"], "Running");
        assert!(value.get("proposal").is_none());
    }

    #[test]
    fn nat_event_serializes_both_fields() {
        let event = NatEvent {
            status: "failed".into(),
            error: "hole punching timed out".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "hole punching timed out");
    }

    #[test]
    fn node_event_roundtrip() {
        let event = NodeEvent {
            status: NodeStatus::Started,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: NodeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, NodeStatus::Started);
    }
}
