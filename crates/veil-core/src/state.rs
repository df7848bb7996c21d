//! Canonical node state aggregate.
//!
//! `NodeState` is the single source of truth about what the node is doing:
//! NAT traversal outcome, running services and their sessions, the consumer
//! connection, and registered identities. It is maintained by the state
//! keeper and observed (never mutated) by the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ServiceId, SessionId};

/// Last known NAT traversal outcome. Both fields are plain strings reported
/// by the traversal pipeline; an empty status means no probe has finished.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatStatus {
    pub status: String,
    pub error: String,
}

/// Lifecycle state of a provider-side service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[default]
    NotRunning,
    Starting,
    Running,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRunning => "NotRunning",
            Self::Starting => "Starting",
            Self::Running => "Running",
        }
    }
}

/// The market proposal a service advertises (or a connection consumes).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub provider_id: String,
    pub service_type: String,
    pub country: String,
}

/// Per-service consumer connect counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub attempted: u64,
    pub successful: u64,
}

/// One running (or configured) service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub provider_id: String,
    pub service_type: String,
    pub options: Value,
    pub status: ServiceStatus,
    pub proposal: Option<Proposal>,
    pub connection_statistics: ServiceStatistics,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDirection {
    #[default]
    Provided,
    Consumed,
}

impl SessionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provided => "Provided",
            Self::Consumed => "Consumed",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[default]
    New,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Completed => "Completed",
        }
    }
}

/// A session served to (or consumed from) a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceSession {
    pub id: SessionId,
    pub direction: SessionDirection,
    pub consumer_id: String,
    pub service_type: String,
    pub started: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tokens: u64,
    pub status: SessionStatus,
}

/// Consumer connection lifecycle. `Unknown` is the zero value before any
/// connection attempt and renders as an empty string on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    #[serde(rename = "")]
    Unknown,
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "",
            Self::NotConnected => "NotConnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
            Self::Reconnecting => "Reconnecting",
        }
    }
}

/// Traffic counters for the consumer connection. `at == None` means no
/// sample has been recorded yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatistics {
    pub at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tokens_spent: u64,
}

/// The node's consumer-side connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub state: ConnectionState,
    pub session_id: String,
    pub consumer_id: String,
    pub proposal: Option<Proposal>,
    pub statistics: ConnectionStatistics,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    #[default]
    Unknown,
    Unregistered,
    InProgress,
    Registered,
    RegistrationError,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Unregistered => "Unregistered",
            Self::InProgress => "InProgress",
            Self::Registered => "Registered",
            Self::RegistrationError => "RegistrationError",
        }
    }
}

/// A local identity and its registration/balance standing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
    pub registration_status: RegistrationStatus,
    pub channel_address: String,
    pub balance: u64,
    pub earnings: u64,
    pub earnings_total: u64,
}

/// Everything the node knows about itself, as one snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub nat_status: NatStatus,
    pub services: Vec<ServiceInfo>,
    pub sessions: Vec<ServiceSession>,
    pub connection: Connection,
    pub identities: Vec<Identity>,
}

/// Read boundary for the canonical state. Implemented by the state keeper;
/// the API layer only ever sees this trait.
pub trait StateProvider: Send + Sync {
    fn get_state(&self) -> NodeState;
}
