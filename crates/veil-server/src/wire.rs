//! Wire representation of node state.
//!
//! [`map_state`] projects the canonical [`NodeState`] into the stable schema
//! the control UI consumes. It is a pure function: no I/O, no clock, no
//! error path — a malformed internal state is a programming error upstream,
//! not something this layer can recover from.
//!
//! Omission rules: optional strings disappear when empty, optional nested
//! objects (`proposal`, `statistics`) when absent, and collections always
//! serialize as arrays so clients never branch on null.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use veil_core::state::{
    Connection, ConnectionStatistics, Identity, NodeState, Proposal, ServiceInfo, ServiceSession,
};

/// Kinds of events pushed over the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "state-change")]
    StateChange,
    #[serde(rename = "nat")]
    Nat,
    #[serde(rename = "service-status")]
    ServiceStatus,
}

/// The envelope every streamed frame carries: `{type, payload}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build an envelope around any serializable payload. The only failure
    /// mode is payload serialization, which the hub logs and drops.
    pub fn new<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn state_change(state: &NodeState) -> Result<Self, serde_json::Error> {
        Self::new(EventKind::StateChange, &map_state(state))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StateRes {
    pub nat_status: NatStatusDto,
    pub service_info: Vec<ServiceInfoDto>,
    pub sessions: Vec<SessionDto>,
    pub consumer: ConsumerStateRes,
    pub identities: Vec<IdentityDto>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NatStatusDto {
    pub status: String,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceInfoDto {
    pub id: String,
    pub provider_id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub options: serde_json::Value,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalDto>,
    pub connection_statistics: ServiceStatisticsDto,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProposalDto {
    pub provider_id: String,
    pub service_type: String,
    pub country: String,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ServiceStatisticsDto {
    pub attempted: u64,
    pub successful: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionDto {
    pub id: String,
    pub direction: String,
    pub consumer_id: String,
    pub service_type: String,
    pub created_at: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tokens: u64,
    pub status: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConsumerStateRes {
    pub connection: ConnectionDto,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionDto {
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub consumer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal: Option<ProposalDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ConnectionStatisticsDto>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionStatisticsDto {
    pub at: String,
    pub duration: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tokens_spent: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct IdentityDto {
    pub id: String,
    pub registration_status: String,
    pub channel_address: String,
    pub balance: u64,
    pub earnings: u64,
    pub earnings_total: u64,
}

/// Project the canonical state into its wire form.
pub fn map_state(state: &NodeState) -> StateRes {
    StateRes {
        nat_status: NatStatusDto {
            status: state.nat_status.status.clone(),
            error: state.nat_status.error.clone(),
        },
        service_info: state.services.iter().map(map_service).collect(),
        sessions: state.sessions.iter().map(map_session).collect(),
        consumer: ConsumerStateRes {
            connection: map_connection(&state.connection),
        },
        identities: state.identities.iter().map(map_identity).collect(),
    }
}

fn map_service(service: &ServiceInfo) -> ServiceInfoDto {
    ServiceInfoDto {
        id: service.id.to_string(),
        provider_id: service.provider_id.clone(),
        service_type: service.service_type.clone(),
        options: service.options.clone(),
        status: service.status.as_str().to_owned(),
        proposal: service.proposal.as_ref().map(map_proposal),
        connection_statistics: ServiceStatisticsDto {
            attempted: service.connection_statistics.attempted,
            successful: service.connection_statistics.successful,
        },
    }
}

fn map_proposal(proposal: &Proposal) -> ProposalDto {
    ProposalDto {
        provider_id: proposal.provider_id.clone(),
        service_type: proposal.service_type.clone(),
        country: proposal.country.clone(),
    }
}

fn map_session(session: &ServiceSession) -> SessionDto {
    SessionDto {
        id: session.id.to_string(),
        direction: session.direction.as_str().to_owned(),
        consumer_id: session.consumer_id.clone(),
        service_type: session.service_type.clone(),
        created_at: rfc3339(session.started),
        bytes_sent: session.bytes_sent,
        bytes_received: session.bytes_received,
        tokens: session.tokens,
        status: session.status.as_str().to_owned(),
    }
}

fn map_connection(connection: &Connection) -> ConnectionDto {
    ConnectionDto {
        status: connection.state.as_str().to_owned(),
        session_id: connection.session_id.clone(),
        consumer_id: connection.consumer_id.clone(),
        proposal: connection.proposal.as_ref().map(map_proposal),
        statistics: map_statistics(&connection.statistics),
    }
}

// statistics exist on the wire only once a sample has been recorded
fn map_statistics(statistics: &ConnectionStatistics) -> Option<ConnectionStatisticsDto> {
    statistics.at.map(|at| ConnectionStatisticsDto {
        at: rfc3339(at),
        duration: statistics.duration_seconds,
        bytes_sent: statistics.bytes_sent,
        bytes_received: statistics.bytes_received,
        tokens_spent: statistics.tokens_spent,
    })
}

fn map_identity(identity: &Identity) -> IdentityDto {
    IdentityDto {
        id: identity.address.clone(),
        registration_status: identity.registration_status.as_str().to_owned(),
        channel_address: identity.channel_address.clone(),
        balance: identity.balance,
        earnings: identity.earnings,
        earnings_total: identity.earnings_total,
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
