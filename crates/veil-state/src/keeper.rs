//! State keeper: folds granular bus events into the canonical [`NodeState`].
//!
//! The keeper is the node's single writer of state. Every other component
//! either publishes the events the keeper consumes, or reads snapshots
//! through [`StateProvider`]. After each mutation the keeper schedules a
//! debounced announcement: bursts of updates coalesce into one deep-copied
//! snapshot published on [`topic::STATE`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use veil_bus::{EventBus, SubscriptionId};
use veil_core::events::{
    topic, ConnectionStateEvent, ConnectionStatisticsEvent, IdentityEvent, NatEvent, SessionEvent,
    SessionEventKind, SessionStatisticsEvent, ServiceStatusEvent,
};
use veil_core::state::{Connection, ConnectionState, NatStatus, NodeState, ServiceInfo};
use veil_core::StateProvider;

/// Suggested announcement debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

pub struct Keeper {
    state: RwLock<NodeState>,
    bus: Arc<EventBus>,
    announce_tx: mpsc::Sender<()>,
}

impl Keeper {
    /// Create a keeper and spawn its announcement task. Must be called from
    /// within a tokio runtime.
    pub fn new(bus: Arc<EventBus>, debounce: Duration) -> Arc<Self> {
        let (announce_tx, mut announce_rx) = mpsc::channel::<()>(1);
        let keeper = Arc::new(Self {
            state: RwLock::new(NodeState::default()),
            bus,
            announce_tx,
        });

        let weak = Arc::downgrade(&keeper);
        tokio::spawn(async move {
            while announce_rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                // drain signals that arrived during the window
                while announce_rx.try_recv().is_ok() {}
                let Some(keeper) = weak.upgrade() else { break };
                keeper.announce();
            }
        });

        keeper
    }

    /// Attach the keeper's consumers to the bus. Returns the subscription
    /// handles for teardown.
    pub fn subscribe(self: &Arc<Self>) -> Vec<(&'static str, SubscriptionId)> {
        let mut handles = Vec::new();

        let k = Arc::clone(self);
        handles.push((
            topic::NAT,
            self.bus
                .subscribe::<NatEvent, _>(topic::NAT, move |e| k.consume_nat(e)),
        ));

        let k = Arc::clone(self);
        handles.push((
            topic::SERVICE_STATUS,
            self.bus
                .subscribe::<ServiceStatusEvent, _>(topic::SERVICE_STATUS, move |e| {
                    k.consume_service_status(e)
                }),
        ));

        let k = Arc::clone(self);
        handles.push((
            topic::SERVICE_SESSION,
            self.bus
                .subscribe::<SessionEvent, _>(topic::SERVICE_SESSION, move |e| {
                    k.consume_session(e)
                }),
        ));

        let k = Arc::clone(self);
        handles.push((
            topic::SESSION_STATISTICS,
            self.bus
                .subscribe::<SessionStatisticsEvent, _>(topic::SESSION_STATISTICS, move |e| {
                    k.consume_session_statistics(e)
                }),
        ));

        let k = Arc::clone(self);
        handles.push((
            topic::CONNECTION_STATE,
            self.bus
                .subscribe::<ConnectionStateEvent, _>(topic::CONNECTION_STATE, move |e| {
                    k.consume_connection_state(e)
                }),
        ));

        let k = Arc::clone(self);
        handles.push((
            topic::CONNECTION_STATISTICS,
            self.bus
                .subscribe::<ConnectionStatisticsEvent, _>(topic::CONNECTION_STATISTICS, move |e| {
                    k.consume_connection_statistics(e)
                }),
        ));

        let k = Arc::clone(self);
        handles.push((
            topic::IDENTITY,
            self.bus
                .subscribe::<IdentityEvent, _>(topic::IDENTITY, move |e| k.consume_identity(e)),
        ));

        handles
    }

    fn announce(&self) {
        let snapshot = self.get_state();
        self.bus.publish(topic::STATE, snapshot);
    }

    fn schedule_announce(&self) {
        // a signal already in the channel covers this mutation too
        let _ = self.announce_tx.try_send(());
    }

    fn consume_nat(&self, event: &NatEvent) {
        {
            let mut state = self.state.write();
            state.nat_status = NatStatus {
                status: event.status.clone(),
                error: event.error.clone(),
            };
        }
        self.schedule_announce();
    }

    fn consume_service_status(&self, event: &ServiceStatusEvent) {
        {
            let mut state = self.state.write();
            match state.services.iter_mut().find(|s| s.id == event.id) {
                Some(service) => {
                    service.status = event.status;
                    if event.proposal.is_some() {
                        service.proposal = event.proposal.clone();
                    }
                }
                None => state.services.push(ServiceInfo {
                    id: event.id.clone(),
                    provider_id: event.provider_id.clone(),
                    service_type: event.service_type.clone(),
                    options: serde_json::Value::Null,
                    status: event.status,
                    proposal: event.proposal.clone(),
                    connection_statistics: Default::default(),
                }),
            }
        }
        self.schedule_announce();
    }

    fn consume_session(&self, event: &SessionEvent) {
        {
            let mut state = self.state.write();
            match event.kind {
                SessionEventKind::Created => {
                    state.sessions.push(event.session.clone());
                    if let Some(service) =
                        state.services.iter_mut().find(|s| s.id == event.service_id)
                    {
                        service.connection_statistics.attempted += 1;
                    }
                }
                SessionEventKind::Acknowledged => {
                    if let Some(service) =
                        state.services.iter_mut().find(|s| s.id == event.service_id)
                    {
                        service.connection_statistics.successful += 1;
                    }
                }
                SessionEventKind::Removed => {
                    let before = state.sessions.len();
                    state.sessions.retain(|s| s.id != event.session.id);
                    if state.sessions.len() == before {
                        tracing::warn!(
                            session_id = %event.session.id,
                            "no matching session for session remove"
                        );
                    }
                }
            }
        }
        self.schedule_announce();
    }

    fn consume_session_statistics(&self, event: &SessionStatisticsEvent) {
        {
            let mut state = self.state.write();
            match state.sessions.iter_mut().find(|s| s.id == event.id) {
                Some(session) => {
                    session.bytes_sent = event.bytes_sent;
                    session.bytes_received = event.bytes_received;
                    session.tokens = event.tokens;
                }
                None => {
                    tracing::warn!(
                        session_id = %event.id,
                        "no matching session for statistics update"
                    );
                    return;
                }
            }
        }
        self.schedule_announce();
    }

    fn consume_connection_state(&self, event: &ConnectionStateEvent) {
        {
            let mut state = self.state.write();
            if event.state == ConnectionState::NotConnected {
                // connection gone: drop its session, proposal and counters
                state.connection = Connection {
                    state: ConnectionState::NotConnected,
                    ..Default::default()
                };
            } else {
                state.connection.state = event.state;
                state.connection.session_id = event.session_id.clone();
                state.connection.consumer_id = event.consumer_id.clone();
                if event.proposal.is_some() {
                    state.connection.proposal = event.proposal.clone();
                }
            }
        }
        self.schedule_announce();
    }

    fn consume_connection_statistics(&self, event: &ConnectionStatisticsEvent) {
        {
            let mut state = self.state.write();
            state.connection.statistics = event.statistics;
        }
        self.schedule_announce();
    }

    fn consume_identity(&self, event: &IdentityEvent) {
        {
            let mut state = self.state.write();
            match event {
                IdentityEvent::Added(identity) => {
                    match state
                        .identities
                        .iter_mut()
                        .find(|i| i.address == identity.address)
                    {
                        Some(existing) => *existing = identity.clone(),
                        None => state.identities.push(identity.clone()),
                    }
                }
                IdentityEvent::RegistrationChanged { address, status } => {
                    match state.identities.iter_mut().find(|i| &i.address == address) {
                        Some(identity) => identity.registration_status = *status,
                        None => {
                            tracing::warn!(%address, "no matching identity for registration change");
                            return;
                        }
                    }
                }
                IdentityEvent::BalanceChanged { address, balance } => {
                    match state.identities.iter_mut().find(|i| &i.address == address) {
                        Some(identity) => identity.balance = *balance,
                        None => {
                            tracing::warn!(%address, "no matching identity for balance change");
                            return;
                        }
                    }
                }
                IdentityEvent::EarningsChanged {
                    address,
                    earnings,
                    earnings_total,
                } => {
                    match state.identities.iter_mut().find(|i| &i.address == address) {
                        Some(identity) => {
                            identity.earnings = *earnings;
                            identity.earnings_total = *earnings_total;
                        }
                        None => {
                            tracing::warn!(%address, "no matching identity for earnings change");
                            return;
                        }
                    }
                }
            }
        }
        self.schedule_announce();
    }
}

impl StateProvider for Keeper {
    fn get_state(&self) -> NodeState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use veil_core::ids::{ServiceId, SessionId};
    use veil_core::state::{
        ConnectionStatistics, Identity, RegistrationStatus, ServiceSession, ServiceStatus,
        SessionDirection, SessionStatus,
    };

    const TEST_DEBOUNCE: Duration = Duration::from_millis(10);

    fn session(id: &str) -> ServiceSession {
        ServiceSession {
            id: SessionId::from_raw(id),
            direction: SessionDirection::Provided,
            consumer_id: "0xconsumer".into(),
            service_type: "wireguard".into(),
            started: Utc::now(),
            bytes_sent: 0,
            bytes_received: 0,
            tokens: 0,
            status: SessionStatus::New,
        }
    }

    fn service_event(id: &str, status: ServiceStatus) -> ServiceStatusEvent {
        ServiceStatusEvent {
            id: ServiceId::from_raw(id),
            provider_id: "0xprovider".into(),
            service_type: "wireguard".into(),
            status,
            proposal: None,
        }
    }

    #[tokio::test]
    async fn nat_event_updates_state() {
        let bus = EventBus::new();
        let keeper = Keeper::new(Arc::clone(&bus), TEST_DEBOUNCE);
        keeper.subscribe();

        bus.publish(
            topic::NAT,
            NatEvent {
                status: "successful".into(),
                error: String::new(),
            },
        );

        let state = keeper.get_state();
        assert_eq!(state.nat_status.status, "successful");
        assert_eq!(state.nat_status.error, "");
    }

    #[tokio::test]
    async fn service_status_upserts() {
        let bus = EventBus::new();
        let keeper = Keeper::new(Arc::clone(&bus), TEST_DEBOUNCE);
        keeper.subscribe();

        bus.publish(topic::SERVICE_STATUS, service_event("service_1", ServiceStatus::Starting));
        bus.publish(topic::SERVICE_STATUS, service_event("service_1", ServiceStatus::Running));

        let state = keeper.get_state();
        assert_eq!(state.services.len(), 1);
        assert_eq!(state.services[0].status, ServiceStatus::Running);
        assert_eq!(state.services[0].provider_id, "0xprovider");
    }

    #[tokio::test]
    async fn session_lifecycle_tracks_connect_counts() {
        let bus = EventBus::new();
        let keeper = Keeper::new(Arc::clone(&bus), TEST_DEBOUNCE);
        keeper.subscribe();

        bus.publish(topic::SERVICE_STATUS, service_event("service_1", ServiceStatus::Running));
        bus.publish(
            topic::SERVICE_SESSION,
            SessionEvent {
                kind: SessionEventKind::Created,
                service_id: ServiceId::from_raw("service_1"),
                session: session("sess_1"),
            },
        );
        bus.publish(
            topic::SERVICE_SESSION,
            SessionEvent {
                kind: SessionEventKind::Acknowledged,
                service_id: ServiceId::from_raw("service_1"),
                session: session("sess_1"),
            },
        );

        let state = keeper.get_state();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.services[0].connection_statistics.attempted, 1);
        assert_eq!(state.services[0].connection_statistics.successful, 1);

        bus.publish(
            topic::SERVICE_SESSION,
            SessionEvent {
                kind: SessionEventKind::Removed,
                service_id: ServiceId::from_raw("service_1"),
                session: session("sess_1"),
            },
        );
        assert!(keeper.get_state().sessions.is_empty());
    }

    #[tokio::test]
    async fn session_statistics_for_unknown_session_is_skipped() {
        let bus = EventBus::new();
        let keeper = Keeper::new(Arc::clone(&bus), TEST_DEBOUNCE);
        keeper.subscribe();

        bus.publish(
            topic::SESSION_STATISTICS,
            SessionStatisticsEvent {
                id: SessionId::from_raw("sess_missing"),
                bytes_sent: 10,
                bytes_received: 20,
                tokens: 1,
            },
        );

        assert!(keeper.get_state().sessions.is_empty());
    }

    #[tokio::test]
    async fn disconnect_clears_connection() {
        let bus = EventBus::new();
        let keeper = Keeper::new(Arc::clone(&bus), TEST_DEBOUNCE);
        keeper.subscribe();

        bus.publish(
            topic::CONNECTION_STATE,
            ConnectionStateEvent {
                state: ConnectionState::Connected,
                session_id: "sess_1".into(),
                consumer_id: "0xconsumer".into(),
                proposal: None,
            },
        );
        bus.publish(
            topic::CONNECTION_STATISTICS,
            ConnectionStatisticsEvent {
                statistics: ConnectionStatistics {
                    at: Some(Utc::now()),
                    duration_seconds: 5,
                    bytes_sent: 100,
                    bytes_received: 200,
                    tokens_spent: 3,
                },
            },
        );

        let state = keeper.get_state();
        assert_eq!(state.connection.state, ConnectionState::Connected);
        assert!(state.connection.statistics.at.is_some());

        bus.publish(
            topic::CONNECTION_STATE,
            ConnectionStateEvent {
                state: ConnectionState::NotConnected,
                session_id: String::new(),
                consumer_id: String::new(),
                proposal: None,
            },
        );

        let state = keeper.get_state();
        assert_eq!(state.connection.state, ConnectionState::NotConnected);
        assert_eq!(state.connection.session_id, "");
        assert!(state.connection.statistics.at.is_none());
    }

    #[tokio::test]
    async fn identity_events_fold() {
        let bus = EventBus::new();
        let keeper = Keeper::new(Arc::clone(&bus), TEST_DEBOUNCE);
        keeper.subscribe();

        bus.publish(
            topic::IDENTITY,
            IdentityEvent::Added(Identity {
                address: "0x1".into(),
                ..Default::default()
            }),
        );
        bus.publish(
            topic::IDENTITY,
            IdentityEvent::RegistrationChanged {
                address: "0x1".into(),
                status: RegistrationStatus::Registered,
            },
        );
        bus.publish(
            topic::IDENTITY,
            IdentityEvent::BalanceChanged {
                address: "0x1".into(),
                balance: 50,
            },
        );
        // unknown address is skipped, not panicked on
        bus.publish(
            topic::IDENTITY,
            IdentityEvent::BalanceChanged {
                address: "0xmissing".into(),
                balance: 1,
            },
        );

        let state = keeper.get_state();
        assert_eq!(state.identities.len(), 1);
        assert_eq!(
            state.identities[0].registration_status,
            RegistrationStatus::Registered
        );
        assert_eq!(state.identities[0].balance, 50);
    }

    #[tokio::test]
    async fn announcement_is_debounced() {
        let bus = EventBus::new();
        let keeper = Keeper::new(Arc::clone(&bus), TEST_DEBOUNCE);
        keeper.subscribe();

        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None::<NodeState>));
        {
            let count = Arc::clone(&count);
            let last = Arc::clone(&last);
            bus.subscribe::<NodeState, _>(topic::STATE, move |state| {
                count.fetch_add(1, Ordering::SeqCst);
                *last.lock().unwrap() = Some(state.clone());
            });
        }

        for i in 0..5 {
            bus.publish(
                topic::NAT,
                NatEvent {
                    status: format!("probe-{i}"),
                    error: String::new(),
                },
            );
        }

        tokio::time::sleep(TEST_DEBOUNCE * 10).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let snapshot = last.lock().unwrap().clone().unwrap();
        assert_eq!(snapshot.nat_status.status, "probe-4");
    }
}
