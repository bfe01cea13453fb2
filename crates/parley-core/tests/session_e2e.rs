mod support;

use std::sync::Arc;
use std::time::Duration;

use parley_core::engine::{IceConnectionState, MockEngine, MockNetwork, PeerConnection};
use parley_core::error::SessionError;
use parley_core::protocol::{CallAction, ClientMessage, PeerMessage, ServerMessage};
use parley_core::{
    ConnectionStatus, EndReason, Role, Session, SessionConfig, SessionContext, SessionEvent,
    SessionHandle,
};
use test_timeout::tokio_timeout_test;
use tokio::sync::mpsc;

use support::{RelayServer, TestCipher, drain, eventually, expect_event};

const TOKEN: &str = "ROOM7";

struct Peer {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    engine: Arc<MockEngine>,
}

impl Peer {
    async fn join(config: SessionConfig, network: &MockNetwork, participant: &str, role: Role) -> Self {
        let engine = Arc::new(MockEngine::new(network));
        let (handle, events) = Session::spawn(
            config,
            SessionContext::new(TOKEN, participant, role),
            engine.clone(),
            Arc::new(TestCipher),
        );
        handle.start().await.expect("session start");
        Self {
            handle,
            events,
            engine,
        }
    }

    async fn expect(&mut self, wanted: SessionEvent) {
        expect_event(&mut self.events, |event| *event == wanted).await;
    }

    async fn wait_connected(&mut self) {
        self.expect(SessionEvent::DataChannelOpened).await;
        self.expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Connected))
            .await;
    }

    async fn remote_media(&mut self) -> Option<parley_core::engine::RemoteMedia> {
        match expect_event(&mut self.events, |event| {
            matches!(event, SessionEvent::RemoteMediaChanged(_))
        })
        .await
        {
            SessionEvent::RemoteMediaChanged(media) => media,
            _ => unreachable!(),
        }
    }
}

async fn connected_pair(server: &RelayServer, network: &MockNetwork) -> (Peer, Peer) {
    let mut host = Peer::join(server.config(), network, "host-1", Role::Host).await;
    let mut guest = Peer::join(server.config(), network, "guest-1", Role::Guest).await;
    host.wait_connected().await;
    guest.wait_connected().await;
    (host, guest)
}

async fn video_call(inviter: &mut Peer, invitee: &mut Peer) {
    inviter.handle.send_invite().await.unwrap();
    invitee.expect(SessionEvent::VideoInviteReceived).await;
    invitee.handle.accept_invite().await.unwrap();
    inviter.expect(SessionEvent::VideoAccepted).await;
    assert!(inviter.remote_media().await.is_some());
    assert!(invitee.remote_media().await.is_some());
}

#[tokio_timeout_test(30)]
async fn host_and_guest_connect_and_exchange_chat() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    let message_id = host.handle.send_chat("hello").await.unwrap();
    let received = match expect_event(&mut guest.events, |event| {
        matches!(event, SessionEvent::ChatMessageReceived(_))
    })
    .await
    {
        SessionEvent::ChatMessageReceived(received) => received,
        _ => unreachable!(),
    };
    assert_eq!(received.text, "hello");
    assert_eq!(received.message_id, message_id);
    assert_eq!(received.sender_role, Role::Host);

    host.expect(SessionEvent::MessageAcknowledged(message_id))
        .await;

    let reply = guest.handle.send_chat("hi back").await.unwrap();
    guest.expect(SessionEvent::MessageAcknowledged(reply)).await;
}

#[tokio_timeout_test(30)]
async fn chat_requires_open_data_channel() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let host = Peer::join(server.config(), &network, "host-1", Role::Host).await;

    let err = host.handle.send_chat("anyone?").await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_)));
}

#[tokio_timeout_test(30)]
async fn guest_waits_for_host_offer() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let mut guest = Peer::join(server.config(), &network, "guest-1", Role::Guest).await;
    expect_event(&mut guest.events, |event| {
        matches!(event, SessionEvent::ParticipantsChanged(_))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(guest.engine.latest().is_none());

    let mut host = Peer::join(server.config(), &network, "host-1", Role::Host).await;
    host.wait_connected().await;
    guest.wait_connected().await;
    assert_eq!(host.engine.connections().len(), 1);
    assert_eq!(guest.engine.connections().len(), 1);
    assert_eq!(host.engine.latest().unwrap().offers_created(), 1);
}

#[tokio_timeout_test(30)]
async fn accepted_invite_brings_up_video_both_ways() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    video_call(&mut host, &mut guest).await;

    let host_pc = host.engine.latest().unwrap();
    let guest_pc = guest.engine.latest().unwrap();
    assert!(host_pc.local_video());
    assert!(guest_pc.local_video());
    // Only the inviter renegotiates.
    assert_eq!(host_pc.offers_created(), 2);
    assert_eq!(guest_pc.offers_created(), 0);
}

#[tokio_timeout_test(30)]
async fn guest_inviter_owns_video_renegotiation() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    video_call(&mut guest, &mut host).await;

    let host_pc = host.engine.latest().unwrap();
    let guest_pc = guest.engine.latest().unwrap();
    assert_eq!(guest_pc.offers_created(), 1);
    assert_eq!(host_pc.offers_created(), 1);
    assert!(host_pc.local_video() && guest_pc.local_video());

    guest.handle.end_call().await.unwrap();
    assert_eq!(host.remote_media().await, None);
    host.expect(SessionEvent::VideoEnded).await;
    let id = host.handle.send_chat("text still works").await.unwrap();
    host.expect(SessionEvent::MessageAcknowledged(id)).await;
}

#[tokio_timeout_test(30)]
async fn declined_invite_returns_to_idle() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    guest.handle.send_invite().await.unwrap();
    host.expect(SessionEvent::VideoInviteReceived).await;
    host.handle.decline_invite().await.unwrap();
    guest.expect(SessionEvent::VideoDeclined).await;

    // A fresh invite is allowed afterwards.
    guest.handle.send_invite().await.unwrap();
    host.expect(SessionEvent::VideoInviteReceived).await;
}

#[tokio_timeout_test(30)]
async fn ending_call_tears_down_video_on_both_sides() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;
    video_call(&mut host, &mut guest).await;

    host.handle.end_call().await.unwrap();
    assert_eq!(host.remote_media().await, None);
    host.expect(SessionEvent::VideoEnded).await;
    assert_eq!(guest.remote_media().await, None);
    guest.expect(SessionEvent::VideoEnded).await;

    let host_pc = host.engine.latest().unwrap();
    let guest_pc = guest.engine.latest().unwrap();
    eventually(|| !host_pc.local_video() && !guest_pc.local_video()).await;
    eventually(|| host_pc.offers_created() == 3).await;

    // Chat still flows after the call.
    let id = guest.handle.send_chat("still here").await.unwrap();
    guest.expect(SessionEvent::MessageAcknowledged(id)).await;
}

#[tokio_timeout_test(30)]
async fn accepting_twice_is_rejected() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;
    video_call(&mut host, &mut guest).await;

    let err = guest.handle.accept_invite().await.unwrap_err();
    assert!(matches!(err, SessionError::Call(_)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !drain(&mut host.events)
            .iter()
            .any(|event| *event == SessionEvent::VideoAccepted)
    );
    assert_eq!(host.engine.latest().unwrap().offers_created(), 2);
}

#[tokio_timeout_test(30)]
async fn accept_arriving_on_both_paths_renegotiates_once() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;
    let host_pc = host.engine.latest().unwrap();
    let guest_pc = guest.engine.latest().unwrap();

    host.handle.send_invite().await.unwrap();
    guest.expect(SessionEvent::VideoInviteReceived).await;
    // With ICE down on the guest the accept goes out through signaling.
    guest_pc.simulate_ice_state(IceConnectionState::Disconnected);
    guest
        .expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Reconnecting))
        .await;
    guest.handle.accept_invite().await.unwrap();
    host.expect(SessionEvent::VideoAccepted).await;
    assert!(host.remote_media().await.is_some());
    assert!(guest.remote_media().await.is_some());

    let (signal_type, payload) = server
        .received()
        .into_iter()
        .find_map(|(_, message)| {
            let ClientMessage::Signal {
                signal_type,
                payload,
                participant_id,
            } = message;
            (participant_id == "guest-1" && signal_type == "call").then_some((signal_type, payload))
        })
        .expect("accept relayed through signaling");
    let accept = PeerMessage::from_signal(&signal_type, payload.clone()).unwrap();
    assert!(matches!(
        accept,
        PeerMessage::Call {
            action: CallAction::Accept,
            ..
        }
    ));

    host_pc.inject_channel_message(accept.to_text().unwrap());
    server.push(
        TOKEN,
        &ServerMessage::Signal {
            signal_type,
            payload,
            sender: "guest-1".into(),
        },
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        !drain(&mut host.events)
            .iter()
            .any(|event| *event == SessionEvent::VideoAccepted)
    );
    assert_eq!(host_pc.offers_created(), 2);
    assert_eq!(guest_pc.offers_created(), 0);
}

#[tokio_timeout_test(30)]
async fn lost_restart_offer_still_recovers() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let config = SessionConfig {
        ice_grace_window: Duration::from_millis(50),
        ..server.config()
    };
    let mut host = Peer::join(config, &network, "host-1", Role::Host).await;
    let mut guest = Peer::join(server.config(), &network, "guest-1", Role::Guest).await;
    host.wait_connected().await;
    guest.wait_connected().await;
    let first_pc = host.engine.latest().unwrap();

    server.set_relaying(false);
    first_pc.simulate_ice_state(IceConnectionState::Failed);
    host.expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Reconnecting))
        .await;
    eventually(|| first_pc.ice_restart_offers() >= 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.set_relaying(true);

    host.expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Connected))
        .await;
    let recovered = host.engine.latest().unwrap();
    assert!(first_pc.ice_restart_offers() >= 2 || host.engine.connections().len() > 1);

    // Whichever way it recovered, the text channel works again.
    eventually(|| recovered.ice_connection_state().is_connected()).await;
    let id = loop {
        match host.handle.send_chat("made it").await {
            Ok(id) => break id,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    host.expect(SessionEvent::MessageAcknowledged(id)).await;
}

#[tokio_timeout_test(30)]
async fn failed_ice_is_restarted_by_owner() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    let guest_pc = guest.engine.latest().unwrap();
    let host_pc = host.engine.latest().unwrap();
    guest_pc.simulate_ice_state(IceConnectionState::Failed);
    guest
        .expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Reconnecting))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(host_pc.ice_restart_offers(), 0);

    host_pc.simulate_ice_state(IceConnectionState::Failed);
    host.expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Reconnecting))
        .await;
    host.expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Connected))
        .await;
    guest
        .expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Connected))
        .await;
    assert_eq!(host_pc.ice_restart_offers(), 1);
    assert_eq!(host.engine.connections().len(), 1);

    let id = host.handle.send_chat("back").await.unwrap();
    host.expect(SessionEvent::MessageAcknowledged(id)).await;
}

#[tokio_timeout_test(30)]
async fn failed_restart_rebuilds_peer_connection() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    let host_pc = host.engine.latest().unwrap();
    host_pc.fail_ice_restart(true);
    host_pc.simulate_ice_state(IceConnectionState::Failed);

    host.expect(SessionEvent::DataChannelClosed).await;
    host.wait_connected().await;
    guest.wait_connected().await;
    assert_eq!(host.engine.connections().len(), 2);
    assert_eq!(guest.engine.connections().len(), 2);

    let id = host.handle.send_chat("rebuilt").await.unwrap();
    host.expect(SessionEvent::MessageAcknowledged(id)).await;
}

#[tokio_timeout_test(30)]
async fn resume_rechecks_and_recovers() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let config = SessionConfig {
        resume_recheck_delay: Duration::from_millis(50),
        ..server.config()
    };
    let mut host = Peer::join(config, &network, "host-1", Role::Host).await;
    let mut guest = Peer::join(server.config(), &network, "guest-1", Role::Guest).await;
    host.wait_connected().await;
    guest.wait_connected().await;

    let host_pc = host.engine.latest().unwrap();
    host_pc.simulate_ice_state(IceConnectionState::Disconnected);
    host.expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Reconnecting))
        .await;
    host.handle.request_recovery().unwrap();

    host.expect(SessionEvent::ConnectionStateChanged(ConnectionStatus::Connected))
        .await;
    assert_eq!(host_pc.ice_restart_offers(), 1);
}

#[tokio_timeout_test(30)]
async fn server_expiry_ends_session() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    server.push(TOKEN, &ServerMessage::SessionExpired);
    host.expect(SessionEvent::SessionEnded(EndReason::Expired))
        .await;
    guest
        .expect(SessionEvent::SessionEnded(EndReason::Expired))
        .await;

    eventually(|| host.handle.is_closed() && guest.handle.is_closed()).await;
    assert!(matches!(
        host.handle.send_chat("late").await,
        Err(SessionError::Closed)
    ));
}

#[tokio_timeout_test(30)]
async fn local_end_releases_everything() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, mut guest) = connected_pair(&server, &network).await;

    host.handle.end_session().await.unwrap();
    host.expect(SessionEvent::SessionEnded(EndReason::Local)).await;
    eventually(|| server.participants(TOKEN) == vec!["guest-1".to_string()]).await;

    // The guest sees its peer go away but stays in the session.
    guest.expect(SessionEvent::DataChannelClosed).await;
    assert!(!guest.handle.is_closed());
}

#[tokio_timeout_test(30)]
async fn server_errors_surface_without_ending() {
    let server = RelayServer::start().await;
    let network = MockNetwork::new();
    let (mut host, _guest) = connected_pair(&server, &network).await;

    server.push(
        TOKEN,
        &ServerMessage::Error {
            message: "rate limited".into(),
        },
    );
    host.expect(SessionEvent::ServerError("rate limited".into()))
        .await;
    let id = host.handle.send_chat("still fine").await.unwrap();
    host.expect(SessionEvent::MessageAcknowledged(id)).await;
}
