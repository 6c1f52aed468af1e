use cyclos::{
    AppState, ChannelConfig, ChannelState, Error, Protocol, Reactor, Result, SecureChannel,
    TlsRole, Transport, upgrade_to_secure,
};

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};

// -- fixtures -----------------------------------------------------------

/// What the fake transport observed.
#[derive(Default)]
struct WireState {
    writes: Vec<Vec<u8>>,
    closed: bool,
    aborted: bool,
    paused: bool,
    pause_count: usize,
    resume_count: usize,
}

/// An in-memory transport capturing everything the channel hands down.
struct MockTransport {
    state: Rc<RefCell<WireState>>,
}

impl Transport for MockTransport {
    fn write(&mut self, _reactor: &mut Reactor, data: &[u8]) -> Result<()> {
        self.state.borrow_mut().writes.push(data.to_vec());
        Ok(())
    }

    fn is_closing(&self) -> bool {
        let state = self.state.borrow();
        state.closed || state.aborted
    }

    fn close(&mut self, _reactor: &mut Reactor) {
        self.state.borrow_mut().closed = true;
    }

    fn abort(&mut self, _reactor: &mut Reactor) {
        self.state.borrow_mut().aborted = true;
    }

    fn pause_reading(&mut self) {
        let mut state = self.state.borrow_mut();
        state.paused = true;
        state.pause_count += 1;
    }

    fn resume_reading(&mut self) {
        let mut state = self.state.borrow_mut();
        state.paused = false;
        state.resume_count += 1;
    }
}

/// What the application protocol observed.
#[derive(Default)]
struct AppEvents {
    made: usize,
    received: Vec<u8>,
    eof: usize,
    lost: usize,
    lost_error: Option<String>,
    write_pauses: usize,
    write_resumes: usize,
}

struct RecordingProtocol {
    events: Rc<RefCell<AppEvents>>,
}

impl Protocol for RecordingProtocol {
    fn connection_made(&mut self, _reactor: &mut Reactor, _channel: &SecureChannel) {
        self.events.borrow_mut().made += 1;
    }

    fn data_received(&mut self, _reactor: &mut Reactor, data: &[u8]) {
        self.events.borrow_mut().received.extend_from_slice(data);
    }

    fn eof_received(&mut self, _reactor: &mut Reactor) -> bool {
        self.events.borrow_mut().eof += 1;
        false
    }

    fn connection_lost(&mut self, _reactor: &mut Reactor, error: Option<&Error>) {
        let mut events = self.events.borrow_mut();
        events.lost += 1;
        events.lost_error = error.map(|err| err.to_string());
    }

    fn pause_writing(&mut self) {
        self.events.borrow_mut().write_pauses += 1;
    }

    fn resume_writing(&mut self) {
        self.events.borrow_mut().write_resumes += 1;
    }
}

/// A protocol using the buffer-fill delivery path with a small fixed
/// buffer, forcing multiple fill rounds per message.
struct FillProtocol {
    events: Rc<RefCell<AppEvents>>,
    buf: [u8; 8],
}

impl Protocol for FillProtocol {
    fn connection_made(&mut self, _reactor: &mut Reactor, _channel: &SecureChannel) {
        self.events.borrow_mut().made += 1;
    }

    fn data_received(&mut self, _reactor: &mut Reactor, _data: &[u8]) {
        panic!("buffer-fill protocols receive through buffer_updated");
    }

    fn connection_lost(&mut self, _reactor: &mut Reactor, error: Option<&Error>) {
        let mut events = self.events.borrow_mut();
        events.lost += 1;
        events.lost_error = error.map(|err| err.to_string());
    }

    fn supports_buffer_fill(&self) -> bool {
        true
    }

    fn get_buffer(&mut self, _size_hint: usize) -> &mut [u8] {
        &mut self.buf
    }

    fn buffer_updated(&mut self, _reactor: &mut Reactor, n: usize) {
        self.events
            .borrow_mut()
            .received
            .extend_from_slice(&self.buf[..n]);
    }
}

fn test_tls_configs() -> (Arc<rustls::ClientConfig>, Arc<rustls::ServerConfig>) {
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert: CertificateDer<'static> = signed.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(signed.key_pair.serialize_der());

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key.into())
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(client), Arc::new(server))
}

struct Endpoint {
    channel: SecureChannel,
    wire: Rc<RefCell<WireState>>,
    app: Rc<RefCell<AppEvents>>,
}

fn endpoint(
    reactor: &mut Reactor,
    role: TlsRole,
    config: ChannelConfig,
    protocol: Box<dyn Protocol>,
    app: Rc<RefCell<AppEvents>>,
) -> Endpoint {
    let wire = Rc::new(RefCell::new(WireState::default()));
    let transport = Box::new(MockTransport {
        state: wire.clone(),
    });
    let channel = upgrade_to_secure(reactor, transport, protocol, role, config).unwrap();
    Endpoint {
        channel,
        wire,
        app,
    }
}

fn secure_pair(
    reactor: &mut Reactor,
    client_config: ChannelConfig,
    server_config: ChannelConfig,
) -> (Endpoint, Endpoint) {
    let (client_tls, server_tls) = test_tls_configs();

    let client_app = Rc::new(RefCell::new(AppEvents::default()));
    let client = endpoint(
        reactor,
        TlsRole::Client {
            config: client_tls,
            server_name: ServerName::try_from("localhost").unwrap(),
        },
        client_config,
        Box::new(RecordingProtocol {
            events: client_app.clone(),
        }),
        client_app,
    );

    let server_app = Rc::new(RefCell::new(AppEvents::default()));
    let server = endpoint(
        reactor,
        TlsRole::Server { config: server_tls },
        server_config,
        Box::new(RecordingProtocol {
            events: server_app.clone(),
        }),
        server_app,
    );

    (client, server)
}

/// Carry captured transport writes back and forth until both wires go
/// quiet.
fn shuttle(reactor: &mut Reactor, a: &Endpoint, b: &Endpoint) {
    for _ in 0..32 {
        let from_a: Vec<Vec<u8>> = a.wire.borrow_mut().writes.drain(..).collect();
        let from_b: Vec<Vec<u8>> = b.wire.borrow_mut().writes.drain(..).collect();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for chunk in from_a {
            b.channel.data_received(reactor, &chunk);
        }
        for chunk in from_b {
            a.channel.data_received(reactor, &chunk);
        }
    }
    panic!("wires never went quiet");
}

// -- tests --------------------------------------------------------------

#[test]
fn handshake_completes_and_reports_peer_metadata() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );

    assert_eq!(client.channel.state(), ChannelState::Handshaking);
    assert_eq!(server.channel.state(), ChannelState::Handshaking);

    shuttle(&mut reactor, &client, &server);

    assert_eq!(client.channel.state(), ChannelState::Open);
    assert_eq!(server.channel.state(), ChannelState::Open);
    assert_eq!(client.app.borrow().made, 1);
    assert_eq!(server.app.borrow().made, 1);
    assert_eq!(client.channel.app_state(), AppState::ConnectionMade);

    let info = client.channel.peer_info().expect("handshake completed");
    assert!(info.protocol_version.is_some());
    assert!(info.cipher_suite.is_some());
    assert_eq!(info.peer_certificates.len(), 1);
}

#[test]
fn plaintext_flows_in_both_directions() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    client.channel.write(&mut reactor, b"hello from the client");
    shuttle(&mut reactor, &client, &server);
    assert_eq!(server.app.borrow().received, b"hello from the client");

    server.channel.write(&mut reactor, b"hello back");
    shuttle(&mut reactor, &client, &server);
    assert_eq!(client.app.borrow().received, b"hello back");
}

#[test]
fn writes_queued_during_the_handshake_arrive_in_order() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );

    // No shuttling yet; all three land in the backlog.
    client.channel.write(&mut reactor, b"one ");
    client.channel.write(&mut reactor, b"two ");
    client.channel.write(&mut reactor, b"three");
    assert_eq!(client.channel.write_backlog_len(), 13);

    shuttle(&mut reactor, &client, &server);

    assert_eq!(client.channel.state(), ChannelState::Open);
    assert_eq!(client.channel.write_backlog_len(), 0);
    assert_eq!(server.app.borrow().received, b"one two three");
}

#[test]
fn write_watermarks_fire_once_per_edge() {
    let mut reactor = Reactor::new();
    let client_config = ChannelConfig {
        write_high_water: 100,
        write_low_water: 40,
        ..ChannelConfig::default()
    };
    let (client, server) = secure_pair(&mut reactor, client_config, ChannelConfig::default());

    // The backlog accumulates while the handshake is in flight.
    client.channel.write(&mut reactor, &[b'a'; 150]);
    assert_eq!(client.app.borrow().write_pauses, 1);

    // Already above the high watermark; no second notification.
    client.channel.write(&mut reactor, &[b'b'; 10]);
    assert_eq!(client.app.borrow().write_pauses, 1);
    assert_eq!(client.app.borrow().write_resumes, 0);

    // Completing the handshake drains the backlog below the low
    // watermark.
    shuttle(&mut reactor, &client, &server);
    assert_eq!(client.app.borrow().write_pauses, 1);
    assert_eq!(client.app.borrow().write_resumes, 1);
    assert_eq!(server.app.borrow().received.len(), 160);
}

#[test]
fn large_writes_drain_through_the_bounded_session_buffer() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    // Larger than the session's sendable-plaintext buffer, so one
    // encryption pass cannot consume it all.
    let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    client.channel.write(&mut reactor, &payload);
    assert_eq!(client.channel.write_backlog_len(), 0);

    shuttle(&mut reactor, &client, &server);

    assert!(!server.channel.is_aborted());
    assert_eq!(server.app.borrow().received, payload);
}

#[test]
fn oversized_inbound_bursts_are_delivered_not_fatal() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    server.channel.write(&mut reactor, &payload);

    // Deliver everything the server produced as one coalesced burst,
    // larger than the session's received-plaintext buffer.
    let mut burst = Vec::new();
    for chunk in server.wire.borrow_mut().writes.drain(..) {
        burst.extend_from_slice(&chunk);
    }
    assert!(burst.len() > 100_000);
    client.channel.data_received(&mut reactor, &burst);

    assert!(!client.channel.is_aborted());
    assert_eq!(client.channel.state(), ChannelState::Open);
    assert_eq!(client.app.borrow().received, payload);
}

#[test]
fn orderly_shutdown_exchanges_close_notifications() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    client.channel.close(&mut reactor);
    assert_eq!(client.channel.state(), ChannelState::ShuttingDown);

    shuttle(&mut reactor, &client, &server);

    assert_eq!(client.channel.state(), ChannelState::Unwrapped);
    assert_eq!(server.channel.state(), ChannelState::Unwrapped);

    // The passive side sees eof before the loss; the initiator does not.
    assert_eq!(server.app.borrow().eof, 1);
    assert_eq!(client.app.borrow().eof, 0);

    for end in [&client, &server] {
        let app = end.app.borrow();
        assert_eq!(app.lost, 1);
        assert!(app.lost_error.is_none(), "orderly shutdown is not an error");
        assert!(end.wire.borrow().closed);
        assert_eq!(end.channel.app_state(), AppState::ConnectionLost);
    }
}

#[test]
fn close_is_idempotent() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    client.channel.close(&mut reactor);
    client.channel.close(&mut reactor);
    shuttle(&mut reactor, &client, &server);
    client.channel.close(&mut reactor);

    assert_eq!(client.app.borrow().lost, 1);
}

#[test]
fn close_during_the_handshake_aborts_quietly() {
    let mut reactor = Reactor::new();
    let reports = Rc::new(RefCell::new(0));
    {
        let reports = reports.clone();
        reactor.set_exception_handler(move |_| {
            *reports.borrow_mut() += 1;
        });
    }

    let (client, _server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );

    client.channel.close(&mut reactor);

    assert!(client.channel.is_aborted());
    assert_eq!(client.channel.state(), ChannelState::Unwrapped);
    assert!(client.wire.borrow().aborted);

    let app = client.app.borrow();
    assert_eq!(app.made, 0);
    assert_eq!(app.lost, 1);
    assert!(app.lost_error.is_none(), "a local cancellation carries no error");
    assert_eq!(*reports.borrow(), 0);
}

#[test]
fn abort_discards_buffered_writes() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    client.channel.abort(&mut reactor);

    assert!(client.channel.is_aborted());
    assert!(client.wire.borrow().aborted);
    assert_eq!(client.app.borrow().lost, 1);

    // Writes after the abort are swallowed, not a panic.
    client.channel.write(&mut reactor, b"too late");
    assert_eq!(client.channel.write_backlog_len(), 0);
}

#[test]
fn handshake_timeout_tears_the_channel_down() {
    let mut reactor = Reactor::new();
    let reports = Rc::new(RefCell::new(0));
    {
        let reports = reports.clone();
        reactor.set_exception_handler(move |_| {
            *reports.borrow_mut() += 1;
        });
    }

    let client_config = ChannelConfig {
        handshake_timeout: Duration::from_millis(50),
        ..ChannelConfig::default()
    };
    // The peer never answers.
    let (client, _server) = secure_pair(&mut reactor, client_config, ChannelConfig::default());

    reactor.call_later(Duration::from_millis(250), |reactor| {
        reactor.stop();
        Ok(())
    });
    reactor.run_forever().unwrap();

    assert!(client.channel.is_aborted());
    assert!(client.wire.borrow().aborted);
    assert_eq!(*reports.borrow(), 1);

    let app = client.app.borrow();
    assert_eq!(app.lost, 1);
    assert!(
        app.lost_error.as_deref().unwrap().contains("timed out"),
        "got: {:?}",
        app.lost_error
    );
}

#[test]
fn transport_eof_without_close_notify_is_a_loss() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    assert!(!client.channel.eof_received(&mut reactor));

    assert!(client.channel.is_aborted());
    let app = client.app.borrow();
    assert_eq!(app.eof, 0, "a truncated stream is not a clean eof");
    assert_eq!(app.lost, 1);
    assert!(
        app.lost_error.as_deref().unwrap().contains("close_notify"),
        "got: {:?}",
        app.lost_error
    );
}

#[test]
fn reads_staged_while_paused_back_pressure_the_transport() {
    let mut reactor = Reactor::new();
    let client_config = ChannelConfig {
        read_high_water: 100,
        read_low_water: 40,
        ..ChannelConfig::default()
    };
    let (client, server) = secure_pair(&mut reactor, client_config, ChannelConfig::default());
    shuttle(&mut reactor, &client, &server);

    client.channel.pause_reading();
    server.channel.write(&mut reactor, &[b'z'; 200]);
    shuttle(&mut reactor, &client, &server);

    // Nothing delivered, everything staged, transport told to hold off.
    assert!(client.app.borrow().received.is_empty());
    assert!(client.wire.borrow().paused);
    assert_eq!(client.wire.borrow().pause_count, 1);

    client.channel.resume_reading(&mut reactor);

    assert_eq!(client.app.borrow().received, vec![b'z'; 200]);
    assert!(!client.wire.borrow().paused);
    assert_eq!(client.wire.borrow().resume_count, 1);
}

#[test]
fn buffer_fill_protocols_receive_without_data_received() {
    let mut reactor = Reactor::new();
    let (client_tls, server_tls) = test_tls_configs();

    let client_app = Rc::new(RefCell::new(AppEvents::default()));
    let client = endpoint(
        &mut reactor,
        TlsRole::Client {
            config: client_tls,
            server_name: ServerName::try_from("localhost").unwrap(),
        },
        ChannelConfig::default(),
        Box::new(RecordingProtocol {
            events: client_app.clone(),
        }),
        client_app,
    );

    let server_app = Rc::new(RefCell::new(AppEvents::default()));
    let server = endpoint(
        &mut reactor,
        TlsRole::Server { config: server_tls },
        ChannelConfig::default(),
        Box::new(FillProtocol {
            events: server_app.clone(),
            buf: [0; 8],
        }),
        server_app,
    );

    shuttle(&mut reactor, &client, &server);
    assert_eq!(server.app.borrow().made, 1);

    // Longer than the 8-byte fill buffer, so delivery takes several
    // rounds.
    client
        .channel
        .write(&mut reactor, b"thirty-three bytes of plaintext!!");
    shuttle(&mut reactor, &client, &server);

    assert_eq!(
        server.app.borrow().received,
        b"thirty-three bytes of plaintext!!"
    );
}

#[test]
#[should_panic(expected = "write on a closing secure channel")]
fn writing_to_a_closing_channel_panics() {
    let mut reactor = Reactor::new();
    let (client, server) = secure_pair(
        &mut reactor,
        ChannelConfig::default(),
        ChannelConfig::default(),
    );
    shuttle(&mut reactor, &client, &server);

    client.channel.close(&mut reactor);
    client.channel.write(&mut reactor, b"no");
}
