//! Sans-IO TLS session wrapper.
//!
//! Wraps a `rustls` client or server connection behind one type so the
//! channel state machine is side-agnostic: ciphertext in via
//! [`read_tls`](TlsSession::read_tls), state advanced via
//! [`process_new_packets`](TlsSession::process_new_packets), ciphertext
//! out via [`write_tls`](TlsSession::write_tls).

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{
    ClientConfig, ClientConnection, IoState, ProtocolVersion, ServerConfig, ServerConnection,
    SupportedCipherSuite,
};

use crate::error::Result;

/// Which side of the handshake this channel plays, with its TLS
/// configuration.
pub enum TlsRole {
    /// Outbound connect-with-encryption (or in-place upgrade of the
    /// connecting side).
    Client {
        config: Arc<ClientConfig>,
        /// The peer hostname verified against the server certificate.
        server_name: ServerName<'static>,
    },

    /// Inbound accept-with-encryption (or in-place upgrade of the
    /// accepting side).
    Server { config: Arc<ServerConfig> },
}

/// Peer identity and cipher metadata surfaced once the handshake
/// completes.
#[derive(Clone)]
pub struct PeerInfo {
    pub protocol_version: Option<ProtocolVersion>,
    pub cipher_suite: Option<SupportedCipherSuite>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// A client or server `rustls` connection behind one interface.
pub(crate) enum TlsSession {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl TlsSession {
    pub(crate) fn new(role: TlsRole) -> Result<Self> {
        match role {
            TlsRole::Client {
                config,
                server_name,
            } => Ok(Self::Client(ClientConnection::new(config, server_name)?)),
            TlsRole::Server { config } => Ok(Self::Server(ServerConnection::new(config)?)),
        }
    }

    /// Whether the cryptographic handshake is still in progress.
    pub(crate) fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(conn) => conn.is_handshaking(),
            Self::Server(conn) => conn.is_handshaking(),
        }
    }

    /// Whether there is pending ciphertext to push to the transport.
    pub(crate) fn wants_write(&self) -> bool {
        match self {
            Self::Client(conn) => conn.wants_write(),
            Self::Server(conn) => conn.wants_write(),
        }
    }

    /// Feed incoming ciphertext from `rd`.
    pub(crate) fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.read_tls(rd),
            Self::Server(conn) => conn.read_tls(rd),
        }
    }

    /// Push pending outgoing ciphertext into `wr`.
    pub(crate) fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.write_tls(wr),
            Self::Server(conn) => conn.write_tls(wr),
        }
    }

    /// Advance the protocol state machine over buffered ciphertext.
    pub(crate) fn process_new_packets(&mut self) -> std::result::Result<IoState, rustls::Error> {
        match self {
            Self::Client(conn) => conn.process_new_packets(),
            Self::Server(conn) => conn.process_new_packets(),
        }
    }

    /// Queue plaintext for encryption. The session buffers internally;
    /// the returned count is always `data.len()` for a healthy session.
    pub(crate) fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.writer().write(data),
            Self::Server(conn) => conn.writer().write(data),
        }
    }

    /// Read decrypted plaintext into `buf`.
    ///
    /// Returns `Ok(0)` both for "no plaintext pending" (`WouldBlock`
    /// from the session reader) and for a clean end of stream; the
    /// caller distinguishes the two through
    /// [`IoState::peer_has_closed`].
    pub(crate) fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match self {
            Self::Client(conn) => conn.reader().read(buf),
            Self::Server(conn) => conn.reader().read(buf),
        };

        match result {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Queue the protocol's close notification.
    pub(crate) fn send_close_notify(&mut self) {
        match self {
            Self::Client(conn) => conn.send_close_notify(),
            Self::Server(conn) => conn.send_close_notify(),
        }
    }

    /// Capture peer identity and cipher metadata. Meaningful once the
    /// handshake has completed.
    pub(crate) fn peer_info(&self) -> PeerInfo {
        let (protocol_version, cipher_suite, alpn, certs) = match self {
            Self::Client(conn) => (
                conn.protocol_version(),
                conn.negotiated_cipher_suite(),
                conn.alpn_protocol().map(|p| p.to_vec()),
                conn.peer_certificates(),
            ),
            Self::Server(conn) => (
                conn.protocol_version(),
                conn.negotiated_cipher_suite(),
                conn.alpn_protocol().map(|p| p.to_vec()),
                conn.peer_certificates(),
            ),
        };

        PeerInfo {
            protocol_version,
            cipher_suite,
            alpn_protocol: alpn,
            peer_certificates: certs
                .map(|c| c.iter().map(|cert| cert.clone().into_owned()).collect())
                .unwrap_or_default(),
        }
    }
}
