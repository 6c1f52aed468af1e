//! The layered secure-channel protocol state machine.
//!
//! A [`SecureChannel`] sits between a plain [`Transport`] and an
//! application [`Protocol`]. It consumes the reactor's scheduling
//! primitives for its handshake and shutdown timers, feeds incoming
//! ciphertext through the TLS session, delivers decrypted bytes upward,
//! and drains the application write backlog through the encryption layer
//! with independent flow control in both directions.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};

use super::engine::{PeerInfo, TlsRole, TlsSession};
use super::flow::{FlowControl, FlowEvent};
use super::state::{AppState, ChannelState};
use crate::error::{Error, Result};
use crate::handle::TimerHandle;
use crate::reactor::{ExceptionContext, Reactor};
use crate::transport::{Protocol, Transport};

/// Configuration for a secure channel.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Bound on the whole handshake, from upgrade to completion.
    pub handshake_timeout: Duration,

    /// Bound on the flush-and-close-notify shutdown sequence.
    pub shutdown_timeout: Duration,

    /// Application-write backlog watermarks driving
    /// `pause_writing`/`resume_writing` on the upper protocol.
    pub write_high_water: usize,
    pub write_low_water: usize,

    /// Undelivered-plaintext watermarks driving
    /// `pause_reading`/`resume_reading` on the lower transport.
    pub read_high_water: usize,
    pub read_low_water: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            write_high_water: 64 * 1024,
            write_low_water: 16 * 1024,
            read_high_water: 64 * 1024,
            read_low_water: 16 * 1024,
        }
    }
}

struct ChannelInner {
    session: TlsSession,
    transport: Box<dyn Transport>,

    /// Taken out of the slot for the duration of each upcall so the
    /// protocol may re-enter the channel.
    protocol: Option<Box<dyn Protocol>>,

    state: ChannelState,
    app_state: AppState,
    config: ChannelConfig,

    /// Plaintext writes not yet consumed by the encryption layer.
    /// Partially consumed head entries are sliced in place via
    /// `backlog_offset`.
    backlog: VecDeque<Vec<u8>>,
    backlog_offset: usize,
    backlog_bytes: usize,

    /// Staged outgoing ciphertext, coalesced into one transport write.
    outgoing: Vec<u8>,

    /// Decrypted bytes not yet delivered (the application paused us).
    staged_plain: Vec<u8>,

    write_flow: FlowControl,
    read_flow: FlowControl,

    /// Set by the application via `pause_reading`.
    app_paused_reading: bool,

    handshake_timer: Option<TimerHandle>,
    shutdown_timer: Option<TimerHandle>,

    peer_info: Option<PeerInfo>,

    /// Set once by the force-close path; every buffer operation is a
    /// no-op afterwards.
    aborted: bool,
}

/// A secure channel over a plain transport.
///
/// Cheap to clone; all clones refer to the same connection. The channel
/// registers as the transport's protocol: the transport owner forwards
/// `data_received`, `eof_received`, and `connection_lost` into it.
#[derive(Clone)]
pub struct SecureChannel {
    inner: Rc<RefCell<ChannelInner>>,
}

/// Layer a secure channel over `transport`.
///
/// All three entry paths (outbound connect-with-encryption, inbound
/// accept-with-encryption, in-place upgrade of an established plaintext
/// transport) funnel through here. The handshake starts immediately,
/// bounded by `config.handshake_timeout`; `protocol.connection_made`
/// fires once it completes.
pub fn upgrade_to_secure(
    reactor: &mut Reactor,
    transport: Box<dyn Transport>,
    protocol: Box<dyn Protocol>,
    role: TlsRole,
    config: ChannelConfig,
) -> Result<SecureChannel> {
    debug_assert!(config.write_low_water <= config.write_high_water);
    debug_assert!(config.read_low_water <= config.read_high_water);

    let session = TlsSession::new(role)?;

    let channel = SecureChannel {
        inner: Rc::new(RefCell::new(ChannelInner {
            session,
            transport,
            protocol: Some(protocol),
            state: ChannelState::Unwrapped,
            app_state: AppState::Init,
            write_flow: FlowControl::new(config.write_high_water, config.write_low_water),
            read_flow: FlowControl::new(config.read_high_water, config.read_low_water),
            config,
            backlog: VecDeque::new(),
            backlog_offset: 0,
            backlog_bytes: 0,
            outgoing: Vec::new(),
            staged_plain: Vec::new(),
            app_paused_reading: false,
            handshake_timer: None,
            shutdown_timer: None,
            peer_info: None,
            aborted: false,
        })),
    };

    channel.start_handshake(reactor);
    Ok(channel)
}

impl SecureChannel {
    /// The current channel state.
    pub fn state(&self) -> ChannelState {
        self.inner.borrow().state
    }

    /// The current application-callback state.
    pub fn app_state(&self) -> AppState {
        self.inner.borrow().app_state
    }

    /// Peer identity and cipher metadata; `None` until the handshake
    /// has completed.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.inner.borrow().peer_info.clone()
    }

    /// Bytes of plaintext queued but not yet consumed by the
    /// encryption layer.
    pub fn write_backlog_len(&self) -> usize {
        self.inner.borrow().backlog_bytes
    }

    /// Whether the channel has been force-closed.
    pub fn is_aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    // -- application-facing surface ------------------------------------

    /// Queue application bytes for encrypted delivery.
    ///
    /// Writes are accepted from the moment of the upgrade; bytes queued
    /// during the handshake drain once it completes. After a force
    /// close this is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if called after [`close`](Self::close) has begun shutting
    /// the channel down; writing to a closing channel is a programming
    /// error.
    pub fn write(&self, reactor: &mut Reactor, data: &[u8]) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            assert!(
                !matches!(
                    inner.state,
                    ChannelState::Flushing | ChannelState::ShuttingDown
                ),
                "write on a closing secure channel"
            );
            if data.is_empty() {
                return;
            }

            inner.backlog.push_back(data.to_vec());
            inner.backlog_bytes += data.len();
        }

        self.drain_backlog(reactor);
    }

    /// Begin an orderly shutdown.
    ///
    /// Any remaining backlog is flushed first (without accepting new
    /// writes), then the close notification is sent and the peer's
    /// acknowledgement awaited, bounded by the shutdown timeout.
    pub fn close(&self, reactor: &mut Reactor) {
        let action = {
            let inner = self.inner.borrow();
            if inner.aborted {
                return;
            }
            match inner.state {
                ChannelState::Unwrapped => return,
                ChannelState::Flushing | ChannelState::ShuttingDown => return,
                ChannelState::Handshaking => CloseAction::AbortHandshake,
                ChannelState::Open => {
                    if inner.backlog_bytes > 0 {
                        CloseAction::Flush
                    } else {
                        CloseAction::SendCloseNotify
                    }
                }
            }
        };

        match action {
            CloseAction::AbortHandshake => {
                self.fatal_error(reactor, Error::Cancelled, "secure channel closed mid-handshake");
            }
            CloseAction::Flush => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.state = inner.state.transition(ChannelState::Flushing);
                }
                trace!("secure channel flushing before shutdown");
                self.arm_shutdown_timer(reactor);
                self.drain_backlog(reactor);
            }
            CloseAction::SendCloseNotify => {
                self.arm_shutdown_timer(reactor);
                self.begin_shutdown_send(reactor);
            }
        }
    }

    /// Force-close the channel, discarding buffered data.
    pub fn abort(&self, reactor: &mut Reactor) {
        self.fatal_error(reactor, Error::Cancelled, "secure channel aborted");
    }

    /// Stop delivering plaintext to the application protocol.
    ///
    /// Bytes decrypted while paused are staged; once the staging buffer
    /// crosses the read high watermark the underlying transport is
    /// paused, exactly once.
    pub fn pause_reading(&self) {
        self.inner.borrow_mut().app_paused_reading = true;
    }

    /// Resume plaintext delivery, draining anything staged.
    pub fn resume_reading(&self, reactor: &mut Reactor) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.app_paused_reading = false;
        }
        self.pump_reads(reactor);
    }

    // -- transport-facing surface (the channel is the transport's
    //    protocol) ------------------------------------------------------

    /// Incoming ciphertext from the underlying transport.
    ///
    /// The session's decrypted-plaintext buffer is bounded, so a large
    /// burst is fed in rounds: whenever the session reports it is full,
    /// buffered plaintext is delivered upward before the rest of the
    /// chunk is fed.
    pub fn data_received(&self, reactor: &mut Reactor, data: &[u8]) {
        if self.inner.borrow().aborted {
            return;
        }

        let mut cursor = data;
        let mut peer_closed = false;

        loop {
            let remaining = cursor.len();
            let outcome = match self.try_feed(&mut cursor) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Push any queued alert to the peer before tearing down.
                    self.flush_transport(reactor);
                    self.fatal_error(reactor, err, "secure channel protocol failure");
                    return;
                }
            };
            peer_closed |= outcome.peer_closed;

            if self.inner.borrow().state == ChannelState::Handshaking {
                if peer_closed {
                    self.fatal_error(
                        reactor,
                        Error::ConnectionLost("peer closed during handshake".into()),
                        "secure channel handshake aborted by peer",
                    );
                    return;
                }
                if self.inner.borrow().session.is_handshaking() {
                    // Needs more data: push pending flight, wait for more.
                    self.flush_transport(reactor);
                    return;
                }
                self.finish_handshake(reactor);
            }

            self.pump_reads(reactor);
            if self.inner.borrow().aborted {
                return;
            }

            if !outcome.session_full {
                break;
            }
            if cursor.len() == remaining {
                // Neither feeding nor delivery progressed.
                break;
            }
        }

        if peer_closed {
            self.on_peer_close(reactor);
            return;
        }

        self.flush_transport(reactor);
    }

    /// The underlying transport hit end-of-file without a close
    /// notification.
    pub fn eof_received(&self, reactor: &mut Reactor) -> bool {
        let state = {
            let inner = self.inner.borrow();
            if inner.aborted {
                return false;
            }
            inner.state
        };

        let message = match state {
            ChannelState::Handshaking => "transport eof during handshake",
            _ => "transport eof without close_notify",
        };
        self.fatal_error(
            reactor,
            Error::ConnectionLost(message.into()),
            message,
        );
        false
    }

    /// The underlying transport was lost.
    pub fn connection_lost(&self, reactor: &mut Reactor, error: Option<&Error>) {
        let fire = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted && inner.app_state == AppState::ConnectionLost {
                return;
            }
            inner.aborted = true;
            Self::cancel_timers(&mut inner);
            inner.state = inner.state.transition(ChannelState::Unwrapped);
            Self::drop_buffers(&mut inner);
            inner.app_state.advance(AppState::ConnectionLost)
        };

        if fire {
            if let Some(mut protocol) = self.take_protocol() {
                protocol.connection_lost(reactor, error);
            }
        }
    }

    // -- handshake ------------------------------------------------------

    fn start_handshake(&self, reactor: &mut Reactor) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.state = inner.state.transition(ChannelState::Handshaking);

            let channel = self.clone();
            let timeout = inner.config.handshake_timeout;
            inner.handshake_timer = Some(reactor.call_later(timeout, move |reactor| {
                channel.on_handshake_timeout(reactor);
                Ok(())
            }));
        }

        trace!("secure channel handshake started");
        // The client side has an initial flight to send; the server
        // side flushes nothing and waits.
        self.flush_transport(reactor);
    }

    fn on_handshake_timeout(&self, reactor: &mut Reactor) {
        if self.inner.borrow().state != ChannelState::Handshaking {
            return;
        }
        self.fatal_error(reactor, Error::HandshakeTimeout, "secure channel handshake timed out");
    }

    fn finish_handshake(&self, reactor: &mut Reactor) {
        let fire = {
            let mut inner = self.inner.borrow_mut();
            inner.state = inner.state.transition(ChannelState::Open);
            if let Some(timer) = inner.handshake_timer.take() {
                timer.cancel();
            }
            inner.peer_info = Some(inner.session.peer_info());
            inner.app_state.advance(AppState::ConnectionMade)
        };

        debug!("secure channel handshake completed");

        if fire {
            if let Some(mut protocol) = self.take_protocol() {
                protocol.connection_made(reactor, self);
                self.restore_protocol(protocol);
            }
        }

        // Writes queued during the handshake drain now.
        self.drain_backlog(reactor);
    }

    // -- inbound data path ---------------------------------------------

    /// Feed ciphertext into the session, advancing its state machine.
    ///
    /// Stops early when the session's plaintext buffer fills; the
    /// caller delivers buffered plaintext and feeds the rest.
    fn try_feed(&self, cursor: &mut &[u8]) -> Result<FeedOutcome> {
        let mut inner = self.inner.borrow_mut();
        let mut outcome = FeedOutcome {
            peer_closed: false,
            session_full: false,
        };

        while !cursor.is_empty() {
            let n = match inner.session.read_tls(cursor) {
                Ok(n) => n,
                // The reader is an in-memory slice and cannot fail; an
                // i/o error here means the session refuses more input
                // until its plaintext buffer is drained.
                Err(_) => {
                    outcome.session_full = true;
                    break;
                }
            };
            if n == 0 {
                break;
            }
            let io_state = inner.session.process_new_packets()?;
            outcome.peer_closed |= io_state.peer_has_closed();
        }

        Ok(outcome)
    }

    /// Deliver decrypted plaintext upward until the session runs dry or
    /// the application pauses us, then update read-side flow control.
    fn pump_reads(&self, reactor: &mut Reactor) {
        loop {
            {
                let inner = self.inner.borrow();
                if inner.aborted
                    || !matches!(
                        inner.state,
                        ChannelState::Open | ChannelState::Flushing | ChannelState::ShuttingDown
                    )
                {
                    return;
                }
                if inner.app_paused_reading {
                    break;
                }
            }

            let staged = {
                let mut inner = self.inner.borrow_mut();
                if inner.staged_plain.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut inner.staged_plain))
                }
            };

            if let Some(chunk) = staged {
                if !self.deliver_chunk(reactor, chunk) {
                    break;
                }
                continue;
            }

            if !self.deliver_fresh(reactor) {
                break;
            }
        }

        // While paused, decrypt into the staging buffer so the session
        // never sits on unbounded plaintext.
        if self.inner.borrow().app_paused_reading {
            if let Err(err) = self.stage_remaining() {
                self.fatal_error(reactor, err, "error decrypting buffered data");
                return;
            }
        }

        self.update_read_flow();
    }

    /// Deliver one staged chunk. Returns false when delivery should
    /// stop (pause, loss, or a zero-sized fill buffer).
    fn deliver_chunk(&self, reactor: &mut Reactor, chunk: Vec<u8>) -> bool {
        let Some(mut protocol) = self.take_protocol() else {
            return false;
        };

        let mut keep_going = true;
        if protocol.supports_buffer_fill() {
            let mut offset = 0;
            while offset < chunk.len() {
                let n = {
                    let buf = protocol.get_buffer(chunk.len() - offset);
                    if buf.is_empty() {
                        break;
                    }
                    let n = buf.len().min(chunk.len() - offset);
                    buf[..n].copy_from_slice(&chunk[offset..offset + n]);
                    n
                };
                protocol.buffer_updated(reactor, n);
                offset += n;

                if self.inner.borrow().app_paused_reading {
                    break;
                }
            }
            if offset < chunk.len() {
                let mut inner = self.inner.borrow_mut();
                let mut rest = chunk[offset..].to_vec();
                rest.extend_from_slice(&inner.staged_plain);
                inner.staged_plain = rest;
                keep_going = false;
            }
        } else {
            protocol.data_received(reactor, &chunk);
            if self.inner.borrow().app_paused_reading {
                keep_going = false;
            }
        }

        self.restore_protocol(protocol);
        keep_going && !self.inner.borrow().aborted
    }

    /// Decrypt directly from the session and deliver one round.
    /// Returns false when the session has no more plaintext.
    fn deliver_fresh(&self, reactor: &mut Reactor) -> bool {
        let Some(mut protocol) = self.take_protocol() else {
            return false;
        };

        let fill = protocol.supports_buffer_fill();
        let result = if fill {
            let read = {
                let mut inner = self.inner.borrow_mut();
                let buf = protocol.get_buffer(4096);
                if buf.is_empty() {
                    Ok(0)
                } else {
                    inner.session.read_plaintext(buf)
                }
            };
            match read {
                Ok(0) => Ok(false),
                Ok(n) => {
                    protocol.buffer_updated(reactor, n);
                    Ok(true)
                }
                Err(err) => Err(err),
            }
        } else {
            let mut scratch = [0u8; 4096];
            let read = {
                let mut inner = self.inner.borrow_mut();
                inner.session.read_plaintext(&mut scratch)
            };
            match read {
                Ok(0) => Ok(false),
                Ok(n) => {
                    protocol.data_received(reactor, &scratch[..n]);
                    Ok(true)
                }
                Err(err) => Err(err),
            }
        };

        self.restore_protocol(protocol);

        match result {
            Ok(progressed) => progressed && !self.inner.borrow().aborted,
            Err(err) => {
                self.fatal_error(reactor, err.into(), "error reading decrypted data");
                false
            }
        }
    }

    /// Move any remaining session plaintext into the staging buffer.
    fn stage_remaining(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let mut scratch = [0u8; 4096];
        loop {
            let n = inner.session.read_plaintext(&mut scratch)?;
            if n == 0 {
                return Ok(());
            }
            inner.staged_plain.extend_from_slice(&scratch[..n]);
        }
    }

    /// The peer sent its close notification.
    fn on_peer_close(&self, reactor: &mut Reactor) {
        let state = self.inner.borrow().state;
        match state {
            ChannelState::Open | ChannelState::Flushing => {
                // Peer-initiated shutdown: deliver eof semantics first,
                // then acknowledge and close.
                let fire = self
                    .inner
                    .borrow_mut()
                    .app_state
                    .advance(AppState::EndOfFile);
                if fire {
                    if let Some(mut protocol) = self.take_protocol() {
                        let _ = protocol.eof_received(reactor);
                        self.restore_protocol(protocol);
                    }
                }

                self.arm_shutdown_timer(reactor);
                self.begin_shutdown_send(reactor);
                self.complete_shutdown(reactor);
            }
            ChannelState::ShuttingDown => {
                // Our close notification has been acknowledged.
                self.complete_shutdown(reactor);
            }
            _ => {}
        }
    }

    // -- outbound data path --------------------------------------------

    /// Push backlog plaintext through the encryption layer and flush
    /// the resulting ciphertext.
    ///
    /// The session's sendable buffer is bounded, so encrypting and
    /// flushing alternate until the backlog is empty or neither side
    /// makes progress. Write-side flow control is updated from the
    /// final backlog size.
    fn drain_backlog(&self, reactor: &mut Reactor) {
        loop {
            let before = self.inner.borrow().backlog_bytes;
            if before == 0 {
                break;
            }

            if let Err(err) = self.try_drain_backlog() {
                self.fatal_error(reactor, err, "error encrypting buffered writes");
                return;
            }
            self.flush_transport(reactor);

            let inner = self.inner.borrow();
            if inner.aborted || inner.backlog_bytes == 0 || inner.backlog_bytes == before {
                break;
            }
        }

        self.flush_transport(reactor);
        self.update_write_flow();

        let proceed = {
            let inner = self.inner.borrow();
            inner.state == ChannelState::Flushing && inner.backlog_bytes == 0
        };
        if proceed {
            self.begin_shutdown_send(reactor);
        }
    }

    fn try_drain_backlog(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.aborted
            || !matches!(inner.state, ChannelState::Open | ChannelState::Flushing)
        {
            return Ok(());
        }

        loop {
            let ChannelInner {
                session,
                backlog,
                backlog_offset,
                backlog_bytes,
                ..
            } = &mut *inner;

            let Some(front) = backlog.front() else {
                break;
            };

            let n = session.write_plaintext(&front[*backlog_offset..])?;
            if n == 0 {
                break;
            }

            *backlog_offset += n;
            *backlog_bytes -= n;
            if *backlog_offset == front.len() {
                backlog.pop_front();
                *backlog_offset = 0;
            }
        }

        Ok(())
    }

    /// Extract pending ciphertext from the session, coalesce it, and
    /// hand it to the transport as a single write.
    fn flush_transport(&self, reactor: &mut Reactor) {
        let result = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }

            let ChannelInner {
                session,
                outgoing,
                transport,
                ..
            } = &mut *inner;

            let mut result = Ok(());
            while session.wants_write() {
                if let Err(err) = session.write_tls(outgoing) {
                    result = Err(Error::from(err));
                    break;
                }
            }

            if result.is_ok() && !outgoing.is_empty() && !transport.is_closing() {
                let buf = std::mem::take(outgoing);
                result = transport.write(reactor, &buf);
            }
            result
        };

        if let Err(err) = result {
            self.fatal_error(reactor, err, "error writing to the underlying transport");
        }
    }

    // -- shutdown -------------------------------------------------------

    fn arm_shutdown_timer(&self, reactor: &mut Reactor) {
        let mut inner = self.inner.borrow_mut();
        if inner.shutdown_timer.is_some() {
            return;
        }

        let channel = self.clone();
        let timeout = inner.config.shutdown_timeout;
        inner.shutdown_timer = Some(reactor.call_later(timeout, move |reactor| {
            channel.on_shutdown_timeout(reactor);
            Ok(())
        }));
    }

    fn on_shutdown_timeout(&self, reactor: &mut Reactor) {
        let state = self.inner.borrow().state;
        if !matches!(
            state,
            ChannelState::Flushing | ChannelState::ShuttingDown
        ) {
            return;
        }
        self.fatal_error(reactor, Error::ShutdownTimeout, "secure channel shutdown timed out");
    }

    /// Send the close notification and await the peer's acknowledgement.
    fn begin_shutdown_send(&self, reactor: &mut Reactor) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted || inner.state == ChannelState::ShuttingDown {
                // Already sent; flush below in case it is still staged.
            } else {
                inner.state = inner.state.transition(ChannelState::ShuttingDown);
                inner.session.send_close_notify();
                trace!("secure channel close_notify queued");
            }
        }

        self.flush_transport(reactor);
    }

    /// Both close notifications have been exchanged: close the
    /// transport and report the orderly loss.
    fn complete_shutdown(&self, reactor: &mut Reactor) {
        let fire = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            Self::cancel_timers(&mut inner);
            inner.state = inner.state.transition(ChannelState::Unwrapped);
            inner.transport.close(reactor);
            inner.app_state.advance(AppState::ConnectionLost)
        };

        debug!("secure channel shutdown complete");

        if fire {
            if let Some(mut protocol) = self.take_protocol() {
                protocol.connection_lost(reactor, None);
            }
        }
    }

    // -- failure --------------------------------------------------------

    /// The single error funnel: force-close the transport, report the
    /// error (unless it is a benign cancellation), and deliver
    /// `connection_lost`. Idempotent; all buffer operations are no-ops
    /// afterwards.
    fn fatal_error(&self, reactor: &mut Reactor, err: Error, message: &str) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            Self::cancel_timers(&mut inner);
            inner.state = inner.state.transition(ChannelState::Unwrapped);
            Self::drop_buffers(&mut inner);
            inner.transport.abort(reactor);
        }

        if !err.is_cancellation() {
            let context = ExceptionContext {
                message: message.to_string(),
                error: Some(&err),
                location: None,
            };
            reactor.call_exception_handler(&context);
        }

        let fire = self
            .inner
            .borrow_mut()
            .app_state
            .advance(AppState::ConnectionLost);
        if fire {
            if let Some(mut protocol) = self.take_protocol() {
                let reported = if err.is_cancellation() {
                    None
                } else {
                    Some(&err)
                };
                protocol.connection_lost(reactor, reported);
            }
        }
    }

    // -- flow control ---------------------------------------------------

    fn update_write_flow(&self) {
        let event = {
            let mut inner = self.inner.borrow_mut();
            // Flushing fires no flow-control callbacks.
            if inner.aborted || inner.state == ChannelState::Flushing {
                None
            } else {
                let buffered = inner.backlog_bytes;
                inner.write_flow.record(buffered)
            }
        };

        if let Some(event) = event {
            if let Some(mut protocol) = self.take_protocol() {
                match event {
                    FlowEvent::Pause => protocol.pause_writing(),
                    FlowEvent::Resume => protocol.resume_writing(),
                }
                self.restore_protocol(protocol);
            }
        }
    }

    fn update_read_flow(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.aborted {
            return;
        }

        let buffered = inner.staged_plain.len();
        match inner.read_flow.record(buffered) {
            Some(FlowEvent::Pause) => inner.transport.pause_reading(),
            Some(FlowEvent::Resume) => inner.transport.resume_reading(),
            None => {}
        }
    }

    // -- plumbing -------------------------------------------------------

    fn take_protocol(&self) -> Option<Box<dyn Protocol>> {
        self.inner.borrow_mut().protocol.take()
    }

    fn restore_protocol(&self, protocol: Box<dyn Protocol>) {
        let mut inner = self.inner.borrow_mut();
        // Once the loss has been delivered the protocol stays detached.
        if inner.app_state != AppState::ConnectionLost {
            inner.protocol = Some(protocol);
        }
    }

    fn cancel_timers(inner: &mut ChannelInner) {
        if let Some(timer) = inner.handshake_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = inner.shutdown_timer.take() {
            timer.cancel();
        }
    }

    fn drop_buffers(inner: &mut ChannelInner) {
        inner.backlog.clear();
        inner.backlog_offset = 0;
        inner.backlog_bytes = 0;
        inner.outgoing.clear();
        inner.staged_plain.clear();
    }
}

enum CloseAction {
    AbortHandshake,
    Flush,
    SendCloseNotify,
}

/// The result of one ciphertext feed round.
struct FeedOutcome {
    /// The peer's close notification was seen.
    peer_closed: bool,

    /// The session stopped accepting input until its plaintext buffer
    /// is drained.
    session_full: bool,
}
