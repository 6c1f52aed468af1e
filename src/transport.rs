//! Transport and protocol trait seams.
//!
//! Concrete transports (stream sockets, pipes, subprocess I/O) live
//! outside this crate; the secure channel consumes whatever byte pipe the
//! embedder provides through [`Transport`], and delivers plaintext to the
//! embedder's [`Protocol`].

use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::tls::SecureChannel;

/// The plain byte pipe underneath a secure channel.
///
/// Implementations are driven entirely from the reactor thread; calls
/// arrive one at a time from the single callback sequence that owns the
/// channel. They may arrive while the channel is mid-update, so an
/// implementation must not call back into the channel synchronously;
/// follow-up work belongs on the reactor via
/// [`call_soon`](crate::Reactor::call_soon).
pub trait Transport {
    /// Queue `data` for delivery to the peer.
    fn write(&mut self, reactor: &mut Reactor, data: &[u8]) -> Result<()>;

    /// Whether the transport is closing or closed and writes would be
    /// discarded.
    fn is_closing(&self) -> bool;

    /// Close after delivering any buffered data.
    fn close(&mut self, reactor: &mut Reactor);

    /// Close immediately, discarding buffered data.
    fn abort(&mut self, reactor: &mut Reactor);

    /// Stop delivering incoming bytes until
    /// [`resume_reading`](Self::resume_reading).
    fn pause_reading(&mut self) {}

    /// Resume delivering incoming bytes.
    fn resume_reading(&mut self) {}
}

/// The application protocol layered on top of a secure channel.
///
/// Lifecycle callbacks fire at most once each, strictly in the order
/// `connection_made`, `eof_received`, `connection_lost`. Flow-control
/// notifications (`pause_writing`/`resume_writing`) fire exactly once per
/// watermark edge.
pub trait Protocol {
    /// The channel handshake completed; the channel is ready for
    /// [`write`](SecureChannel::write).
    fn connection_made(&mut self, reactor: &mut Reactor, channel: &SecureChannel);

    /// Decrypted application bytes arrived.
    ///
    /// Only called when [`supports_buffer_fill`](Self::supports_buffer_fill)
    /// is false.
    fn data_received(&mut self, reactor: &mut Reactor, data: &[u8]);

    /// The peer closed its write side cleanly.
    fn eof_received(&mut self, _reactor: &mut Reactor) -> bool {
        false
    }

    /// The channel is gone. `error` is `None` for a clean shutdown.
    fn connection_lost(&mut self, reactor: &mut Reactor, error: Option<&Error>);

    /// The channel's write backlog crossed its high watermark.
    fn pause_writing(&mut self) {}

    /// The channel's write backlog drained below its low watermark.
    fn resume_writing(&mut self) {}

    /// Capability flag selecting the zero-copy delivery strategy.
    ///
    /// When true, plaintext is written directly into the slice returned
    /// by [`get_buffer`](Self::get_buffer) and announced through
    /// [`buffer_updated`](Self::buffer_updated) instead of being copied
    /// through [`data_received`](Self::data_received).
    fn supports_buffer_fill(&self) -> bool {
        false
    }

    /// Expose a writable buffer of at least one byte.
    ///
    /// `size_hint` is the number of decrypted bytes currently pending.
    /// Invoked while the channel is mid-delivery; the implementation
    /// must not call back into the channel from here.
    fn get_buffer(&mut self, _size_hint: usize) -> &mut [u8] {
        &mut []
    }

    /// `n` bytes were written into the buffer returned by the preceding
    /// [`get_buffer`](Self::get_buffer) call.
    fn buffer_updated(&mut self, _reactor: &mut Reactor, _n: usize) {}
}
