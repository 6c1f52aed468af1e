//! Secure-channel state machines.

/// The lifecycle state of a secure channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// No TLS layer is active.
    Unwrapped,

    /// The cryptographic handshake is in progress.
    Handshaking,

    /// Application data flows in both directions.
    Open,

    /// Draining the write backlog before shutting down; no new writes
    /// are accepted.
    Flushing,

    /// The close notification has been sent; awaiting the peer's.
    ShuttingDown,
}

impl ChannelState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// A forced abort to [`Unwrapped`](Self::Unwrapped) is legal from
    /// any state.
    pub fn can_transition(self, next: ChannelState) -> bool {
        use ChannelState::*;

        matches!(
            (self, next),
            (Unwrapped, Handshaking)
                | (Handshaking, Open)
                | (Open, Flushing)
                | (Open, ShuttingDown)
                | (Flushing, ShuttingDown)
                | (_, Unwrapped)
        )
    }

    /// Perform a transition.
    ///
    /// # Panics
    ///
    /// Panics on any transition not listed in the table; such a call is
    /// a programming error, not a runtime condition.
    #[must_use]
    pub fn transition(self, next: ChannelState) -> ChannelState {
        assert!(
            self.can_transition(next),
            "invalid secure-channel transition: {self:?} -> {next:?}"
        );
        next
    }
}

/// The application-callback ladder.
///
/// Strictly monotonic: each of `connection_made`, `eof_received`, and
/// `connection_lost` fires at most once and only in this order. States
/// may be skipped (a connection lost during the handshake never saw
/// `connection_made`), never revisited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AppState {
    Init,
    ConnectionMade,
    EndOfFile,
    ConnectionLost,
}

impl AppState {
    /// Advance the ladder. Returns false (without modifying the state)
    /// when `next` would repeat or regress, in which case the matching
    /// callback must not fire.
    pub fn advance(&mut self, next: AppState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}
