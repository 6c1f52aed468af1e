//! # Cyclos
//!
//! **Cyclos** is a single-threaded, run-to-completion callback reactor
//! for Rust, designed as the event-dispatch layer for the **Nebula**
//! ecosystem.
//!
//! Unlike future-based runtimes, Cyclos keeps the explicit
//! handle/callback model: ordering and cancellation guarantees are part
//! of the observable contract. It offers:
//!
//! - A **callback scheduler** (`call_soon`, `call_later`, `call_at`)
//!   with FIFO ordering, deadline-ordered timers, and one-shot
//!   cancellable handles
//! - An **OS-readiness multiplexer** over epoll (Linux) and kqueue
//!   (macOS) with per-descriptor reader/writer registrations
//! - **Cross-thread submission** through a `Send + Clone` remote
//!   scheduler paired with a poller wake-up
//! - A **layered TLS secure channel** with handshake/shutdown timers
//!   and watermark flow control in both directions, powered by `rustls`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cyclos::Reactor;
//!
//! let mut reactor = Reactor::new();
//!
//! reactor.call_soon(|reactor| {
//!     println!("running on the reactor");
//!     reactor.stop();
//!     Ok(())
//! });
//!
//! reactor.run_forever().unwrap();
//! reactor.close();
//! ```
//!
//! ## Modules
//!
//! - [`tls`]: the secure-channel protocol layered on a plain transport
//! - [`transport`]: the `Transport`/`Protocol` trait seams

mod completion;
mod error;
mod handle;
mod reactor;

pub mod tls;
pub mod transport;

pub use completion::Completion;
pub use error::{Error, Result};
pub use handle::{Handle, TimerHandle};
pub use reactor::{ExceptionContext, ExceptionHandler, Reactor, RemoteHandle, RemoteScheduler};
pub use tls::{
    AppState, ChannelConfig, ChannelState, PeerInfo, SecureChannel, TlsRole, upgrade_to_secure,
};
pub use transport::{Protocol, Transport};
