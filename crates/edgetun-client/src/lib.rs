//! edgetun-client: the decision-and-tunneling engine.
//!
//! For every destination the SOCKS layer asks for, [`TunnelDialer`] decides
//! whether to open a plain TCP connection or to bootstrap a relay session
//! over a TLS WebSocket:
//!
//! 1. [`ReachabilityCache`] classifies the host, resolving names through
//!    [`DohResolver`] and matching addresses against the CDN edge ranges.
//! 2. The dialer connects directly or upgrades to the relay and sends the
//!    control message.
//! 3. The relay session is returned as a [`RelayStream`], a plain byte
//!    stream for the caller.

pub mod cache;
pub mod dialer;
pub mod resolver;
pub mod settings;
pub mod stream;
pub mod tls;

// Re-export primary public types.
pub use cache::{Classification, ReachabilityCache};
pub use dialer::{DialedStream, TunnelDialer};
pub use resolver::{DohResolver, Resolve};
pub use settings::{Endpoint, RelaySettings};
pub use stream::RelayStream;

// Re-export edgetun-core error types for convenience.
pub use edgetun_core::{EdgeError, EdgeResult};
