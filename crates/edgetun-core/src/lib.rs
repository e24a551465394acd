//! edgetun-core: shared building blocks for the edgetun proxy.
//!
//! Provides the CDN edge CIDR tables and address classifier, the relay
//! control message, the error type, and the stream traits that both the
//! direct and relayed connection paths satisfy.

pub mod cidr;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use cidr::{AddressClassifier, Cidr};
pub use error::{EdgeError, EdgeResult};
pub use messages::ControlMessage;
pub use transport::{Connection, Deadlines};
