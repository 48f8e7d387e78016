//! gatehouse-tls: Per-host TLS behavior and certificate selection
//!
//! Hosts can pin a preferred certificate per SNI name or opt out of SNI
//! matching. The [`SniResolver`] consults a [`TlsBehaviorSource`] during every
//! handshake and picks the certificate accordingly.

pub mod behavior;
pub mod error;
pub mod sni;

pub use behavior::{HostTlsBehavior, TlsBehaviorSource};
pub use error::{Result, TlsError};
pub use sni::{CertKeyPair, SniResolver};
