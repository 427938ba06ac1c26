//! Certificate validation policy.
//!
//! The policy is decided per dial from the address alone. Under the default
//! policy only the canonical root address gets full chain and hostname
//! validation. Every other address (proxies, mirrors, alternate routes) is
//! dialed with validation relaxed, and callers are expected to authenticate
//! those peers some other way (see [`PinningTlsDialer`][super::pinning::PinningTlsDialer]).

use std::fmt;
use std::sync::Arc;

use crate::config::ROOT_ADDRESS;

/// How a single handshake validates the peer certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verification {
    /// Standard chain and hostname validation against the trusted roots.
    Full,

    /// Chain and hostname checks are skipped. Handshake signatures are still
    /// checked against the presented certificate.
    Relaxed,
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verification::Full => f.write_str("full"),
            Verification::Relaxed => f.write_str("relaxed"),
        }
    }
}

/// Chooses a [`Verification`] for each dialed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationPolicy {
    /// Full validation only when the address is byte-for-byte equal to the
    /// given canonical address, relaxed otherwise.
    ///
    /// No normalization happens: an IP literal, a different port or a
    /// different case all count as non-canonical.
    CanonicalRoot(Arc<str>),

    /// Always validate fully.
    AlwaysFull,

    /// Never validate the chain or hostname.
    AlwaysRelaxed,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        VerificationPolicy::canonical(ROOT_ADDRESS)
    }
}

impl VerificationPolicy {
    /// Full validation for `root` only.
    pub fn canonical(root: impl Into<Arc<str>>) -> Self {
        VerificationPolicy::CanonicalRoot(root.into())
    }

    /// Decide how a dial to `address` validates its peer.
    pub fn verification_for(&self, address: &str) -> Verification {
        match self {
            VerificationPolicy::CanonicalRoot(root) if address == &**root => Verification::Full,
            VerificationPolicy::CanonicalRoot(_) => Verification::Relaxed,
            VerificationPolicy::AlwaysFull => Verification::Full,
            VerificationPolicy::AlwaysRelaxed => Verification::Relaxed,
        }
    }
}
