//! TLS requirement negotiation.
//!
//! Each side derives its own need purely from local configuration. The
//! remote need only decides whether the two are compatible and whether an
//! upgrade happens; it never changes what the local side demands.

use serde::Deserialize;

/// Local TLS/PSK policy for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsPolicy {
    /// Certificate-based TLS is configured.
    pub enable: bool,
    /// Refuse to proceed without an encrypted channel.
    pub require: bool,
    /// Use TLS for the handshake only and return to cleartext afterwards.
    pub authenticate_only: bool,
    /// Check the peer certificate.
    pub verify_peer: bool,
    /// Certificate identities accepted when `verify_peer` is set; empty accepts any.
    pub allowed_identities: Vec<String>,
    /// TLS with the shared secret as pre-shared key is available.
    pub psk_enable: bool,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            enable: false,
            require: false,
            authenticate_only: false,
            verify_peer: true,
            allowed_identities: Vec::new(),
            psk_enable: false,
        }
    }
}

impl TlsPolicy {
    fn has_mechanism(&self) -> bool {
        self.enable || self.psk_enable
    }
}

/// Security need declared by one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsNeed {
    /// Not advertised at all, e.g. an older Hello without `tlspsk=`.
    Off,
    /// Advertised, no encrypted channel possible.
    None,
    /// Encrypted channel possible but optional.
    Ok,
    /// Encrypted channel mandatory.
    Required,
}

impl TlsNeed {
    pub fn wire_code(&self) -> u8 {
        match self {
            TlsNeed::Off | TlsNeed::None => 0,
            TlsNeed::Ok => 1,
            TlsNeed::Required => 2,
        }
    }

    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => TlsNeed::None,
            1 => TlsNeed::Ok,
            _ => TlsNeed::Required,
        }
    }

    /// Need implied by a Hello `tlspsk=` flag, which advertises any TLS
    /// capability. The mechanism is settled later from the challenge `psk=` field.
    pub fn from_psk_flag(flag: Option<bool>) -> Self {
        match flag {
            None => TlsNeed::Off,
            Some(false) => TlsNeed::None,
            Some(true) => TlsNeed::Ok,
        }
    }

    pub fn is_capable(&self) -> bool {
        matches!(self, TlsNeed::Ok | TlsNeed::Required)
    }
}

/// Result of comparing local and remote needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRequirement {
    Ok,
    /// The local side requires something it cannot provide, or cannot meet a remote requirement.
    ErrorLocal,
    /// The remote side did not advertise what the local requirement needs.
    ErrorRemote,
}

/// Whether the connection upgrades after the proof exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedNeed {
    NotNeeded,
    Wanted,
    Required,
}

/// How the encrypted channel is keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMechanism {
    Psk,
    Certificate,
}

/// What the transport reports after a successful upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeOutcome {
    /// Identity from the peer certificate, when one was presented.
    pub peer_identity: Option<String>,
}

/// Outcome of [`TlsNegotiator::negotiate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub need: NegotiatedNeed,
    pub mechanism: Option<TlsMechanism>,
}

/// Computes and compares TLS needs for one handshake.
#[derive(Debug, Clone, Copy)]
pub struct TlsNegotiator<'a> {
    policy: &'a TlsPolicy,
    local_need: TlsNeed,
}

impl<'a> TlsNegotiator<'a> {
    pub fn new(policy: &'a TlsPolicy) -> Self {
        Self {
            policy,
            local_need: calc_local_need(policy),
        }
    }

    pub fn policy(&self) -> &'a TlsPolicy {
        self.policy
    }

    pub fn local_need(&self) -> TlsNeed {
        self.local_need
    }

    pub fn local_psk(&self) -> bool {
        self.policy.psk_enable
    }

    /// Check local against remote need before any upgrade is attempted.
    pub fn test_requirement(&self, remote: TlsNeed) -> TlsRequirement {
        if self.local_need == TlsNeed::Required && !self.policy.has_mechanism() {
            return TlsRequirement::ErrorLocal;
        }
        if self.local_need == TlsNeed::Required && !remote.is_capable() {
            return TlsRequirement::ErrorRemote;
        }
        if remote == TlsNeed::Required && !self.local_need.is_capable() {
            return TlsRequirement::ErrorLocal;
        }
        TlsRequirement::Ok
    }

    /// Decide the upgrade. Both peers reach the same answer from the same
    /// announcements, so neither side upgrades alone.
    pub fn negotiate(&self, remote: TlsNeed, remote_psk: bool) -> Negotiated {
        if !self.local_need.is_capable() || !remote.is_capable() {
            return Negotiated {
                need: NegotiatedNeed::NotNeeded,
                mechanism: None,
            };
        }

        let need = if self.local_need == TlsNeed::Required || remote == TlsNeed::Required {
            NegotiatedNeed::Required
        } else {
            NegotiatedNeed::Wanted
        };

        let mechanism = if self.policy.psk_enable && remote_psk {
            TlsMechanism::Psk
        } else {
            TlsMechanism::Certificate
        };

        Negotiated {
            need,
            mechanism: Some(mechanism),
        }
    }
}

/// Local need derived from configuration alone.
pub fn calc_local_need(policy: &TlsPolicy) -> TlsNeed {
    if policy.require {
        TlsNeed::Required
    } else if policy.has_mechanism() {
        TlsNeed::Ok
    } else {
        TlsNeed::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enable: bool, require: bool, psk: bool) -> TlsPolicy {
        TlsPolicy {
            enable,
            require,
            psk_enable: psk,
            ..TlsPolicy::default()
        }
    }

    #[test]
    fn test_calc_local_need() {
        assert_eq!(calc_local_need(&policy(false, false, false)), TlsNeed::None);
        assert_eq!(calc_local_need(&policy(true, false, false)), TlsNeed::Ok);
        assert_eq!(calc_local_need(&policy(false, false, true)), TlsNeed::Ok);
        assert_eq!(calc_local_need(&policy(true, true, false)), TlsNeed::Required);
    }

    #[test]
    fn test_required_without_remote_capability_is_remote_error() {
        let local = policy(true, true, true);
        let negotiator = TlsNegotiator::new(&local);
        for remote in [TlsNeed::Off, TlsNeed::None] {
            assert_eq!(negotiator.test_requirement(remote), TlsRequirement::ErrorRemote);
        }
        assert_eq!(negotiator.test_requirement(TlsNeed::Ok), TlsRequirement::Ok);
    }

    #[test]
    fn test_required_without_mechanism_is_local_error() {
        let local = policy(false, true, false);
        let negotiator = TlsNegotiator::new(&local);
        assert_eq!(negotiator.test_requirement(TlsNeed::Ok), TlsRequirement::ErrorLocal);
    }

    #[test]
    fn test_remote_requirement_we_cannot_meet() {
        let local = policy(false, false, false);
        let negotiator = TlsNegotiator::new(&local);
        assert_eq!(
            negotiator.test_requirement(TlsNeed::Required),
            TlsRequirement::ErrorLocal
        );
        assert_eq!(negotiator.test_requirement(TlsNeed::Ok), TlsRequirement::Ok);
    }

    #[test]
    fn test_remote_capability_does_not_change_local_need() {
        let local = policy(true, false, false);
        let negotiator = TlsNegotiator::new(&local);
        let before = negotiator.local_need();
        let _ = negotiator.test_requirement(TlsNeed::Required);
        let _ = negotiator.negotiate(TlsNeed::Required, true);
        assert_eq!(negotiator.local_need(), before);
    }

    #[test]
    fn test_psk_preferred_when_both_advertise() {
        let local = policy(true, false, true);
        let negotiator = TlsNegotiator::new(&local);

        let both = negotiator.negotiate(TlsNeed::Ok, true);
        assert_eq!(both.need, NegotiatedNeed::Wanted);
        assert_eq!(both.mechanism, Some(TlsMechanism::Psk));

        let cert_only = negotiator.negotiate(TlsNeed::Ok, false);
        assert_eq!(cert_only.mechanism, Some(TlsMechanism::Certificate));
    }

    #[test]
    fn test_negotiation_is_symmetric() {
        let a = policy(false, true, true);
        let b = policy(true, false, true);
        let from_a = TlsNegotiator::new(&a).negotiate(calc_local_need(&b), b.psk_enable);
        let from_b = TlsNegotiator::new(&b).negotiate(calc_local_need(&a), a.psk_enable);
        assert_eq!(from_a, from_b);
        assert_eq!(from_a.need, NegotiatedNeed::Required);
    }

    #[test]
    fn test_no_upgrade_when_either_side_incapable() {
        let local = policy(true, false, true);
        let negotiator = TlsNegotiator::new(&local);
        assert_eq!(
            negotiator.negotiate(TlsNeed::Off, false).need,
            NegotiatedNeed::NotNeeded
        );
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(TlsNeed::from_wire(2), TlsNeed::Required);
        assert_eq!(TlsNeed::Off.wire_code(), 0);
        assert_eq!(TlsNeed::from_psk_flag(None), TlsNeed::Off);
        assert_eq!(TlsNeed::from_psk_flag(Some(true)), TlsNeed::Ok);
    }
}
