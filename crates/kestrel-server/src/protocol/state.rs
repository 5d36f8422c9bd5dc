use kestrel_common::ProtocolFlags;
use serde::Serialize;
use std::fmt;

/// Protocol the server speaks.
///
/// The state is chosen once from [`ProtocolFlags`]. The only transition
/// after that is the single downgrade from [`SecureUpgradedHttp`] to
/// [`PlainHttp`], and finally [`Stopped`].
///
/// [`SecureUpgradedHttp`]: ProtocolState::SecureUpgradedHttp
/// [`PlainHttp`]: ProtocolState::PlainHttp
/// [`Stopped`]: ProtocolState::Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProtocolState {
    /// HTTP/1.1 without TLS
    PlainHttp,
    /// HTTP/2 without TLS (prior knowledge)
    UpgradedHttp,
    /// HTTPS with ALPN selecting HTTP/2 or HTTP/1.1
    SecureUpgradedHttp,
    /// HTTP on the fixed plain address and HTTPS on the fixed secure address
    Production,
    Stopped,
}

impl ProtocolState {
    /// Picks the initial state.
    ///
    /// `production` wins over `just_http2`, which wins over `just_http`.
    /// With no flags the server tries TLS first.
    pub fn select(flags: &ProtocolFlags) -> Self {
        if flags.production {
            ProtocolState::Production
        } else if flags.just_http2 {
            ProtocolState::UpgradedHttp
        } else if !flags.just_http {
            ProtocolState::SecureUpgradedHttp
        } else {
            ProtocolState::PlainHttp
        }
    }

    /// State to try when this one fails, if any.
    pub fn fallback(self) -> Option<Self> {
        match self {
            ProtocolState::SecureUpgradedHttp => Some(ProtocolState::PlainHttp),
            _ => None,
        }
    }

    pub fn uses_tls(self) -> bool {
        matches!(self, ProtocolState::SecureUpgradedHttp | ProtocolState::Production)
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::PlainHttp => "HTTP",
            ProtocolState::UpgradedHttp => "HTTP/2",
            ProtocolState::SecureUpgradedHttp => "HTTPS + HTTP/2",
            ProtocolState::Production => "production (HTTP + HTTPS)",
            ProtocolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(production: bool, just_http: bool, just_http2: bool) -> ProtocolFlags {
        ProtocolFlags {
            production,
            just_http,
            just_http2,
        }
    }

    #[test]
    fn test_select_covers_every_flag_combination() {
        for production in [false, true] {
            for just_http in [false, true] {
                for just_http2 in [false, true] {
                    let expected = if production {
                        ProtocolState::Production
                    } else if just_http2 {
                        ProtocolState::UpgradedHttp
                    } else if just_http {
                        ProtocolState::PlainHttp
                    } else {
                        ProtocolState::SecureUpgradedHttp
                    };
                    assert_eq!(
                        ProtocolState::select(&flags(production, just_http, just_http2)),
                        expected,
                        "production={} just_http={} just_http2={}",
                        production,
                        just_http,
                        just_http2
                    );
                }
            }
        }
    }

    #[test]
    fn test_default_flags_try_tls() {
        assert_eq!(
            ProtocolState::select(&ProtocolFlags::default()),
            ProtocolState::SecureUpgradedHttp
        );
    }

    #[test]
    fn test_only_secure_state_falls_back() {
        assert_eq!(
            ProtocolState::SecureUpgradedHttp.fallback(),
            Some(ProtocolState::PlainHttp)
        );
        for state in [
            ProtocolState::PlainHttp,
            ProtocolState::UpgradedHttp,
            ProtocolState::Production,
            ProtocolState::Stopped,
        ] {
            assert_eq!(state.fallback(), None);
        }
    }

    #[test]
    fn test_fallback_never_upgrades() {
        // Following fallbacks from any state terminates after at most one step
        for state in [
            ProtocolState::PlainHttp,
            ProtocolState::UpgradedHttp,
            ProtocolState::SecureUpgradedHttp,
            ProtocolState::Production,
        ] {
            if let Some(next) = state.fallback() {
                assert!(!next.uses_tls());
                assert_eq!(next.fallback(), None);
            }
        }
    }
}
