//! Connection capabilities
//!
//! Each accepted connection gets a [`Permit`] derived once from the peer's
//! identity. Handlers check bits, never identities, and the permit never
//! changes for the life of the connection.

/// What a connection is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    /// Read-only handlers.
    pub read: bool,
    /// Mutating handlers. Implies `read`.
    pub write: bool,
    /// Certificate fetching, on top of `write`.
    pub cert: bool,
}

impl Permit {
    /// No access at all.
    pub const NONE: Permit = Permit {
        read: false,
        write: false,
        cert: false,
    };

    /// Same-user or root peers.
    pub fn full() -> Permit {
        Permit {
            read: true,
            write: true,
            cert: true,
        }
    }

    /// Other authenticated local users.
    pub fn read_only() -> Permit {
        Permit {
            read: true,
            write: false,
            cert: false,
        }
    }

    /// Token-authenticated peers on credless transports. The token is the
    /// ambient authority, but it does not extend to certificate keys.
    pub fn read_write() -> Permit {
        Permit {
            read: true,
            write: true,
            cert: false,
        }
    }
}

/// How the transport identified the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerIdentity {
    /// OS peer credentials (Unix socket).
    Uid(u32),
    /// The per-process token was presented on a credless transport.
    Token,
    /// Nothing; the peer could not be identified.
    Unknown,
}

/// Derive the permit for a peer. `daemon_uid` is the uid the daemon runs
/// as; peers with the same uid (or root) own the daemon.
pub fn permit_for(identity: PeerIdentity, daemon_uid: u32) -> Permit {
    match identity {
        PeerIdentity::Uid(0) => Permit::full(),
        PeerIdentity::Uid(uid) if uid == daemon_uid => Permit::full(),
        PeerIdentity::Uid(_) => Permit::read_only(),
        PeerIdentity::Token => Permit::read_write(),
        PeerIdentity::Unknown => Permit::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_gets_everything() {
        assert_eq!(permit_for(PeerIdentity::Uid(0), 997), Permit::full());
    }

    #[test]
    fn test_same_user_gets_everything() {
        assert_eq!(permit_for(PeerIdentity::Uid(997), 997), Permit::full());
    }

    #[test]
    fn test_other_user_reads_only() {
        let p = permit_for(PeerIdentity::Uid(1000), 997);
        assert_eq!(p, Permit::read_only());
    }

    #[test]
    fn test_token_reads_and_writes_but_no_cert() {
        let p = permit_for(PeerIdentity::Token, 997);
        assert!(p.read && p.write && !p.cert);
    }

    #[test]
    fn test_unknown_gets_nothing() {
        assert_eq!(permit_for(PeerIdentity::Unknown, 997), Permit::NONE);
    }

    #[test]
    fn test_write_implies_read() {
        for identity in [
            PeerIdentity::Uid(0),
            PeerIdentity::Uid(1),
            PeerIdentity::Token,
            PeerIdentity::Unknown,
        ] {
            let p = permit_for(identity, 0);
            assert!(!p.write || p.read, "write must imply read: {p:?}");
        }
    }
}
