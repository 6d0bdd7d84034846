//! Authentication hook.
//!
//! The engine consults an `Authenticator` with the parsed CONNECT before it
//! sends CONNACK; a refusal becomes the returned CONNACK code and the
//! connection is closed. The default provider accepts everyone.

use std::net::SocketAddr;

use plume_core::packet::{Connect, ConnackCode};

pub trait Authenticator: Send + Sync {
    /// Accept (Ok) or refuse (Err(code)) a connecting client.
    fn authenticate(
        &self,
        connect: &Connect,
        remote_addr: SocketAddr,
    ) -> Result<(), ConnackCode>;
}

/// Default provider: every client is accepted.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _connect: &Connect, _remote_addr: SocketAddr) -> Result<(), ConnackCode> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAnonymous;

    impl Authenticator for DenyAnonymous {
        fn authenticate(
            &self,
            connect: &Connect,
            _remote_addr: SocketAddr,
        ) -> Result<(), ConnackCode> {
            if connect.username.is_none() {
                return Err(ConnackCode::NotAuthorized);
            }
            Ok(())
        }
    }

    fn connect(username: Option<&str>) -> Connect {
        Connect {
            protocol_name: "MQTT".into(),
            protocol_version: 4,
            clean_session: true,
            keep_alive: 0,
            client_id: "c".into(),
            will: None,
            username: username.map(String::from),
            password: None,
        }
    }

    #[test]
    fn test_allow_all() {
        let addr = "127.0.0.1:1883".parse().unwrap();
        assert!(AllowAll.authenticate(&connect(None), addr).is_ok());
    }

    #[test]
    fn test_custom_provider_refuses() {
        let addr = "127.0.0.1:1883".parse().unwrap();
        assert_eq!(
            DenyAnonymous.authenticate(&connect(None), addr),
            Err(ConnackCode::NotAuthorized)
        );
        assert!(DenyAnonymous.authenticate(&connect(Some("u")), addr).is_ok());
    }
}
