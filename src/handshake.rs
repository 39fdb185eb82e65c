// ABOUTME: Source-side connect and disconnect against a destination's migration key
// ABOUTME: A connection is only persisted after the destination accepted the key's token

use tracing::info;

use crate::config::Timeouts;
use crate::credentials::CredentialStore;
use crate::error::{BridgeError, Result};
use crate::key;
use crate::remote::RemoteClient;
use crate::types::{Connection, ConnectionStatus, RemoteSiteIdentity, Role};

/// Verifies `encoded_key` with its destination and stores the resulting connection.
///
/// `endpoint` overrides where the bridge API is called, for destinations whose
/// canonical URL is not yet routable from this host. A malformed key fails
/// before any network traffic; any failure leaves the stored connection untouched.
pub async fn connect(
    credentials: &CredentialStore,
    encoded_key: &str,
    endpoint: Option<&str>,
    timeouts: &Timeouts,
) -> Result<Connection> {
    credentials.require_role(Role::Source)?;
    let key = key::decode(encoded_key)?;
    let destination_url = format!("{}/", key.url.trim_end_matches('/'));

    let client = RemoteClient::new(endpoint.unwrap_or(&destination_url), timeouts.clone())?;
    info!("Handshaking with {}", client.base_url());
    let response = client.handshake(&key.token).await?;
    if !response.success {
        return Err(BridgeError::Remote {
            status: 200,
            code: "handshake_refused".to_string(),
            message: "destination did not confirm the handshake".to_string(),
        });
    }

    let connection = Connection {
        destination_url,
        api_url: endpoint.map(|url| url.trim_end_matches('/').to_string()),
        migration_key: encoded_key.trim().to_string(),
        status: ConnectionStatus::Connected,
        remote_site: RemoteSiteIdentity {
            site_name: response.site_name,
            site_url: response.site_url,
            version: response.version,
        },
    };
    credentials.save_connection(&connection)?;
    info!(
        "Connected to {} ({})",
        connection.remote_site.site_name, connection.destination_url
    );
    Ok(connection)
}

/// Forgets the stored connection. Disconnecting twice is not an error.
pub fn disconnect(credentials: &CredentialStore) -> Result<()> {
    credentials.require_role(Role::Source)?;
    credentials.clear_connection()?;
    info!("Disconnected from destination");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportKind;
    use crate::store::MemoryOptionStore;
    use std::sync::Arc;

    fn source() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryOptionStore::new()))
    }

    #[tokio::test]
    async fn test_malformed_key_makes_no_call_and_saves_nothing() {
        let creds = source();
        let err = connect(&creds, "not-a-key", None, &Timeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedKey));
        assert!(creds.connection().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_destination_saves_nothing() {
        let creds = source();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let key = key::encode(&format!("http://127.0.0.1:{port}/"), "tok123");
        let err = connect(&creds, &key, None, &Timeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Transport {
                kind: TransportKind::ConnectionRefused,
                ..
            }
        ));
        assert!(creds.connection().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destination_role_cannot_connect() {
        let creds = source();
        creds.set_role(Role::Destination).unwrap();
        let key = key::encode("https://dest.test/", "tok123");
        assert!(matches!(
            connect(&creds, &key, None, &Timeouts::default()).await,
            Err(BridgeError::WrongRole { .. })
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let creds = source();
        disconnect(&creds).unwrap();
        disconnect(&creds).unwrap();
        assert!(creds.connection().unwrap().is_none());
    }
}
