// ABOUTME: Typed access to the bridge's persisted secrets and per-host records
// ABOUTME: Role, migration key, source token, connection and destination status

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{AuthFailure, BridgeError, Result};
use crate::key::{self, MigrationKey};
use crate::store::{get_json, set_json, OptionStore};
use crate::types::{Connection, MigrationStatus, Role};

const ROLE_KEY: &str = "bridge_site_role";
const MIGRATION_KEY_KEY: &str = "bridge_secret_key";
const SOURCE_TOKEN_KEY: &str = "bridge_secret_token";
const CONNECTION_KEY: &str = "bridge_connection";
const STATUS_KEY: &str = "bridge_migration_status";

pub const TOKEN_LENGTH: usize = 32;

pub fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Compares two secrets without short-circuiting on the first differing byte.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn OptionStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn OptionStore>) -> Self {
        Self { store }
    }

    /// Hosts default to the source role until an operator says otherwise.
    pub fn role(&self) -> Result<Role> {
        match self.store.get(ROLE_KEY)? {
            Some(raw) => raw.parse(),
            None => Ok(Role::Source),
        }
    }

    pub fn set_role(&self, role: Role) -> Result<()> {
        self.store.set(ROLE_KEY, role.as_str())?;
        match role {
            Role::Source => {
                self.source_token()?;
                self.store.delete(MIGRATION_KEY_KEY)?;
            }
            Role::Destination => {
                self.clear_connection()?;
            }
        }
        info!("Site role set to {}", role);
        Ok(())
    }

    pub fn require_role(&self, expected: Role) -> Result<()> {
        let actual = self.role()?;
        if actual != expected {
            return Err(BridgeError::WrongRole {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Mints a fresh key for `site_url`; the previous key stops being trusted.
    pub fn generate_migration_key(&self, site_url: &str) -> Result<String> {
        self.require_role(Role::Destination)?;
        let url = format!("{}/", site_url.trim_end_matches('/'));
        let encoded = MigrationKey::new(url, generate_token(TOKEN_LENGTH)).encode();
        self.store.set(MIGRATION_KEY_KEY, &encoded)?;
        info!("Generated a new migration key");
        Ok(encoded)
    }

    pub fn migration_key(&self) -> Result<Option<MigrationKey>> {
        match self.store.get(MIGRATION_KEY_KEY)? {
            Some(encoded) => key::decode(&encoded).map(Some),
            None => Ok(None),
        }
    }

    /// Checks a bearer token against the token half of the stored migration key.
    pub fn verify_token(&self, presented: Option<&str>) -> Result<()> {
        let presented = presented
            .filter(|t| !t.is_empty())
            .ok_or(BridgeError::Auth(AuthFailure::Missing))?;
        let expected = self
            .migration_key()?
            .ok_or(BridgeError::Auth(AuthFailure::Invalid))?;
        if tokens_match(presented, &expected.token) {
            Ok(())
        } else {
            debug!("Rejected bearer token that does not match the migration key");
            Err(BridgeError::Auth(AuthFailure::Invalid))
        }
    }

    /// Checks a bearer token against this source's own download token.
    pub fn verify_source_token(&self, presented: Option<&str>) -> Result<()> {
        let presented = presented
            .filter(|t| !t.is_empty())
            .ok_or(BridgeError::Auth(AuthFailure::Missing))?;
        let expected = match self.store.get(SOURCE_TOKEN_KEY)? {
            Some(token) if !token.is_empty() => token,
            _ => return Err(BridgeError::Auth(AuthFailure::Invalid)),
        };
        if tokens_match(presented, &expected) {
            Ok(())
        } else {
            debug!("Rejected download token that does not match the source token");
            Err(BridgeError::Auth(AuthFailure::Invalid))
        }
    }

    /// Returns the source token, minting it on first use.
    pub fn source_token(&self) -> Result<String> {
        if let Some(token) = self.store.get(SOURCE_TOKEN_KEY)? {
            if !token.is_empty() {
                return Ok(token);
            }
        }
        let token = generate_token(TOKEN_LENGTH);
        self.store.set(SOURCE_TOKEN_KEY, &token)?;
        info!("Minted a new source token");
        Ok(token)
    }

    pub fn rotate_source_token(&self) -> Result<String> {
        let token = generate_token(TOKEN_LENGTH);
        self.store.set(SOURCE_TOKEN_KEY, &token)?;
        info!("Rotated source token");
        Ok(token)
    }

    pub fn connection(&self) -> Result<Option<Connection>> {
        get_json(self.store.as_ref(), CONNECTION_KEY)
    }

    pub fn save_connection(&self, connection: &Connection) -> Result<()> {
        set_json(self.store.as_ref(), CONNECTION_KEY, connection)
    }

    pub fn clear_connection(&self) -> Result<()> {
        self.store.delete(CONNECTION_KEY)
    }

    /// The active connection, or `NotConnected`.
    pub fn require_connection(&self) -> Result<Connection> {
        match self.connection()? {
            Some(conn) if conn.is_connected() => Ok(conn),
            _ => Err(BridgeError::NotConnected),
        }
    }

    pub fn migration_status(&self) -> Result<MigrationStatus> {
        Ok(get_json(self.store.as_ref(), STATUS_KEY)?.unwrap_or_default())
    }

    pub fn save_migration_status(&self, status: &MigrationStatus) -> Result<()> {
        set_json(self.store.as_ref(), STATUS_KEY, status)
    }
}
