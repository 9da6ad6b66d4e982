//! Broker account records with encrypted credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user's connection to one broker. Credential fields hold ciphertext;
/// decryption happens only inside the broker client factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAccount {
    pub id: String,
    pub user_id: String,
    /// Broker identifier, e.g. `kite`.
    pub broker_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl BrokerAccount {
    /// A broker client may only be issued while this holds.
    pub fn has_valid_token(&self) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        match self.token_expires_at {
            Some(expires_at) => Utc::now() < expires_at,
            None => true,
        }
    }
}
