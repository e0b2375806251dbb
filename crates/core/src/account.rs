use serde::Deserialize;

/// A configured XMPP account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    /// Table key under `[accounts]`; filled in after parsing.
    #[serde(skip)]
    pub key: String,
    pub address: String,
    pub password: String,
    pub resource: String,
    pub connection_host: Option<String>,
    pub connection_port: Option<u16>,
    /// `1` (or unset) for TLS, `0` for plaintext.
    pub connection_security: Option<u8>,
    #[serde(default)]
    pub auto_login: bool,
}

impl Account {
    /// Full JID the account signs on as: `address/resource`.
    pub fn jid(&self) -> String {
        format!("{}/{}", self.address, self.resource)
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self.connection_security, None | Some(1))
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.connection_host.clone(),
            port: self.connection_port,
            tls: self.uses_tls(),
        }
    }
}

/// Where and how a session reaches its server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Defaults to the JID's domain.
    pub host: Option<String>,
    /// Defaults to the configured port, 5223 unless overridden.
    pub port: Option<u16>,
    pub tls: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            tls: true,
        }
    }
}

/// Read-only, enumerable account records.
pub trait AccountStore: Send + Sync {
    fn accounts(&self) -> Vec<Account>;

    fn by_key(&self, key: &str) -> Option<Account> {
        self.accounts().into_iter().find(|account| account.key == key)
    }

    fn by_jid(&self, jid: &str) -> Option<Account> {
        self.accounts().into_iter().find(|account| account.jid() == jid)
    }
}

impl AccountStore for Vec<Account> {
    fn accounts(&self) -> Vec<Account> {
        self.clone()
    }
}
