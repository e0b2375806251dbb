use std::fmt;

/// Lenient decomposition of an XMPP address into its parts.
///
/// Unlike a validating JID type this accepts anything a peer may put in a
/// `from` or `to` attribute, including room occupants whose resource is a
/// free-form nickname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JidParts {
    pub username: Option<String>,
    pub hostname: String,
    pub resource: Option<String>,
}

impl JidParts {
    pub fn parse(jid: &str) -> Option<Self> {
        let jid = jid.trim();
        if jid.is_empty() {
            return None;
        }

        let (bare, resource) = match jid.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (jid, None),
        };
        let (username, hostname) = match bare.split_once('@') {
            Some((username, hostname)) => (Some(username), hostname),
            None => (None, bare),
        };

        if hostname.is_empty() || username.is_some_and(str::is_empty) {
            return None;
        }

        Some(Self {
            username: username.map(str::to_string),
            hostname: hostname.to_string(),
            resource: resource.filter(|r| !r.is_empty()).map(str::to_string),
        })
    }

    /// Bare address: `user@host`, or just `host` for server addresses.
    pub fn address(&self) -> String {
        match &self.username {
            Some(username) => format!("{username}@{}", self.hostname),
            None => self.hostname.clone(),
        }
    }

    /// The full JID when a resource is present.
    pub fn full(&self) -> Option<String> {
        self.resource
            .as_ref()
            .map(|resource| format!("{}/{resource}", self.address()))
    }

    /// A full JID with a username is what a client session signs on as.
    pub fn is_full_user_jid(&self) -> bool {
        self.username.is_some() && self.resource.is_some()
    }
}

impl fmt::Display for JidParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.full() {
            Some(full) => f.write_str(&full),
            None => f.write_str(&self.address()),
        }
    }
}

/// Bare address of `jid`, falling back to the input for unparseable values.
pub fn bare_address(jid: &str) -> String {
    JidParts::parse(jid)
        .map(|parts| parts.address())
        .unwrap_or_else(|| jid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_jid() {
        let jid = JidParts::parse("user@example.org/Laptop").unwrap();
        assert_eq!(jid.username.as_deref(), Some("user"));
        assert_eq!(jid.hostname, "example.org");
        assert_eq!(jid.resource.as_deref(), Some("Laptop"));
        assert_eq!(jid.address(), "user@example.org");
        assert_eq!(jid.full().as_deref(), Some("user@example.org/Laptop"));
        assert!(jid.is_full_user_jid());
    }

    #[test]
    fn parses_server_and_bare_jids() {
        let server = JidParts::parse("example.org").unwrap();
        assert_eq!(server.username, None);
        assert_eq!(server.address(), "example.org");

        let bare = JidParts::parse("user@example.org").unwrap();
        assert_eq!(bare.full(), None);
        assert!(!bare.is_full_user_jid());
    }

    #[test]
    fn room_nick_may_contain_slashes() {
        let occupant = JidParts::parse("room@conference.example.org/a/b").unwrap();
        assert_eq!(occupant.resource.as_deref(), Some("a/b"));
        assert_eq!(occupant.address(), "room@conference.example.org");
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(JidParts::parse("").is_none());
        assert!(JidParts::parse("@example.org").is_none());
        assert!(JidParts::parse("user@").is_none());
    }

    #[test]
    fn bare_address_falls_back_to_input() {
        assert_eq!(bare_address("a@b/c"), "a@b");
        assert_eq!(bare_address(""), "");
    }
}
