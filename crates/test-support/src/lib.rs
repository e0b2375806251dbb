//! Shared fixture files and an in-memory transport for Perch tests.

pub mod transport;

/// Files under the workspace's `tests/fixtures/` directory. Loaders panic on
/// a missing or malformed fixture.
pub mod fixtures {
    use std::{fs, path::PathBuf};

    use perch_core::Stanza;

    pub fn root() -> PathBuf {
        [env!("CARGO_MANIFEST_DIR"), "..", "..", "tests", "fixtures"]
            .iter()
            .collect()
    }

    fn load(group: &str, name: &str) -> String {
        let path = root().join(group).join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|error| panic!("fixture {} unreadable: {error}", path.display()))
    }

    /// Raw XML of `stanzas/<name>`, as it would arrive on the wire.
    pub fn stanza_xml(name: &str) -> String {
        load("stanzas", name)
    }

    /// `stanzas/<name>` parsed into a [`Stanza`].
    pub fn stanza(name: &str) -> Stanza {
        stanza_xml(name)
            .parse()
            .unwrap_or_else(|error| panic!("fixture stanzas/{name} is not a stanza: {error}"))
    }

    /// Contents of `config/<name>`.
    pub fn config(name: &str) -> String {
        load("config", name)
    }
}
