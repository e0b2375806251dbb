//! Append-only log of every stanza seen by the session manager.
//!
//! Rows live in an in-memory SQLite table so that [`Query`] constraints are
//! evaluated by the database. The parsed stanza for each row is kept next to
//! it, keyed by sequence number, so results never need to be re-parsed.

use parking_lot::Mutex;
use perch_core::{Direction, Event, JidParts, Pattern, Stanza};
use rusqlite::{Connection, params, params_from_iter};
use tracing::{debug, trace};

use crate::{
    StorageError, open_in_memory,
    query::{CompiledQuery, Query},
};

/// One logged stanza. Entries are never mutated once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Position in the log, starting at 1.
    pub seq: u64,
    pub stanza: Stanza,
    pub direction: Direction,
    /// Full JID of the session the stanza was observed on.
    pub account: String,
}

impl CacheEntry {
    /// The entry as the stanza event it was logged from.
    pub fn event(&self) -> Event {
        Event::stanza(self.direction, &self.account, self.stanza.clone())
    }
}

struct Log {
    connection: Connection,
    entries: Vec<CacheEntry>,
}

pub struct StanzaCache {
    log: Mutex<Log>,
}

impl StanzaCache {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            log: Mutex::new(Log {
                connection: open_in_memory()?,
                entries: Vec::new(),
            }),
        })
    }

    /// Logs `stanza` and returns its sequence number. The row and the parsed
    /// stanza become visible to readers together.
    pub fn append(
        &self,
        stanza: &Stanza,
        direction: Direction,
        account: &str,
    ) -> Result<u64, StorageError> {
        let mut log = self.log.lock();
        let seq = log.entries.len() as u64 + 1;

        let from = stanza.from().and_then(JidParts::parse);
        let to = stanza.to().and_then(JidParts::parse);
        log.connection
            .execute(
                "INSERT INTO stanzas (
                    seq, event, direction, account, stanza_id, stanza_type,
                    from_jid, from_address, resource, to_jid, to_address, namespace, xml
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    seq as i64,
                    stanza.name(),
                    direction.as_str(),
                    account,
                    stanza.id(),
                    stanza.type_(),
                    stanza.from(),
                    from.as_ref().map(JidParts::address),
                    from.as_ref().and_then(|parts| parts.resource.clone()),
                    stanza.to(),
                    to.as_ref().map(JidParts::address),
                    stanza.payload_ns(),
                    stanza.to_string(),
                ],
            )
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;

        log.entries.push(CacheEntry {
            seq,
            stanza: stanza.clone(),
            direction,
            account: account.to_string(),
        });
        trace!(seq, %direction, account, stanza = stanza.name(), "logged stanza");
        Ok(seq)
    }

    pub fn len(&self) -> usize {
        self.log.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest entry satisfying `query`.
    pub fn first(&self, query: &Query) -> Result<Option<CacheEntry>, StorageError> {
        let mut entries = self.select(&query.compile(), Some(1))?;
        Ok(entries.pop())
    }

    /// Every entry satisfying `query`, in append order.
    pub fn all(&self, query: &Query) -> Result<Vec<CacheEntry>, StorageError> {
        self.select(&query.compile(), None)
    }

    /// Entries matching `pattern`. Scalar entries of the pattern are
    /// evaluated by the database; the rest (regular expressions, predicates,
    /// whole-stanza comparisons) are applied to the narrowed result.
    pub fn fetch(&self, pattern: &Pattern) -> Result<Vec<CacheEntry>, StorageError> {
        let (remote, local) = pattern.partition(Query::representable);
        let query = Query::from_pattern(&remote)?;
        let candidates = self.all(&query)?;
        let total = candidates.len();

        let results: Vec<CacheEntry> = candidates
            .into_iter()
            .filter(|entry| local.matches(&entry.event()))
            .collect();
        debug!(
            %query,
            local = local.len(),
            candidates = total,
            results = results.len(),
            "fetched from stanza log"
        );
        Ok(results)
    }

    pub fn find(&self, pattern: &Pattern) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.fetch(pattern)?.into_iter().next())
    }

    fn select(
        &self,
        compiled: &CompiledQuery,
        limit: Option<usize>,
    ) -> Result<Vec<CacheEntry>, StorageError> {
        let log = self.log.lock();
        let mut statement = log
            .connection
            .prepare(&compiled.select_seq(limit))
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;
        let rows = statement
            .query_map(params_from_iter(compiled.params.iter()), |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|error| StorageError::QueryFailed(error.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            let seq = row.map_err(|error| StorageError::QueryFailed(error.to_string()))? as u64;
            let entry = usize::try_from(seq)
                .ok()
                .and_then(|seq| log.entries.get(seq.wrapping_sub(1)))
                .ok_or(StorageError::MissingEntry(seq))?;
            entries.push(entry.clone());
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for StanzaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StanzaCache")
            .field("entries", &self.len())
            .finish()
    }
}
