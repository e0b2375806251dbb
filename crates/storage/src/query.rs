//! Scalar constraints over the stanza log.
//!
//! A [`Query`] is an ordered conjunction of equality constraints on the
//! columns the log keeps for every stanza. It compiles to a SQL `WHERE`
//! clause with positional parameters, so it can be evaluated by the
//! database without touching the parsed stanzas.

use std::fmt;

use perch_core::{Direction, EventKind, Field, Matcher, Pattern};
use thiserror::Error;

/// A pattern entry that has no column to compile to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot compile {shape} on `{field}` into a stanza log query")]
pub struct QueryShapeError {
    pub field: Field,
    pub shape: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Event,
    Direction,
    Account,
    StanzaId,
    FromJid,
    FromAddress,
    Resource,
    ToJid,
    ToAddress,
    Namespace,
}

impl Column {
    fn name(&self) -> &'static str {
        match self {
            Column::Event => "event",
            Column::Direction => "direction",
            Column::Account => "account",
            Column::StanzaId => "stanza_id",
            Column::FromJid => "from_jid",
            Column::FromAddress => "from_address",
            Column::Resource => "resource",
            Column::ToJid => "to_jid",
            Column::ToAddress => "to_address",
            Column::Namespace => "namespace",
        }
    }

    /// Columns sharing a slot replace each other: a query constrains the
    /// sender either by full JID or by bare address, not both.
    fn slot(&self) -> Column {
        match self {
            Column::FromAddress => Column::FromJid,
            Column::ToAddress => Column::ToJid,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    constraints: Vec<(Column, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(self, kind: EventKind) -> Self {
        self.constrain(Column::Event, kind.as_str())
    }

    pub fn direction(self, direction: Direction) -> Self {
        self.constrain(Column::Direction, direction.as_str())
    }

    /// Full JID of the session the stanza was observed on.
    pub fn account(self, account: impl Into<String>) -> Self {
        self.constrain(Column::Account, account)
    }

    /// Sender. A bare address matches every resource of that address.
    pub fn from(self, jid: impl Into<String>) -> Self {
        let jid = jid.into();
        let column = if jid.contains('/') {
            Column::FromJid
        } else {
            Column::FromAddress
        };
        self.constrain(column, jid)
    }

    /// Recipient. A bare address matches every resource of that address.
    pub fn to(self, jid: impl Into<String>) -> Self {
        let jid = jid.into();
        let column = if jid.contains('/') {
            Column::ToJid
        } else {
            Column::ToAddress
        };
        self.constrain(column, jid)
    }

    /// Resource part of the sender.
    pub fn resource(self, resource: impl Into<String>) -> Self {
        self.constrain(Column::Resource, resource)
    }

    /// Namespace of the stanza's first child, e.g. `jabber:iq:roster`.
    pub fn namespace(self, namespace: impl Into<String>) -> Self {
        self.constrain(Column::Namespace, namespace)
    }

    /// Value of the stanza's `id` attribute.
    pub fn id(self, id: impl Into<String>) -> Self {
        self.constrain(Column::StanzaId, id)
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    fn constrain(mut self, column: Column, value: impl Into<String>) -> Self {
        let value = value.into();
        match self
            .constraints
            .iter_mut()
            .find(|(existing, _)| existing.slot() == column.slot())
        {
            Some(slot) => *slot = (column, value),
            None => self.constraints.push((column, value)),
        }
        self
    }

    /// Whether `matcher` on `field` can be evaluated by the database.
    pub fn representable(field: Field, matcher: &Matcher) -> bool {
        Self::constraint_for(field, matcher).is_ok()
    }

    /// Converts the scalar entries of `pattern` into a query. Fails on the
    /// first entry without a column equivalent; wildcards are skipped.
    ///
    /// `from` and `to` entries compare the whole attribute: unlike
    /// [`Query::from`], a bare address in a pattern does not match the
    /// address's resources.
    pub fn from_pattern(pattern: &Pattern) -> Result<Self, QueryShapeError> {
        let mut query = Query::new();
        for (field, matcher) in pattern.iter() {
            if let Some((column, value)) = Self::constraint_for(*field, matcher)? {
                query = query.constrain(column, value);
            }
        }
        Ok(query)
    }

    fn constraint_for(
        field: Field,
        matcher: &Matcher,
    ) -> Result<Option<(Column, String)>, QueryShapeError> {
        let shape_error = |shape| QueryShapeError { field, shape };
        let value = match matcher {
            Matcher::Wildcard => return Ok(None),
            Matcher::TextTest(_) => return Err(shape_error("a regular expression")),
            Matcher::Predicate(_) => return Err(shape_error("a predicate")),
            Matcher::IdentityRef(id) => id.clone(),
            Matcher::Exact(value) => match value.as_text() {
                Some(text) if field != Field::Stanza => text.to_string(),
                _ => return Err(shape_error("a stanza value")),
            },
        };

        let column = match field {
            Field::Event => Column::Event,
            Field::Direction => Column::Direction,
            Field::Session | Field::Account => Column::Account,
            Field::Stanza => Column::StanzaId,
            // Raw attribute, so the database agrees with `Pattern::matches`.
            Field::From => Column::FromJid,
            Field::To => Column::ToJid,
            Field::State | Field::Content => return Err(shape_error("a stream member")),
        };
        Ok(Some((column, value)))
    }

    pub fn compile(&self) -> CompiledQuery {
        let clause = if self.constraints.is_empty() {
            "1 = 1".to_string()
        } else {
            self.constraints
                .iter()
                .enumerate()
                .map(|(index, (column, _))| format!("{} = ?{}", column.name(), index + 1))
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        CompiledQuery {
            clause,
            params: self.constraints.iter().map(|(_, value)| value.clone()).collect(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let compiled = self.compile();
        write!(f, "{} {:?}", compiled.clause, compiled.params)
    }
}

/// A query ready for the database: a `WHERE` clause with `?N` placeholders
/// and the values bound to them, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub clause: String,
    pub params: Vec<String>,
}

impl CompiledQuery {
    /// Selects matching sequence numbers in append order.
    pub fn select_seq(&self, limit: Option<usize>) -> String {
        match limit {
            Some(limit) => format!(
                "SELECT seq FROM stanzas WHERE {} ORDER BY seq LIMIT {limit}",
                self.clause
            ),
            None => format!("SELECT seq FROM stanzas WHERE {} ORDER BY seq", self.clause),
        }
    }
}
