use std::{fmt, sync::Arc};

use regex::Regex;

use crate::{
    error::ChannelError,
    event::{Direction, Event, EventKind, Field, FieldValue, StreamState, Value},
};

pub type PredicateFn = Arc<dyn Fn(Option<&FieldValue<'_>>) -> bool + Send + Sync>;

/// How a single event member is tested.
#[derive(Clone)]
pub enum Matcher {
    /// Always matches, even when the member is absent.
    Wildcard,
    /// Structural equality with a value.
    Exact(Value),
    /// The member's text form must match the expression.
    TextTest(Regex),
    /// Arbitrary side-effect free test. Absent members are passed as `None`.
    Predicate(PredicateFn),
    /// The member's identity must equal this id: the session name for
    /// textual members, the `id` attribute for stanzas.
    IdentityRef(String),
}

impl Matcher {
    pub fn exact(value: impl Into<Value>) -> Self {
        Matcher::Exact(value.into())
    }

    pub fn text(expression: &str) -> Result<Self, ChannelError> {
        Regex::new(expression)
            .map(Matcher::TextTest)
            .map_err(|error| ChannelError::InvalidPattern(error.to_string()))
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(Option<&FieldValue<'_>>) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(predicate))
    }

    pub fn identity(id: impl Into<String>) -> Self {
        Matcher::IdentityRef(id.into())
    }

    /// Regex and predicate matchers can only be evaluated in process.
    pub fn is_local(&self) -> bool {
        matches!(self, Matcher::TextTest(_) | Matcher::Predicate(_))
    }

    pub fn test(&self, value: Option<&FieldValue<'_>>) -> bool {
        match self {
            Matcher::Wildcard => true,
            Matcher::Predicate(predicate) => predicate(value),
            Matcher::TextTest(regex) => value.is_some_and(|value| regex.is_match(&value.as_text())),
            Matcher::IdentityRef(id) => value
                .and_then(FieldValue::identity)
                .is_some_and(|identity| identity == id),
            Matcher::Exact(expected) => value.is_some_and(|value| expected.eq_field(value)),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Wildcard => f.write_str("Wildcard"),
            Matcher::Exact(value) => f.debug_tuple("Exact").field(value).finish(),
            Matcher::TextTest(regex) => f.debug_tuple("TextTest").field(&regex.as_str()).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
            Matcher::IdentityRef(id) => f.debug_tuple("IdentityRef").field(id).finish(),
        }
    }
}

/// An ordered mapping from event members to matchers. All entries must
/// hold for an event to match; the empty pattern matches everything.
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    entries: Vec<(Field, Matcher)>,
}

impl Pattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the matcher for `field`. A field that is already present keeps
    /// its position and has its matcher replaced.
    pub fn with(mut self, field: Field, matcher: Matcher) -> Self {
        self.insert(field, matcher);
        self
    }

    pub fn insert(&mut self, field: Field, matcher: Matcher) {
        match self.entries.iter_mut().find(|(existing, _)| *existing == field) {
            Some((_, slot)) => *slot = matcher,
            None => self.entries.push((field, matcher)),
        }
    }

    pub fn event(self, kind: EventKind) -> Self {
        self.with(Field::Event, Matcher::exact(kind))
    }

    pub fn direction(self, direction: Direction) -> Self {
        self.with(Field::Direction, Matcher::exact(direction))
    }

    pub fn session(self, session: impl Into<String>) -> Self {
        self.with(Field::Session, Matcher::exact(session.into()))
    }

    pub fn state(self, state: StreamState) -> Self {
        self.with(Field::State, Matcher::exact(state))
    }

    pub fn get(&self, field: Field) -> Option<&Matcher> {
        self.entries
            .iter()
            .find(|(existing, _)| *existing == field)
            .map(|(_, matcher)| matcher)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Field, Matcher)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Splits into the entries accepted by `keep` and the rest, each part
    /// preserving the original order.
    pub fn partition<F>(&self, mut keep: F) -> (Pattern, Pattern)
    where
        F: FnMut(Field, &Matcher) -> bool,
    {
        let (kept, rest): (Vec<_>, Vec<_>) = self
            .entries
            .iter()
            .cloned()
            .partition(|(field, matcher)| keep(*field, matcher));
        (Pattern { entries: kept }, Pattern { entries: rest })
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.entries.iter().all(|(field, matcher)| match matcher {
            Matcher::Wildcard => true,
            matcher => matcher.test(event.field(*field).as_ref()),
        })
    }
}

pub fn matches(event: &Event, pattern: &Pattern) -> bool {
    pattern.matches(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Stanza;

    const SESSION: &str = "alice@example.com/Perch";

    fn inbound_iq(id: &str) -> Event {
        let stanza: Stanza = format!("<iq type='result' id='{id}' from='example.com'/>")
            .parse()
            .unwrap();
        Event::stanza(Direction::In, SESSION, stanza)
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let pattern = Pattern::new();
        assert!(pattern.matches(&inbound_iq("1")));
        assert!(pattern.matches(&Event::stream(Direction::Out, SESSION, StreamState::Close)));
        assert!(pattern.matches(&Event::data(Direction::In, SESSION, "")));
    }

    #[test]
    fn exact_matchers_compare_values() {
        let pattern = Pattern::new().event(EventKind::Iq).direction(Direction::In);
        assert!(pattern.matches(&inbound_iq("1")));
        assert!(!Pattern::new().direction(Direction::Out).matches(&inbound_iq("1")));
    }

    #[test]
    fn exact_matcher_fails_on_absent_member() {
        let pattern = Pattern::new().state(StreamState::Open);
        assert!(!pattern.matches(&inbound_iq("1")));
    }

    #[test]
    fn single_predicate_decides_the_match() {
        let pattern = Pattern::new().with(
            Field::Stanza,
            Matcher::predicate(|value| {
                value
                    .and_then(FieldValue::as_stanza)
                    .and_then(Stanza::type_)
                    == Some("result")
            }),
        );
        assert!(pattern.matches(&inbound_iq("1")));
        assert!(!pattern.matches(&Event::data(Direction::In, SESSION, "x")));
    }

    #[test]
    fn predicate_receives_none_for_absent_member() {
        let pattern = Pattern::new().with(Field::Content, Matcher::predicate(|value| value.is_none()));
        assert!(pattern.matches(&inbound_iq("1")));
    }

    #[test]
    fn text_test_matches_serialized_stanza() {
        let pattern = Pattern::new().with(Field::Stanza, Matcher::text("type=.result.").unwrap());
        assert!(pattern.matches(&inbound_iq("1")));
        let pattern = Pattern::new().with(Field::Session, Matcher::text("^bob@").unwrap());
        assert!(!pattern.matches(&inbound_iq("1")));
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(matches!(
            Matcher::text("("),
            Err(ChannelError::InvalidPattern(_))
        ));
    }

    #[test]
    fn identity_ref_uses_stanza_id() {
        let pattern = Pattern::new().with(Field::Stanza, Matcher::identity("42"));
        assert!(pattern.matches(&inbound_iq("42")));
        assert!(!pattern.matches(&inbound_iq("43")));

        let pattern = Pattern::new().with(Field::Session, Matcher::identity(SESSION));
        assert!(pattern.matches(&inbound_iq("43")));
    }

    #[test]
    fn insert_replaces_in_place() {
        let pattern = Pattern::new()
            .event(EventKind::Iq)
            .direction(Direction::In)
            .event(EventKind::Message);
        let fields: Vec<Field> = pattern.iter().map(|(field, _)| *field).collect();
        assert_eq!(fields, vec![Field::Event, Field::Direction]);
        assert!(!pattern.matches(&inbound_iq("1")));
    }

    #[test]
    fn partition_keeps_order() {
        let pattern = Pattern::new()
            .with(Field::Stanza, Matcher::text("x").unwrap())
            .event(EventKind::Iq)
            .with(Field::Content, Matcher::predicate(|_| true))
            .direction(Direction::In);
        let (remote, local) = pattern.partition(|_, matcher| !matcher.is_local());
        let remote: Vec<Field> = remote.iter().map(|(field, _)| *field).collect();
        let local: Vec<Field> = local.iter().map(|(field, _)| *field).collect();
        assert_eq!(remote, vec![Field::Event, Field::Direction]);
        assert_eq!(local, vec![Field::Stanza, Field::Content]);
    }
}
