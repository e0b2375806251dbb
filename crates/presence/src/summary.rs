use perch_core::{
    Direction, EventKind, Field, Matcher, Pattern, Stanza, StanzaKind, jid::bare_address,
    stanza::ns,
};
use perch_storage::{CacheEntry, StanzaCache};
use tracing::debug;

use crate::PresenceError;

/// The presence that best describes a contact (or the user), as picked from
/// the stanza log.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSummary {
    pub account: Option<String>,
    pub direction: Direction,
    pub stanza: Stanza,
    /// Log position of the chosen presence; `None` when nothing was logged
    /// and an `unavailable` presence was made up.
    pub seq: Option<u64>,
}

impl PresenceSummary {
    pub fn is_synthesized(&self) -> bool {
        self.seq.is_none()
    }

    fn from_entry(entry: CacheEntry) -> Self {
        Self {
            account: Some(entry.account),
            direction: entry.direction,
            stanza: entry.stanza,
            seq: Some(entry.seq),
        }
    }

    fn unavailable(account: Option<&str>, address: Option<&str>) -> Self {
        let (direction, stanza) = match address {
            Some(address) => (
                Direction::In,
                Stanza::new(StanzaKind::Presence, |presence| {
                    presence.attr("from", address).attr("type", "unavailable")
                }),
            ),
            None => (
                Direction::Out,
                Stanza::new(StanzaKind::Presence, |presence| {
                    presence.attr("type", "unavailable")
                }),
            ),
        };
        Self {
            account: account.map(str::to_string),
            direction,
            stanza,
            seq: None,
        }
    }
}

/// Whether `stanza` reports availability: no `type`, or `unavailable`.
/// Subscription requests, probes and errors do not.
fn is_availability(stanza: &Stanza) -> bool {
    matches!(stanza.type_(), None | Some("unavailable"))
}

/// Ranks a presence: unavailable 0, xa 1, away 2, dnd 3, plain available 4,
/// chat 5. Presences of any other type say nothing about availability and
/// rank 0.
pub fn presence_degree(stanza: &Stanza) -> Result<u8, PresenceError> {
    if stanza.type_().is_some() {
        return Ok(0);
    }
    let show = stanza.child_text("show").unwrap_or_default();
    match show.trim() {
        "" => Ok(4),
        "chat" => Ok(5),
        "dnd" => Ok(3),
        "away" => Ok(2),
        "xa" => Ok(1),
        other => Err(PresenceError::InvalidShowValue {
            show: other.to_string(),
        }),
    }
}

/// Picks the highest ranked presence, the oldest one on ties.
///
/// With `address`, candidates are the presences received on `account` from
/// any resource of `address`. Without, they are the user's own broadcast
/// presences sent on `account` (or on every account when `account` is
/// `None`), leaving out directed and room presences. Either way only
/// availability presences count, so subscription traffic and errors never
/// make a contact look online. When there are no candidates an
/// `unavailable` presence is returned instead.
pub fn presence_summary(
    cache: &StanzaCache,
    account: Option<&str>,
    address: Option<&str>,
) -> Result<PresenceSummary, PresenceError> {
    let mut pattern = Pattern::new().event(EventKind::Presence);
    pattern = match address {
        Some(_) => pattern.direction(Direction::In),
        None => pattern.direction(Direction::Out),
    };
    if let Some(account) = account {
        pattern = pattern.session(account);
    }

    pattern = match address {
        Some(address) => {
            let address = address.to_string();
            pattern.with(
                Field::Stanza,
                Matcher::predicate(move |value| {
                    value
                        .and_then(|value| value.as_stanza())
                        .filter(|stanza| is_availability(stanza))
                        .and_then(Stanza::from)
                        .is_some_and(|from| bare_address(from) == address)
                }),
            )
        }
        None => pattern.with(
            Field::Stanza,
            Matcher::predicate(|value| {
                value.and_then(|value| value.as_stanza()).is_some_and(|stanza| {
                    is_availability(stanza)
                        && stanza.to().is_none()
                        && !stanza.has_child("x", ns::MUC)
                })
            }),
        ),
    };

    let mut best: Option<(u8, CacheEntry)> = None;
    for entry in cache.fetch(&pattern)? {
        let degree = presence_degree(&entry.stanza)?;
        if best.as_ref().is_none_or(|(top, _)| degree > *top) {
            best = Some((degree, entry));
        }
    }

    match best {
        Some((degree, entry)) => {
            debug!(seq = entry.seq, degree, "presence summary");
            Ok(PresenceSummary::from_entry(entry))
        }
        None => Ok(PresenceSummary::unavailable(account, address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use perch_test_support::fixtures;

    const ALICE: &str = "alice@example.com/Perch";

    fn presence(xml: &str) -> Stanza {
        xml.parse().unwrap()
    }

    #[test]
    fn degrees() {
        assert_eq!(presence_degree(&presence("<presence type='unavailable'/>")).unwrap(), 0);
        assert_eq!(presence_degree(&presence("<presence><show>xa</show></presence>")).unwrap(), 1);
        assert_eq!(presence_degree(&presence("<presence><show>away</show></presence>")).unwrap(), 2);
        assert_eq!(presence_degree(&presence("<presence><show>dnd</show></presence>")).unwrap(), 3);
        assert_eq!(presence_degree(&presence("<presence/>")).unwrap(), 4);
        assert_eq!(presence_degree(&presence("<presence><show>chat</show></presence>")).unwrap(), 5);
        assert_eq!(presence_degree(&presence("<presence type='subscribe'/>")).unwrap(), 0);
        assert_eq!(
            presence_degree(&presence("<presence type='error'><show>chat</show></presence>")).unwrap(),
            0
        );
        assert_matches!(
            presence_degree(&presence("<presence><show>sleepy</show></presence>")),
            Err(PresenceError::InvalidShowValue { show }) if show == "sleepy"
        );
    }

    #[test]
    fn contact_summary_picks_highest_degree() {
        let cache = StanzaCache::new().unwrap();
        for show in ["away", "chat", "dnd"] {
            cache
                .append(
                    &presence(&format!(
                        "<presence from='bob@example.com/Home'><show>{show}</show></presence>"
                    )),
                    Direction::In,
                    ALICE,
                )
                .unwrap();
        }
        cache
            .append(&presence("<presence from='carol@example.com/Home'/>"), Direction::In, ALICE)
            .unwrap();

        let summary = presence_summary(&cache, Some(ALICE), Some("bob@example.com")).unwrap();
        assert_eq!(summary.stanza.child_text("show").as_deref(), Some("chat"));
        assert_eq!(summary.seq, Some(2));
        assert_eq!(summary.account.as_deref(), Some(ALICE));
    }

    #[test]
    fn ties_keep_the_oldest_presence() {
        let cache = StanzaCache::new().unwrap();
        cache
            .append(&presence("<presence from='bob@example.com/Home'/>"), Direction::In, ALICE)
            .unwrap();
        cache
            .append(&presence("<presence from='bob@example.com/Work'/>"), Direction::In, ALICE)
            .unwrap();

        let summary = presence_summary(&cache, Some(ALICE), Some("bob@example.com")).unwrap();
        assert_eq!(summary.stanza.from(), Some("bob@example.com/Home"));
    }

    #[test]
    fn unknown_contact_gets_synthesized_unavailable() {
        let cache = StanzaCache::new().unwrap();
        let summary = presence_summary(&cache, Some(ALICE), Some("x@y")).unwrap();

        assert!(summary.is_synthesized());
        assert_eq!(summary.direction, Direction::In);
        assert_eq!(summary.stanza.from(), Some("x@y"));
        assert_eq!(summary.stanza.type_(), Some("unavailable"));
    }

    #[test]
    fn subscription_and_error_presences_are_not_availability() {
        let cache = StanzaCache::new().unwrap();
        cache
            .append(&presence("<presence from='bob@example.com/Home' type='subscribe'/>"), Direction::In, ALICE)
            .unwrap();
        cache
            .append(&presence("<presence from='carol@example.com/Home' type='error'/>"), Direction::In, ALICE)
            .unwrap();
        cache
            .append(&presence("<presence from='carol@example.com/Home'><show>away</show></presence>"), Direction::In, ALICE)
            .unwrap();

        let bob = presence_summary(&cache, Some(ALICE), Some("bob@example.com")).unwrap();
        assert!(bob.is_synthesized());
        assert_eq!(bob.stanza.type_(), Some("unavailable"));

        let carol = presence_summary(&cache, Some(ALICE), Some("carol@example.com")).unwrap();
        assert_eq!(carol.seq, Some(3));
    }

    #[test]
    fn own_summary_ignores_subscription_answers() {
        let cache = StanzaCache::new().unwrap();
        cache
            .append(&presence("<presence type='subscribed'/>"), Direction::Out, ALICE)
            .unwrap();
        assert!(presence_summary(&cache, Some(ALICE), None).unwrap().is_synthesized());
    }

    #[test]
    fn own_summary_skips_directed_and_room_presences() {
        let cache = StanzaCache::new().unwrap();
        cache
            .append(&presence("<presence><show>away</show></presence>"), Direction::Out, ALICE)
            .unwrap();
        cache
            .append(&fixtures::stanza("muc-join.xml"), Direction::Out, ALICE)
            .unwrap();
        cache
            .append(
                &presence("<presence to='bob@example.com'><show>chat</show></presence>"),
                Direction::Out,
                ALICE,
            )
            .unwrap();

        let summary = presence_summary(&cache, Some(ALICE), None).unwrap();
        assert_eq!(summary.seq, Some(1));
        assert_eq!(summary.direction, Direction::Out);
    }

    #[test]
    fn own_summary_without_account_spans_accounts() {
        let cache = StanzaCache::new().unwrap();
        cache
            .append(&presence("<presence><show>dnd</show></presence>"), Direction::Out, ALICE)
            .unwrap();
        cache
            .append(&presence("<presence/>"), Direction::Out, "alice@example.org/Home")
            .unwrap();

        let summary = presence_summary(&cache, None, None).unwrap();
        assert_eq!(summary.account.as_deref(), Some("alice@example.org/Home"));

        let empty = StanzaCache::new().unwrap();
        let summary = presence_summary(&empty, None, None).unwrap();
        assert!(summary.is_synthesized());
        assert_eq!(summary.direction, Direction::Out);
        assert_eq!(summary.stanza.from(), None);
    }

    #[test]
    fn invalid_show_aborts_the_summary() {
        let cache = StanzaCache::new().unwrap();
        cache
            .append(
                &presence("<presence from='bob@example.com/Home'><show>sleepy</show></presence>"),
                Direction::In,
                ALICE,
            )
            .unwrap();
        assert_matches!(
            presence_summary(&cache, Some(ALICE), Some("bob@example.com")),
            Err(PresenceError::InvalidShowValue { .. })
        );
    }
}
