use perch_core::{
    Direction, EventKind, Field, JidParts, Matcher, Pattern, Stanza, StanzaKind, stanza::ns,
};
use perch_storage::{CacheEntry, Query, StanzaCache};
use xmpp_parsers::minidom::Element;

use crate::PresenceError;

fn roster_item<'a>(roster: &'a Stanza, address: &str) -> Option<&'a Element> {
    roster
        .element()
        .get_child("query", ns::ROSTER)?
        .children()
        .find(|item| item.is("item", ns::ROSTER) && item.attr("jid") == Some(address))
}

/// Display name for `address`: its roster name on `account`, else the
/// node part of the address, else the address itself.
pub fn nick_for(cache: &StanzaCache, account: &str, address: &str) -> Result<String, PresenceError> {
    let pattern = Pattern::new()
        .event(EventKind::Iq)
        .direction(Direction::In)
        .session(account)
        .with(
            Field::Stanza,
            Matcher::predicate(|value| {
                value
                    .and_then(|value| value.as_stanza())
                    .is_some_and(|stanza| stanza.has_child("query", ns::ROSTER))
            }),
        );

    let name = cache.find(&pattern)?.and_then(|entry: CacheEntry| {
        roster_item(&entry.stanza, address)
            .and_then(|item| item.attr("name"))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    });

    Ok(name
        .or_else(|| JidParts::parse(address).and_then(|jid| jid.username))
        .unwrap_or_else(|| address.to_string()))
}

/// A roster result holding only the entry for `address`, or a
/// `subscription='none'` entry when `address` is not on the roster.
pub fn roster_segment(
    cache: &StanzaCache,
    account: &str,
    address: &str,
) -> Result<Stanza, PresenceError> {
    let roster = cache.first(
        &Query::new()
            .event(EventKind::Iq)
            .direction(Direction::In)
            .account(account)
            .namespace(ns::ROSTER),
    )?;

    let item = roster
        .as_ref()
        .and_then(|entry| roster_item(&entry.stanza, address))
        .cloned()
        .unwrap_or_else(|| {
            Element::builder("item", ns::ROSTER)
                .attr("jid", address)
                .attr("subscription", "none")
                .build()
        });

    Ok(Stanza::new(StanzaKind::Iq, |iq| {
        iq.attr("type", "result")
            .attr("from", account)
            .attr("to", account)
            .append(Element::builder("query", ns::ROSTER).append(item))
    }))
}
