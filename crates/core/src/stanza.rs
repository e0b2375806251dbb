use std::{fmt, str::FromStr, sync::Arc};

use xmpp_parsers::minidom::{Element, ElementBuilder};

use crate::error::StanzaError;

pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const AUTH: &str = "jabber:iq:auth";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
}

/// The three stanza kinds of RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }
}

impl FromStr for StanzaKind {
    type Err = StanzaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(StanzaKind::Message),
            "presence" => Ok(StanzaKind::Presence),
            "iq" => Ok(StanzaKind::Iq),
            other => Err(StanzaError::UnsupportedElement(other.to_string())),
        }
    }
}

/// An immutable XMPP stanza.
///
/// The element is shared, so cloning a stanza is cheap and every clone
/// observes the same document. Mutation goes through [`Stanza::with_attr`],
/// which produces a new stanza.
#[derive(Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    element: Arc<Element>,
}

impl Stanza {
    /// Builds a `jabber:client` stanza of `kind`; `build` adds attributes
    /// and children to the root element.
    pub fn new(kind: StanzaKind, build: impl FnOnce(ElementBuilder) -> ElementBuilder) -> Self {
        let element = build(Element::builder(kind.as_str(), ns::JABBER_CLIENT)).build();
        Self {
            kind,
            element: Arc::new(element),
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, StanzaError> {
        let xml = std::str::from_utf8(raw)
            .map_err(|error| StanzaError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}")))?;
        let trimmed = xml.trim();
        if trimmed.is_empty() {
            return Err(StanzaError::ParseFailed("stanza payload is empty".to_string()));
        }

        let element = Element::from_str(&with_default_namespace(trimmed)).map_err(|error| {
            StanzaError::ParseFailed(format!("failed to parse stanza XML: {error}"))
        })?;
        Self::try_from(element)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StanzaError> {
        let mut payload = Vec::new();
        self.element.write_to(&mut payload).map_err(|error| {
            StanzaError::SerializeFailed(format!(
                "failed to serialize <{}/> stanza: {error}",
                self.name()
            ))
        })?;
        Ok(payload)
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn from(&self) -> Option<&str> {
        self.attr("from")
    }

    pub fn to(&self) -> Option<&str> {
        self.attr("to")
    }

    pub fn type_(&self) -> Option<&str> {
        self.attr("type")
    }

    /// Namespace of the first child element, e.g. `jabber:iq:roster` for a
    /// roster query.
    pub fn payload_ns(&self) -> Option<String> {
        self.element.children().next().map(|child| child.ns())
    }

    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.element.has_child(name, namespace)
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.element
            .children()
            .find(|child| child.name() == name)
            .map(|child| child.text())
    }

    /// Returns a copy of this stanza with `name` set to `value`.
    pub fn with_attr(&self, name: &str, value: &str) -> Self {
        let mut element = (*self.element).clone();
        element.set_attr(name, value);
        Self {
            kind: self.kind,
            element: Arc::new(element),
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = StanzaError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        let kind = element.name().parse::<StanzaKind>()?;
        Ok(Self {
            kind,
            element: Arc::new(element),
        })
    }
}

impl From<&Stanza> for Element {
    fn from(value: &Stanza) -> Self {
        (*value.element).clone()
    }
}

impl FromStr for Stanza {
    type Err = StanzaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl fmt::Debug for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stanza({self})")
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => f.write_str(&String::from_utf8_lossy(&bytes)),
            Err(_) => write!(f, "<{}/>", self.name()),
        }
    }
}

/// Declares `jabber:client` (and the `stream` prefix when used) on a
/// top-level fragment that lacks them, as happens for stanzas cut out of a
/// stream whose root carried the declarations.
pub fn with_default_namespace(fragment: &str) -> String {
    let tag_end = fragment
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(fragment.len());
    if !fragment.starts_with('<') || tag_end <= 1 {
        return fragment.to_string();
    }

    let open_end = fragment.find('>').unwrap_or(fragment.len());
    let open_tag = &fragment[..open_end];
    let mut declarations = String::new();
    if !open_tag.contains("xmlns=") && !fragment[1..tag_end].contains(':') {
        declarations.push_str(&format!(" xmlns='{}'", ns::JABBER_CLIENT));
    }
    if fragment.contains("stream:") && !open_tag.contains("xmlns:stream=") {
        declarations.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
    }

    format!("{}{}{}", &fragment[..tag_end], declarations, &fragment[tag_end..])
}
