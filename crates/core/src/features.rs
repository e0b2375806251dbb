use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use xmpp_parsers::minidom::Element;

use crate::{error::ChannelError, stanza::ns};

/// Service discovery features advertised by this client, in
/// first-registration order.
///
/// Registrations are not counted: adding a URI twice stores it once, and a
/// single removal withdraws it.
#[derive(Debug, Clone, Default)]
pub struct FeatureRegistry {
    features: Arc<RwLock<Vec<String>>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertises `feature`. Returns false when it already was.
    pub fn add(&self, feature: &str) -> bool {
        let mut features = self.features.write();
        if features.iter().any(|existing| existing == feature) {
            return false;
        }
        debug!(feature, "adding feature");
        features.push(feature.to_string());
        true
    }

    /// Withdraws `feature`, however many channels asked for it. Returns
    /// false when it was not advertised.
    pub fn remove(&self, feature: &str) -> bool {
        let mut features = self.features.write();
        let before = features.len();
        features.retain(|existing| existing != feature);
        let removed = features.len() != before;
        if removed {
            debug!(feature, "removed feature");
        }
        removed
    }

    pub fn contains(&self, feature: &str) -> bool {
        feature == ns::DISCO_INFO || self.features.read().iter().any(|f| f == feature)
    }

    /// Registered features, always starting with disco#info itself.
    pub fn snapshot(&self) -> Vec<String> {
        std::iter::once(ns::DISCO_INFO.to_string())
            .chain(
                self.features
                    .read()
                    .iter()
                    .filter(|feature| feature.as_str() != ns::DISCO_INFO)
                    .cloned(),
            )
            .collect()
    }

    /// Builds the `<query xmlns='http://jabber.org/protocol/disco#info'/>`
    /// payload listing every registered feature.
    pub fn disco_info(&self) -> Element {
        self.snapshot()
            .into_iter()
            .fold(Element::builder("query", ns::DISCO_INFO), |query, feature| {
                query.append(Element::builder("feature", ns::DISCO_INFO).attr("var", feature))
            })
            .build()
    }
}

/// Features a channel registers for its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet(Vec<String>);

impl FeatureSet {
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(features.into_iter().map(Into::into).collect())
    }

    /// Reads the `<feature var='...'/>` children of a disco#info query.
    pub fn from_disco_info(query: &Element) -> Result<Self, ChannelError> {
        if !query.is("query", ns::DISCO_INFO) {
            return Err(ChannelError::InvalidFeatures(format!(
                "expected disco#info query, got <{}/> in {}",
                query.name(),
                query.ns()
            )));
        }

        let features = query
            .children()
            .filter(|child| child.is("feature", ns::DISCO_INFO))
            .map(|child| {
                child.attr("var").map(str::to_string).ok_or_else(|| {
                    ChannelError::InvalidFeatures("feature element without var".to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(features))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
