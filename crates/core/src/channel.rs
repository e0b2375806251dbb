use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    error::ChannelError,
    event::Event,
    features::{FeatureRegistry, FeatureSet},
    pattern::Pattern,
};

pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Watch {
    pattern: Pattern,
    handler: Handler,
}

struct ChannelInner {
    id: u64,
    watches: RwLock<Vec<Arc<Watch>>>,
    features: FeatureSet,
    paused: AtomicBool,
    released: AtomicBool,
    hub: Weak<HubInner>,
    registry: FeatureRegistry,
}

impl ChannelInner {
    fn handle(&self, event: &Event) {
        if self.released.load(Ordering::Acquire) || self.paused.load(Ordering::Acquire) {
            return;
        }

        let watches: Vec<Arc<Watch>> = self.watches.read().clone();
        for watch in watches.iter().filter(|watch| watch.pattern.matches(event)) {
            if let Err(error) = (watch.handler)(event) {
                warn!(
                    channel = self.id,
                    event = %event.kind,
                    direction = %event.direction,
                    session = %event.session,
                    error = %error,
                    "event handler failed"
                );
            }
        }
    }
}

/// A set of watches that receives every event dispatched through the hub it
/// was created on.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Registers `handler` for events matching `pattern`. Handlers run in
    /// registration order; a handler registered during dispatch first sees
    /// the next event.
    pub fn on<F>(&self, pattern: Pattern, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.watches.write().push(Arc::new(Watch {
            pattern,
            handler: Arc::new(handler),
        }));
    }

    /// Invokes every watch whose pattern matches `event`.
    pub fn handle(&self, event: &Event) {
        self.inner.handle(event);
    }

    /// Stops delivery until [`EventChannel::restart`]. Events arriving in
    /// between are dropped, not buffered.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn restart(&self) {
        self.inner.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Detaches the channel from its hub and withdraws its features.
    /// Calling it again has no effect.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(hub) = self.inner.hub.upgrade() {
            hub.channels.write().retain(|channel| channel.id != self.inner.id);
        }
        for feature in self.inner.features.iter() {
            self.inner.registry.remove(feature);
        }
        self.inner.watches.write().clear();
        debug!(channel = self.inner.id, "channel released");
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("id", &self.inner.id)
            .field("watches", &self.inner.watches.read().len())
            .field("features", &self.inner.features)
            .field("paused", &self.is_paused())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Anything events can be published to.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: &Event);
}

struct HubInner {
    channels: RwLock<Vec<Arc<ChannelInner>>>,
    next_id: AtomicU64,
    registry: FeatureRegistry,
}

/// The dispatch source channels register with. Events are fanned out to
/// every live channel in creation order.
#[derive(Clone)]
pub struct ChannelHub {
    inner: Arc<HubInner>,
}

impl ChannelHub {
    pub fn new(registry: FeatureRegistry) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                registry,
            }),
        }
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.inner.registry
    }

    pub fn create_channel(&self) -> EventChannel {
        self.create_channel_with_features(FeatureSet::default())
    }

    /// Creates a channel that advertises `features` until released.
    pub fn create_channel_with_features(&self, features: FeatureSet) -> EventChannel {
        for feature in features.iter() {
            self.inner.registry.add(feature);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(ChannelInner {
            id,
            watches: RwLock::new(Vec::new()),
            features,
            paused: AtomicBool::new(false),
            released: AtomicBool::new(false),
            hub: Arc::downgrade(&self.inner),
            registry: self.inner.registry.clone(),
        });
        self.inner.channels.write().push(Arc::clone(&channel));
        debug!(channel = id, "channel created");

        EventChannel { inner: channel }
    }

    /// Like [`ChannelHub::create_channel_with_features`], reading the
    /// features from a disco#info `<query/>` element.
    pub fn create_channel_from_disco(
        &self,
        query: &xmpp_parsers::minidom::Element,
    ) -> Result<EventChannel, ChannelError> {
        let features = FeatureSet::from_disco_info(query)?;
        Ok(self.create_channel_with_features(features))
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().len()
    }
}

impl EventSink for ChannelHub {
    fn dispatch(&self, event: &Event) {
        let channels: Vec<Arc<ChannelInner>> = self.inner.channels.read().clone();
        for channel in channels {
            channel.handle(event);
        }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(FeatureRegistry::new())
    }
}
