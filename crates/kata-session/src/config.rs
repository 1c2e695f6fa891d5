//! Startup configuration for the session manager.

use std::collections::HashMap;

use kata_core::{SpaceConnection, SpaceConnectionFactory, SpaceEventSender, SpaceId};
use kata_protocol::GraphicsMessage;
use tokio::sync::mpsc;

use crate::hosted::HostedObjectId;

/// Space connection constructors, keyed by URL scheme.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<String, SpaceConnectionFactory>,
}

impl ProtocolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor used for spaces whose URL scheme is `scheme`.
    ///
    /// Registering a scheme again replaces the previous handler.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&SpaceId, SpaceEventSender) -> Box<dyn SpaceConnection> + Send + Sync + 'static,
    {
        let scheme = scheme.to_ascii_lowercase();
        if self.handlers.contains_key(&scheme) {
            tracing::warn!("Overwriting protocol handler for {scheme}");
        }
        self.handlers.insert(scheme, Box::new(factory));
    }

    /// Handler for `scheme`, if one is registered.
    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<&SpaceConnectionFactory> {
        self.handlers.get(scheme)
    }

    #[must_use]
    pub fn contains(&self, scheme: &str) -> bool {
        self.handlers.contains_key(scheme)
    }

    /// Registered schemes, in no particular order.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("schemes", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Requests a script makes of the object host itself rather than of a space.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Instantiate a new object running `script`.
    CreateObject {
        from: HostedObjectId,
        script: String,
        constructor: String,
        args: serde_json::Value,
    },
    /// Renderer command, forwarded verbatim.
    Graphics {
        from: HostedObjectId,
        message: GraphicsMessage,
    },
}

/// Session manager configuration.
#[derive(Debug, Default)]
pub struct SessionConfig {
    /// Space protocol handlers.
    pub protocols: ProtocolRegistry,
    /// Where object-creation and graphics requests go. Dropped if unset.
    pub host_events: Option<mpsc::UnboundedSender<HostEvent>>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(protocols: ProtocolRegistry) -> Self {
        Self {
            protocols,
            host_events: None,
        }
    }

    /// Configuration with the in-process `loop://` space registered.
    #[cfg(feature = "loopback")]
    #[must_use]
    pub fn with_loopback() -> Self {
        let mut protocols = ProtocolRegistry::new();
        protocols.register(crate::loopback::LOOPBACK_SCHEME, crate::loopback::factory);
        Self::new(protocols)
    }

    #[must_use]
    pub fn with_host_events(mut self, tx: mpsc::UnboundedSender<HostEvent>) -> Self {
        self.host_events = Some(tx);
        self
    }
}
