//! # Dispatch Table
//!
//! Maps application protocol ids to handlers. The table is built once at
//! startup through [`DispatchBuilder`] and is immutable afterwards, so
//! lookups need no locking.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

use crate::control::is_control;
use crate::error::DispatchError;
use crate::peer::PeerId;
use crate::router::Channel;

/// One inbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub peer_id: PeerId,
    pub channel: Channel,
    pub protocol_id: u16,
    pub payload: Bytes,
}

type Handler<C> = Box<dyn Fn(&C, Inbound) + Send + Sync>;

pub struct DispatchBuilder<C> {
    handlers: HashMap<u16, Handler<C>>,
    fallback: Option<Handler<C>>,
}

impl<C> DispatchBuilder<C> {
    pub fn new() -> Self {
        DispatchBuilder {
            handlers: HashMap::new(),
            fallback: None,
        }
    }

    /// Register `handler` for `protocol_id`. Ids in the control range and
    /// ids registered twice are rejected.
    pub fn on<F>(mut self, protocol_id: u16, handler: F) -> Result<Self, DispatchError>
    where
        F: Fn(&C, Inbound) + Send + Sync + 'static,
    {
        if is_control(protocol_id) {
            return Err(DispatchError::Reserved(protocol_id));
        }
        if self.handlers.contains_key(&protocol_id) {
            return Err(DispatchError::Duplicate(protocol_id));
        }
        self.handlers.insert(protocol_id, Box::new(handler));
        Ok(self)
    }

    /// Handler for ids nobody registered.
    pub fn otherwise<F>(mut self, handler: F) -> Self
    where
        F: Fn(&C, Inbound) + Send + Sync + 'static,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> DispatchTable<C> {
        DispatchTable {
            handlers: self.handlers,
            fallback: self.fallback,
        }
    }
}

impl<C> Default for DispatchBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DispatchTable<C> {
    handlers: HashMap<u16, Handler<C>>,
    fallback: Option<Handler<C>>,
}

impl<C> fmt::Debug for DispatchTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("protocol_ids", &ids)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<C> DispatchTable<C> {
    pub fn builder() -> DispatchBuilder<C> {
        DispatchBuilder::new()
    }

    /// Route one message. Returns false when no handler (and no fallback)
    /// took it.
    pub fn dispatch(&self, ctx: &C, msg: Inbound) -> bool {
        match self.handlers.get(&msg.protocol_id).or(self.fallback.as_ref()) {
            Some(handler) => {
                handler(ctx, msg);
                true
            }
            None => {
                tracing::debug!(
                    peer_id = %msg.peer_id,
                    protocol_id = msg.protocol_id,
                    "no handler for protocol id"
                );
                false
            }
        }
    }

    pub fn handles(&self, protocol_id: u16) -> bool {
        self.handlers.contains_key(&protocol_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
