//! Event routing
//!
//! The router sits between the source stream producer and the downstream
//! workers. For each UPR event it admits against the routing map, applies
//! the optional key filter, composes the destination memcached request, and
//! dispatches to the worker owning the event's vBucket. Routing is a pure
//! function of the event, the map, the filter, and the extended-metadata
//! mode; the router keeps no other state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::wire::{
    decode_cr_mode, encode_document_extras, encode_snapshot_extras, CrMode, UprEvent,
    WrappedMcRequest,
};

/// Errors from routing.
#[derive(Debug, Error)]
pub enum RouterError {
    /// No routing map has been configured.
    #[error("no routing map has been defined for the router")]
    NoRoutingMap,

    /// The routing map has no entry for the event's vBucket.
    #[error("routing map has no entry for vbucket {0}")]
    InvalidRoutingMap(u16),

    /// The filter expression failed to compile.
    #[error("invalid filter expression: {0}")]
    InvalidFilter(#[from] regex::Error),
}

/// Observability events raised by the router.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// An event was dropped by the key filter.
    DataFiltered {
        /// Topic the router serves.
        topic: String,
        /// vBucket of the dropped event.
        vbucket: u16,
        /// Key of the dropped event.
        key: Bytes,
        /// Sequence number of the dropped event.
        seqno: u64,
    },
}

/// Injectable constructor for the wrapped requests a router emits.
pub type ReqCreator = Arc<dyn Fn(&str) -> WrappedMcRequest + Send + Sync>;

/// Transforms UPR events into destination requests and dispatches them to
/// downstream workers by vBucket.
pub struct Router {
    id: String,
    topic: String,
    filter: Option<regex::bytes::Regex>,
    routing_map: RwLock<Option<HashMap<u16, String>>>,
    req_creator: Option<ReqCreator>,
    ext_metadata_supported: bool,
    events: broadcast::Sender<RouterEvent>,
}

impl Router {
    /// Create a router. A non-empty `filter_expression` is compiled here;
    /// an invalid pattern fails construction.
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        filter_expression: &str,
        routing_map: Option<HashMap<u16, String>>,
        req_creator: Option<ReqCreator>,
        ext_metadata_supported: bool,
    ) -> Result<Self, RouterError> {
        let filter = if filter_expression.is_empty() {
            None
        } else {
            Some(regex::bytes::Regex::new(filter_expression)?)
        };
        let (events, _) = broadcast::channel(64);
        let router = Self {
            id: id.into(),
            topic: topic.into(),
            filter,
            routing_map: RwLock::new(routing_map),
            req_creator,
            ext_metadata_supported,
            events,
        };
        info!(
            router = %router.id,
            downstreams = router.routing_map.read().as_ref().map_or(0, |m| {
                m.values().collect::<std::collections::HashSet<_>>().len()
            }),
            "router created"
        );
        Ok(router)
    }

    /// Router id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribe to the router's observability events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Route one event.
    ///
    /// Returns the (usually singleton) mapping of worker id to composed
    /// request; an empty map means the event was dropped by the filter.
    pub fn route(
        &self,
        event: &UprEvent,
    ) -> Result<HashMap<String, WrappedMcRequest>, RouterError> {
        let worker = {
            let map = self.routing_map.read();
            let map = map.as_ref().ok_or(RouterError::NoRoutingMap)?;
            map.get(&event.vbucket)
                .ok_or(RouterError::InvalidRoutingMap(event.vbucket))?
                .clone()
        };

        debug!(
            router = %self.id,
            key = %String::from_utf8_lossy(&event.key),
            vbno = event.vbucket,
            worker = %worker,
            "routing event"
        );

        if let Some(filter) = &self.filter {
            if !filter.is_match(&event.key) {
                let _ = self.events.send(RouterEvent::DataFiltered {
                    topic: self.topic.clone(),
                    vbucket: event.vbucket,
                    key: event.key.clone(),
                    seqno: event.seqno,
                });
                debug!(
                    router = %self.id,
                    key = %String::from_utf8_lossy(&event.key),
                    vbno = event.vbucket,
                    "event filtered out"
                );
                return Ok(HashMap::new());
            }
        }

        let mut result = HashMap::with_capacity(1);
        result.insert(worker, self.compose_request(event));
        Ok(result)
    }

    /// Build the destination request for an event.
    pub fn compose_request(&self, event: &UprEvent) -> WrappedMcRequest {
        let mut wrapped = match &self.req_creator {
            Some(creator) => creator(&self.topic),
            None => WrappedMcRequest::new(),
        };

        let req = &mut wrapped.req;
        req.cas = event.cas;
        req.opaque = 0;
        req.vbucket = event.vbucket;
        req.key = event.key.clone();
        req.body = event.value.clone();
        req.opcode = event.opcode;

        if event.opcode.is_document_op() {
            req.extras = encode_document_extras(event, self.ext_metadata_supported);
            if self.ext_metadata_supported {
                // the blob itself travels out-of-band on the request
                req.ext_meta = event.ext_meta.clone();
            }
        } else {
            req.extras = encode_snapshot_extras(event);
        }

        wrapped.seqno = event.seqno;
        wrapped.start_time = Instant::now();
        wrapped.construct_unique_key();
        wrapped.cr_mode = if self.ext_metadata_supported {
            decode_cr_mode(&wrapped.req.ext_meta)
        } else {
            CrMode::RevId
        };
        wrapped
    }

    /// Replace the routing map. Must not be called while events are in
    /// flight through this router.
    pub fn set_routing_map(&self, routing_map: HashMap<u16, String>) {
        debug!(router = %self.id, vbuckets = routing_map.len(), "routing map replaced");
        *self.routing_map.write() = Some(routing_map);
    }

    /// Current routing map, if configured.
    pub fn routing_map(&self) -> Option<HashMap<u16, String>> {
        self.routing_map.read().clone()
    }

    /// Inverse mapping: worker id to the vBuckets it serves. Order within
    /// each list is unspecified.
    pub fn routing_map_by_downstreams(&self) -> HashMap<String, Vec<u16>> {
        let mut inverse: HashMap<String, Vec<u16>> = HashMap::new();
        if let Some(map) = self.routing_map.read().as_ref() {
            for (vbno, worker) in map {
                inverse.entry(worker.clone()).or_default().push(*vbno);
            }
        }
        inverse
    }
}
