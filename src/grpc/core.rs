use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::config::ConfigService;
use crate::events::{Event, EventBus, EventKind, Subscriber};
use crate::grpc::proto::{self, route_change_event::Kind};
use crate::grpc::{external_route_to_proto, route_to_proto, target_to_proto};
use crate::proxy::ProxyService;

/// Buffered events per watcher; a slow consumer overflows and drops.
const WATCHER_BUFFER: usize = 10;

/// Connected `WatchRouteChanges` streams. Broadcast never blocks: a full
/// buffer drops the event with a warning, a closed receiver unregisters the
/// watcher.
#[derive(Default)]
pub struct WatcherSet {
    next_id: AtomicU64,
    senders: RwLock<HashMap<u64, mpsc::Sender<proto::RouteChangeEvent>>>,
}

impl WatcherSet {
    pub fn new() -> Arc<WatcherSet> {
        Arc::new(WatcherSet::default())
    }

    fn register(&self) -> (u64, mpsc::Receiver<proto::RouteChangeEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        self.senders
            .write()
            .expect("watcher lock poisoned")
            .insert(id, tx);
        tracing::debug!(watcher = id, "watcher connected");
        (id, rx)
    }

    fn remove(&self, id: u64) {
        if self
            .senders
            .write()
            .expect("watcher lock poisoned")
            .remove(&id)
            .is_some()
        {
            tracing::debug!(watcher = id, "watcher disconnected");
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.senders.read().expect("watcher lock poisoned").len()
    }

    pub fn broadcast(&self, event: proto::RouteChangeEvent) {
        let mut closed = Vec::new();
        {
            let senders = self.senders.read().expect("watcher lock poisoned");
            for (id, sender) in senders.iter() {
                match sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(watcher = id, "watcher buffer full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        for id in closed {
            self.remove(id);
        }
    }
}

/// Stream handed to a watcher. Dropping it (client disconnect or server
/// shutdown) unregisters the watcher exactly once.
pub struct WatcherStream {
    id: u64,
    set: Arc<WatcherSet>,
    inner: ReceiverStream<proto::RouteChangeEvent>,
}

impl Stream for WatcherStream {
    type Item = Result<proto::RouteChangeEvent, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl Drop for WatcherStream {
    fn drop(&mut self) {
        self.set.remove(self.id);
    }
}

fn change(kind: Kind, domain: &str) -> proto::RouteChangeEvent {
    proto::RouteChangeEvent {
        kind: kind as i32,
        domain: domain.to_string(),
    }
}

/// Bus subscriber translating platform events into watcher notifications: a
/// push invalidates its route's domain, a reload invalidates everything.
pub struct WatcherEvents {
    pub watchers: Arc<WatcherSet>,
    pub config: Arc<ConfigService>,
}

impl Subscriber for WatcherEvents {
    fn name(&self) -> &str {
        "watchers"
    }

    fn can_handle(&self, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::ImagePushed
                | EventKind::ConfigReload
                | EventKind::ManualReload
                | EventKind::RouteAdded
                | EventKind::RouteRemoved
                | EventKind::RouteDegraded
        )
    }

    fn handle(&self, event: &Event) {
        match event {
            Event::ImagePushed {
                name, reference, ..
            } => {
                let watchers = Arc::clone(&self.watchers);
                let config = Arc::clone(&self.config);
                let (name, reference) = (name.clone(), reference.clone());
                tokio::spawn(async move {
                    if let Some(route) = config.route_for_image(&name, &reference).await {
                        watchers.broadcast(change(Kind::Invalidate, &route.domain));
                    }
                });
            }
            Event::ConfigReload | Event::ManualReload => {
                self.watchers.broadcast(change(Kind::InvalidateAll, ""));
            }
            Event::RouteAdded { domain } => {
                self.watchers.broadcast(change(Kind::RouteAdded, domain));
            }
            Event::RouteRemoved { domain } => {
                self.watchers.broadcast(change(Kind::RouteRemoved, domain));
            }
            Event::RouteDegraded { domain } => {
                self.watchers.broadcast(change(Kind::RouteDegraded, domain));
            }
        }
    }
}

/// The unauthenticated core surface used by co-located components and
/// trusted peers: target resolution, route listings, push notification and
/// the route-change watch stream.
pub struct CoreServer {
    proxy: Arc<ProxyService>,
    config: Arc<ConfigService>,
    events: Arc<EventBus>,
    watchers: Arc<WatcherSet>,
}

impl CoreServer {
    pub fn new(
        proxy: Arc<ProxyService>,
        config: Arc<ConfigService>,
        events: Arc<EventBus>,
        watchers: Arc<WatcherSet>,
    ) -> CoreServer {
        CoreServer {
            proxy,
            config,
            events,
            watchers,
        }
    }
}

#[tonic::async_trait]
impl proto::core_service_server::CoreService for CoreServer {
    async fn get_target(
        &self,
        request: Request<proto::GetTargetRequest>,
    ) -> Result<Response<proto::GetTargetResponse>, Status> {
        let domain = request.into_inner().domain;
        let target = self.proxy.get_target(&domain).await.map_err(Status::from)?;
        Ok(Response::new(proto::GetTargetResponse {
            target: Some(target_to_proto(target)),
        }))
    }

    async fn get_routes(
        &self,
        _request: Request<proto::GetRoutesRequest>,
    ) -> Result<Response<proto::GetRoutesResponse>, Status> {
        let routes = self.config.get_routes().await;
        Ok(Response::new(proto::GetRoutesResponse {
            routes: routes.into_iter().map(route_to_proto).collect(),
        }))
    }

    async fn get_external_routes(
        &self,
        _request: Request<proto::GetExternalRoutesRequest>,
    ) -> Result<Response<proto::GetExternalRoutesResponse>, Status> {
        let routes = self.config.external_routes().await;
        Ok(Response::new(proto::GetExternalRoutesResponse {
            routes: routes.into_iter().map(external_route_to_proto).collect(),
        }))
    }

    async fn notify_image_pushed(
        &self,
        request: Request<proto::NotifyImagePushedRequest>,
    ) -> Result<Response<proto::NotifyImagePushedResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() || req.reference.is_empty() {
            return Err(Status::invalid_argument("name and reference are required"));
        }
        let matched = self.config.route_for_image(&req.name, &req.reference).await;
        self.events.publish(Event::ImagePushed {
            name: req.name,
            reference: req.reference,
            manifest: bytes::Bytes::new(),
            annotations: HashMap::new(),
        });
        Ok(Response::new(proto::NotifyImagePushedResponse {
            route_matched: matched.is_some(),
            domain: matched.map(|r| r.domain).unwrap_or_default(),
        }))
    }

    type WatchRouteChangesStream =
        Pin<Box<dyn Stream<Item = Result<proto::RouteChangeEvent, Status>> + Send + 'static>>;

    async fn watch_route_changes(
        &self,
        _request: Request<proto::WatchRouteChangesRequest>,
    ) -> Result<Response<Self::WatchRouteChangesStream>, Status> {
        let (id, rx) = self.watchers.register();
        let stream = WatcherStream {
            id,
            set: Arc::clone(&self.watchers),
            inner: ReceiverStream::new(rx),
        };
        Ok(Response::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_watcher_once() {
        let set = WatcherSet::new();
        let (_id_a, mut rx_a) = set.register();
        let (_id_b, mut rx_b) = set.register();

        set.broadcast(change(Kind::Invalidate, "app.example.com"));

        for rx in [&mut rx_a, &mut rx_b] {
            let event = rx.try_recv().expect("event delivered");
            assert_eq!(event.kind, Kind::Invalidate as i32);
            assert_eq!(event.domain, "app.example.com");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let set = WatcherSet::new();
        let (_id, mut rx) = set.register();

        for _ in 0..WATCHER_BUFFER + 5 {
            set.broadcast(change(Kind::InvalidateAll, ""));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, WATCHER_BUFFER);
    }

    #[tokio::test]
    async fn closed_receiver_is_unregistered_on_next_broadcast() {
        let set = WatcherSet::new();
        let (_id, rx) = set.register();
        assert_eq!(set.watcher_count(), 1);

        drop(rx);
        set.broadcast(change(Kind::RouteAdded, "app.example.com"));
        assert_eq!(set.watcher_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_unregisters_exactly_once() {
        let set = WatcherSet::new();
        let (id, rx) = set.register();
        let stream = WatcherStream {
            id,
            set: Arc::clone(&set),
            inner: ReceiverStream::new(rx),
        };
        assert_eq!(set.watcher_count(), 1);
        drop(stream);
        assert_eq!(set.watcher_count(), 0);
    }
}
