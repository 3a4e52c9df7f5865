//! Long-running watch loops.
//!
//! One `Watcher` runs per kind. Each session lists the collection, replays
//! the listed objects as `Added` events, then streams changes from the
//! list's revision. A bounded queue sits between the watch producer and the
//! single consumer that dispatches to handlers; when the queue is full the
//! producer blocks, backpressuring the API read rather than dropping
//! events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kubernetes::{Client, ListParams, Resource, WatchEvent, WatchParams};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WatcherSettings;

/// A typed resource event as seen by handlers.
#[derive(Debug)]
pub enum Event<R> {
    Added(R),
    Modified(R),
    Deleted(R),
}

impl<R> Event<R> {
    pub fn resource(&self) -> &R {
        match self {
            Event::Added(resource) | Event::Modified(resource) | Event::Deleted(resource) => {
                resource
            }
        }
    }
}

#[async_trait]
pub trait EventHandler<R>: Send + Sync {
    async fn on_event(&self, event: &Event<R>) -> crate::Result<()>;

    /// The session delivering events ended; any state derived from it is
    /// stale and must be dropped.
    async fn on_session_closed(&self);
}

enum Item<R> {
    Event(Event<R>),
    SessionClosed,
}

type Filter<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

pub struct Watcher<R: Resource> {
    client: Client,
    settings: WatcherSettings,
    filter: Option<Filter<R>>,
    handlers: Vec<Arc<dyn EventHandler<R>>>,
}

impl<R: Resource + Send + 'static> Watcher<R> {
    pub fn new(client: Client, settings: WatcherSettings) -> Self {
        Watcher {
            client,
            settings,
            filter: None,
            handlers: Vec::new(),
        }
    }

    /// Drop resources the predicate rejects before they are enqueued.
    pub fn with_filter(mut self, filter: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Handlers are invoked serially, in registration order.
    pub fn register(&mut self, handler: Arc<dyn EventHandler<R>>) {
        self.handlers.push(handler);
    }

    /// Run sessions until `shutdown` is cancelled. Every session end, clean
    /// or not, is followed by a session-closed notification to the
    /// handlers before the next session opens.
    pub async fn run(self, shutdown: CancellationToken) {
        let Watcher {
            client,
            settings,
            filter,
            handlers,
        } = self;

        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let consumer = tokio::spawn(consume(rx, handlers));

        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            debug!(message = "opening watch session", kind = R::KIND);

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(settings.timeout)) => Ok(()),
                result = session::<R>(&client, &settings, filter.as_deref(), &tx) => result,
            };

            // Handlers must see the close before events of the next session.
            if tx.send(Item::SessionClosed).await.is_err() {
                break;
            }

            match outcome {
                Ok(()) => {
                    debug!(message = "watch session ended", kind = R::KIND);
                    backoff.reset();
                }
                Err(err) => {
                    warn!(message = "watch session failed", kind = R::KIND, %err);
                    counter!("reflector_session_restarts_total", 1, "kind" => R::KIND);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff.next()) => {}
                    }
                }
            }
        }

        // Producer is done; the consumer drains whatever is queued and
        // exits when the channel closes.
        drop(tx);
        let _ = consumer.await;
    }
}

/// One list+watch session. Returns `Ok` on orderly end-of-stream and `Err`
/// on any API or transport failure; the caller owns restart and backoff.
async fn session<R: Resource>(
    client: &Client,
    settings: &WatcherSettings,
    filter: Option<&(dyn Fn(&R) -> bool + Send + Sync)>,
    tx: &mpsc::Sender<Item<R>>,
) -> Result<(), kubernetes::Error> {
    let keep = |resource: &R| filter.map_or(true, |f| f(resource));

    // Enumerate current state; listed objects replay as Added so a fresh
    // session rediscovers every link.
    let mut params = ListParams {
        limit: Some(500),
        ..Default::default()
    };
    let mut revision = None;
    loop {
        let list = client.list::<R>(&params).await?;
        if list.metadata.resource_version.is_some() {
            revision = list.metadata.resource_version;
        }

        for resource in list.items {
            if keep(&resource) {
                counter!("reflector_events_total", 1, "kind" => R::KIND);
                if tx.send(Item::Event(Event::Added(resource))).await.is_err() {
                    return Ok(());
                }
            }
        }

        match list.metadata.r#continue {
            Some(token) => params.continue_token = Some(token),
            None => break,
        }
    }

    let revision = revision.unwrap_or_else(|| String::from("0"));
    let params = WatchParams {
        timeout: Some(settings.timeout.min(u32::MAX as u64) as u32),
        ..Default::default()
    };
    let mut stream = client.watch::<R>(&params, &revision).await?;

    while let Some(result) = stream.next().await {
        let event = match result? {
            WatchEvent::Added(resource) => Event::Added(resource),
            WatchEvent::Modified(resource) => Event::Modified(resource),
            WatchEvent::Deleted(resource) => Event::Deleted(resource),
            WatchEvent::Error(resp) => return Err(kubernetes::Error::Api(resp)),
        };

        if keep(event.resource()) {
            counter!("reflector_events_total", 1, "kind" => R::KIND);
            if tx.send(Item::Event(event)).await.is_err() {
                return Ok(());
            }
        }
    }

    Ok(())
}

async fn consume<R>(mut rx: mpsc::Receiver<Item<R>>, handlers: Vec<Arc<dyn EventHandler<R>>>) {
    while let Some(item) = rx.recv().await {
        match item {
            Item::Event(event) => {
                for handler in &handlers {
                    if let Err(err) = handler.on_event(&event).await {
                        warn!(message = "event handler failed", %err);
                    }
                }
            }
            Item::SessionClosed => {
                for handler in &handlers {
                    handler.on_session_closed().await;
                }
            }
        }
    }
}

/// Doubling delay between failed sessions, reset after a session that ends
/// cleanly.
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            current: base,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}
