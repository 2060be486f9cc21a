use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use tokio::{
    net::lookup_host,
    sync::{watch, Notify},
    time,
};
use tracing::warn;

use durpc_protocol::{Error, ErrorKind, Result};

/// A connectable network location produced by a resolver and consumed by a
/// balancer.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub addr: String,
    pub metadata: HashMap<String, String>,
}

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Address {
            addr: addr.into(),
            metadata: HashMap::new(),
        }
    }
}

/// A complete snapshot of resolved addresses. Each push replaces the prior
/// set wholesale; the version stamp lets consumers detect replacement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressSet {
    pub version: u64,
    pub addresses: Vec<Address>,
}

/// What the resolver last told its watchers: the current set, if any push
/// succeeded yet, and the latest resolution error, if the most recent attempt
/// failed.
#[derive(Debug, Clone, Default)]
pub struct ResolverState {
    pub address_set: Option<AddressSet>,
    pub error: Option<Error>,
}

/// Maps a symbolic endpoint name to addresses and pushes updates. State
/// travels over a watch channel, so watchers always observe a complete,
/// atomically replaced snapshot.
pub trait Resolver: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<ResolverState>;

    /// Hint to refresh immediately; resolvers that cannot refresh on demand
    /// treat this as a no-op.
    fn resolve_now(&self) {}

    /// Releases resolver resources; no pushes happen afterwards.
    fn close(&self) {}
}

/// Resolves to a fixed address list, pushed once at construction.
pub struct StaticResolver {
    tx: watch::Sender<ResolverState>,
}

impl StaticResolver {
    pub fn new(addresses: Vec<Address>) -> Self {
        let state = ResolverState {
            address_set: Some(AddressSet {
                version: 1,
                addresses,
            }),
            error: None,
        };
        let (tx, _rx) = watch::channel(state);
        StaticResolver { tx }
    }
}

impl Resolver for StaticResolver {
    fn subscribe(&self) -> watch::Receiver<ResolverState> {
        self.tx.subscribe()
    }
}

/// Re-resolves a DNS name on a timer. A failed lookup keeps the previous set
/// and attaches the error; the next successful probe clears it.
pub struct DnsResolver {
    tx: Arc<watch::Sender<ResolverState>>,
    probe: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl DnsResolver {
    pub fn new(endpoint: &str, interval: Duration) -> Self {
        let (tx, _rx) = watch::channel(ResolverState::default());
        let tx = Arc::new(tx);
        let probe = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let endpoint = endpoint.to_owned();
        let task_tx = tx.clone();
        let task_probe = probe.clone();
        let task_closed = closed.clone();
        tokio::spawn(async move {
            let mut version = 0u64;
            loop {
                if task_closed.load(Ordering::SeqCst) {
                    return;
                }
                let state = match lookup_host(endpoint.as_str()).await {
                    Ok(addrs) => {
                        version += 1;
                        let addresses = addrs.map(|sa| Address::new(sa.to_string())).collect();
                        ResolverState {
                            address_set: Some(AddressSet { version, addresses }),
                            error: None,
                        }
                    }
                    Err(err) => {
                        warn!(endpoint = %endpoint, error = %err, "name lookup failed");
                        let previous = task_tx.borrow().address_set.clone();
                        ResolverState {
                            address_set: previous,
                            error: Some(Error::new(
                                ErrorKind::Transport,
                                format!("name lookup for {endpoint} failed: {err}"),
                            )),
                        }
                    }
                };
                if task_closed.load(Ordering::SeqCst) {
                    return;
                }
                task_tx.send_replace(state);
                tokio::select! {
                    _ = time::sleep(interval) => {}
                    _ = task_probe.notified() => {}
                }
            }
        });

        DnsResolver { tx, probe, closed }
    }
}

impl Resolver for DnsResolver {
    fn subscribe(&self) -> watch::Receiver<ResolverState> {
        self.tx.subscribe()
    }

    fn resolve_now(&self) {
        self.probe.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.probe.notify_one();
    }
}

pub type ResolverFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Resolver>> + Send + Sync>;

/// Scheme-to-factory table for building resolvers from `scheme://endpoint`
/// targets. At most one factory per scheme; the last registration wins.
pub struct ResolverRegistry {
    factories: RwLock<HashMap<String, ResolverFactory>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        ResolverRegistry {
            factories: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, scheme: &str, factory: ResolverFactory) {
        let mut factories = self.factories.write().unwrap();
        factories.insert(scheme.to_owned(), factory);
    }

    pub fn build(&self, target: &str) -> Result<Arc<dyn Resolver>> {
        let (scheme, endpoint) = target.split_once("://").ok_or_else(|| {
            Error::new(
                ErrorKind::Other,
                format!("malformed target {target:?}, expected scheme://endpoint"),
            )
        })?;
        let factory = self
            .factories
            .read()
            .unwrap()
            .get(scheme)
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("no resolver registered for scheme {scheme:?}"),
                )
            })?;
        factory(endpoint)
    }
}

impl Default for ResolverRegistry {
    /// Ships "static" (comma-separated host:port list) and "dns" (periodic
    /// probe every 30s) resolvers.
    fn default() -> Self {
        let registry = ResolverRegistry::new();
        registry.register(
            "static",
            Arc::new(|endpoint| {
                let addresses = endpoint
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(Address::new)
                    .collect();
                Ok(Arc::new(StaticResolver::new(addresses)) as Arc<dyn Resolver>)
            }),
        );
        registry.register(
            "dns",
            Arc::new(|endpoint| {
                Ok(Arc::new(DnsResolver::new(endpoint, Duration::from_secs(30)))
                    as Arc<dyn Resolver>)
            }),
        );
        registry
    }
}
