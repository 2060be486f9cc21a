use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex},
    time::Duration,
};

use strum_macros::{Display, EnumIter, EnumString};
use tokio::sync::RwLock;
use tracing::warn;

use durpc_protocol::{
    CallShape, CancelHandle, ErrorKind, Metadata, Result, RpcParam, SerializeType, Session,
};

use super::{
    balancer::Balancer,
    client::{Client, Opt},
    resolver::Resolver,
};

/// What to do when a call fails with a connectivity error.
#[derive(Debug, Clone, Copy, PartialEq, Display, EnumIter, EnumString)]
pub enum FailMode {
    /// Return the first failure to the caller.
    Failfast = 0,
    /// Retry on another picked address.
    Failover = 1,
    /// Retry on the same address.
    Failtry = 2,
}

/// A client for one service that resolves, balances, and pools connections.
///
/// The resolver pushes address snapshots; each unary call picks an address
/// through the balancer and reuses a pooled connection to it. Streaming calls
/// pick once and stay pinned to that connection.
pub struct BalancedClient {
    opt: Opt,
    service_path: String,
    fail_mode: FailMode,
    retry: u32,
    resolver: Arc<dyn Resolver>,
    balancer: Arc<Mutex<Box<dyn Balancer>>>,
    clients: Arc<RwLock<HashMap<String, Arc<Client>>>>,
}

impl BalancedClient {
    pub fn new(
        service_path: impl Into<String>,
        fail_mode: FailMode,
        resolver: Arc<dyn Resolver>,
        balancer: Box<dyn Balancer>,
        opt: Opt,
    ) -> Self {
        let balancer = Arc::new(Mutex::new(balancer));
        let mut rx = resolver.subscribe();
        {
            let state = rx.borrow().clone();
            balancer.lock().unwrap().update(&state);
        }
        let watch_balancer = balancer.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow().clone();
                watch_balancer.lock().unwrap().update(&state);
            }
        });

        BalancedClient {
            opt,
            service_path: service_path.into(),
            fail_mode,
            retry: 3,
            resolver,
            balancer,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set_retry(&mut self, retry: u32) {
        self.retry = retry;
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    /// Picks an address through the balancer and returns a pooled connection
    /// to it, dialing if the pool has none or only a dead one.
    async fn pick_client(&self) -> Result<Arc<Client>> {
        let address = {
            let mut balancer = self.balancer.lock().unwrap();
            balancer.pick()?
        };
        self.connect_to(&address.addr).await
    }

    async fn connect_to(&self, addr: &str) -> Result<Arc<Client>> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(addr) {
                if !client.is_closed() {
                    return Ok(client.clone());
                }
            }
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(addr) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            clients.remove(addr);
        }
        let client = Arc::new(Client::connect(addr, self.opt.clone()).await?);
        clients.insert(addr.to_owned(), client.clone());
        Ok(client)
    }

    /// Typed one-shot call with failure handling per the configured mode.
    /// Only connectivity failures are retried, connect failures included;
    /// call errors reported by the server go straight back to the caller.
    pub async fn unary<A, R>(
        &self,
        service_method: &str,
        args: &A,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        A: RpcParam,
        R: RpcParam,
    {
        let mut tries = match self.fail_mode {
            FailMode::Failfast => 0,
            _ => self.retry,
        };
        let mut pinned: Option<Arc<Client>> = None;
        loop {
            let attempt = self
                .unary_once(&mut pinned, service_method, args, &metadata, timeout)
                .await;
            match attempt {
                Ok(reply) => return Ok(reply),
                Err(err) if err.kind() == ErrorKind::Transport && tries > 0 => {
                    tries -= 1;
                    warn!(
                        method = %self.full_method(service_method),
                        error = %err,
                        "call failed, retrying"
                    );
                    match self.fail_mode {
                        FailMode::Failover => pinned = None,
                        // failtry re-dials the same address
                        _ => {
                            if let Some(client) = &pinned {
                                if client.is_closed() {
                                    let addr = client.addr().to_owned();
                                    pinned = self.connect_to(&addr).await.ok();
                                }
                            }
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn unary_once<A, R>(
        &self,
        pinned: &mut Option<Arc<Client>>,
        service_method: &str,
        args: &A,
        metadata: &Metadata,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        A: RpcParam,
        R: RpcParam,
    {
        let client = match pinned {
            Some(client) => client.clone(),
            None => {
                let client = self.pick_client().await?;
                *pinned = Some(client.clone());
                client
            }
        };
        let payload = args.into_bytes(client.serialize_type())?;
        let reply = client
            .unary(
                &self.service_path,
                service_method,
                payload,
                metadata.clone(),
                timeout,
            )
            .await?;
        R::from_slice(client.serialize_type(), &reply)
    }

    /// Opens a server-streaming call: one request in, many responses out.
    pub async fn server_streaming<A, R>(
        &self,
        service_method: &str,
        args: &A,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<ServerStreamingCall<R>>
    where
        A: RpcParam,
        R: RpcParam,
    {
        let client = self.pick_client().await?;
        let st = client.serialize_type();
        let mut session = client.call_session(
            &self.service_path,
            service_method,
            CallShape::ServerStreaming,
            metadata,
            timeout,
        )?;
        session.send(args.into_bytes(st)?)?;
        session.close_send();
        Ok(ServerStreamingCall {
            session,
            st,
            _reply: PhantomData,
        })
    }

    /// Opens a client-streaming call: many requests in, one response out.
    pub async fn client_streaming<A, R>(
        &self,
        service_method: &str,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<ClientStreamingCall<A, R>>
    where
        A: RpcParam,
        R: RpcParam,
    {
        let client = self.pick_client().await?;
        let st = client.serialize_type();
        let session = client.call_session(
            &self.service_path,
            service_method,
            CallShape::ClientStreaming,
            metadata,
            timeout,
        )?;
        Ok(ClientStreamingCall {
            session,
            st,
            _args: PhantomData,
            _reply: PhantomData,
        })
    }

    /// Opens a bidirectional call with both directions streaming.
    pub async fn bidirectional<A, R>(
        &self,
        service_method: &str,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<BidiCall<A, R>>
    where
        A: RpcParam,
        R: RpcParam,
    {
        let client = self.pick_client().await?;
        let st = client.serialize_type();
        let session = client.call_session(
            &self.service_path,
            service_method,
            CallShape::Bidirectional,
            metadata,
            timeout,
        )?;
        Ok(BidiCall {
            session,
            st,
            _args: PhantomData,
            _reply: PhantomData,
        })
    }

    fn full_method(&self, service_method: &str) -> String {
        format!("{}.{}", self.service_path, service_method)
    }
}

impl Drop for BalancedClient {
    fn drop(&mut self) {
        self.resolver.close();
    }
}

pub struct ServerStreamingCall<R> {
    session: Session,
    st: SerializeType,
    _reply: PhantomData<R>,
}

impl<R: RpcParam> ServerStreamingCall<R> {
    /// Next response, or `None` once the server finishes the stream.
    pub async fn recv(&mut self) -> Result<Option<R>> {
        match self.session.recv().await? {
            Some(payload) => Ok(Some(R::from_slice(self.st, &payload)?)),
            None => Ok(None),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.session.cancel_handle()
    }
}

pub struct ClientStreamingCall<A, R> {
    session: Session,
    st: SerializeType,
    _args: PhantomData<A>,
    _reply: PhantomData<R>,
}

impl<A: RpcParam, R: RpcParam> ClientStreamingCall<A, R> {
    pub fn send(&mut self, args: &A) -> Result<()> {
        self.session.send(args.into_bytes(self.st)?)
    }

    /// Half-closes the request stream and waits for the single response.
    pub async fn finish(self) -> Result<R> {
        let reply = self.session.finish().await?;
        R::from_slice(self.st, &reply)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.session.cancel_handle()
    }
}

pub struct BidiCall<A, R> {
    session: Session,
    st: SerializeType,
    _args: PhantomData<A>,
    _reply: PhantomData<R>,
}

impl<A: RpcParam, R: RpcParam> BidiCall<A, R> {
    pub fn send(&mut self, args: &A) -> Result<()> {
        self.session.send(args.into_bytes(self.st)?)
    }

    pub async fn recv(&mut self) -> Result<Option<R>> {
        match self.session.recv().await? {
            Some(payload) => Ok(Some(R::from_slice(self.st, &payload)?)),
            None => Ok(None),
        }
    }

    pub fn close_send(&mut self) {
        self.session.close_send();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.session.cancel_handle()
    }
}
