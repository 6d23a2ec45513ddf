use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use udptunnel_core::{
    Backoff, BackoffPolicy, Connector, ConnectorError, Lifecycle, Message, Mode, Switch,
    WaitOutcome,
};

use super::conn::Connection;
use super::{HANDSHAKE_TIMEOUT, QUEUE_CAPACITY, bind_with_retry};

/// Transport security for accepted connections.
#[derive(Clone)]
pub enum ServerSecurity {
    Plain,
    Tls(TlsAcceptor),
}

type Clients = Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<Message>>>>;

/// TCP/TLS server. Each accepted client is framed independently; messages
/// relayed to this side are sent to every connected client.
pub struct StreamServer {
    lifecycle: Lifecycle,
    addr: SocketAddr,
    security: ServerSecurity,
    policy: BackoffPolicy,
    mode: Mode,
    clients: Clients,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl StreamServer {
    pub fn new(addr: SocketAddr, security: ServerSecurity, policy: BackoffPolicy, mode: Mode) -> Self {
        let scheme = match security {
            ServerSecurity::Plain => "tcp",
            ServerSecurity::Tls(_) => "tls",
        };
        let (bound, _) = watch::channel(None);
        Self {
            lifecycle: Lifecycle::new(format!("{scheme}/server:{addr}")),
            addr,
            security,
            policy,
            mode,
            clients: Arc::new(RwLock::new(HashMap::new())),
            bound,
        }
    }

    /// Address of the listening socket, once bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.bound.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|addr| *addr)
    }

    /// Number of currently connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Bind, accept until shutdown, and rebind with backoff when accepting
    /// fails.
    async fn listen(&self, client: &ClientTask, backoff: &mut Backoff, tasks: &TaskTracker) -> Result<(), ConnectorError> {
        loop {
            let Some(listener) = bind_with_retry(self.tag(), self.addr, backoff, self.lifecycle.token()).await? else {
                return Ok(());
            };
            let local = listener.local_addr().map_err(|e| ConnectorError::io(self.tag(), e))?;
            self.bound.send_replace(Some(local));
            info!(connector = %self.tag(), addr = %local, "Listening");

            let result = self.accept_loop(&listener, client, tasks).await;
            self.bound.send_replace(None);

            match result {
                Ok(()) => return Ok(()),
                Err(e) => warn!(connector = %self.tag(), error = %e, "Accept failed"),
            }

            match backoff.wait(self.tag(), self.lifecycle.token()).await {
                WaitOutcome::Retry => {}
                WaitOutcome::Cancelled => return Ok(()),
                WaitOutcome::Exhausted => {
                    return Err(ConnectorError::RetriesExhausted {
                        connector: self.tag().to_string(),
                        attempts: backoff.attempt().saturating_sub(1),
                    });
                }
            }
        }
    }

    async fn accept_loop(&self, listener: &TcpListener, client: &ClientTask, tasks: &TaskTracker) -> io::Result<()> {
        let cancel = self.lifecycle.token();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(connector = %self.tag(), peer = %peer, "Client connected");
                    tasks.spawn(client.clone().serve(stream, peer));
                }
                () = cancel.cancelled() => return Ok(()),
            }
        }
    }

    fn client(&self, switch: Switch, cancel: CancellationToken) -> ClientTask {
        ClientTask {
            tag: self.tag().to_string(),
            mode: self.mode,
            security: self.security.clone(),
            clients: Arc::clone(&self.clients),
            switch,
            cancel,
        }
    }
}

/// Everything one accepted connection needs, owned so it can run on its own
/// task.
#[derive(Clone)]
struct ClientTask {
    tag: String,
    mode: Mode,
    security: ServerSecurity,
    clients: Clients,
    switch: Switch,
    cancel: CancellationToken,
}

impl ClientTask {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let (queue, mut outbound) = mpsc::channel(QUEUE_CAPACITY);
        let conn = Connection {
            tag: &self.tag,
            peer,
            mode: self.mode,
            switch: &self.switch,
        };

        let result = match &self.security {
            ServerSecurity::Plain => {
                self.clients.write().await.insert(peer, queue);
                conn.serve(stream, &mut outbound, &self.cancel).await
            }
            ServerSecurity::Tls(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    self.clients.write().await.insert(peer, queue);
                    conn.serve(tls, &mut outbound, &self.cancel).await
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")),
            },
        };

        self.clients.write().await.remove(&peer);
        match result {
            Ok(()) => info!(connector = %self.tag, peer = %peer, "Client disconnected"),
            Err(e) => warn!(connector = %self.tag, peer = %peer, error = %e, "Client connection failed"),
        }
    }
}

#[async_trait]
impl Connector for StreamServer {
    fn tag(&self) -> &str {
        self.lifecycle.tag()
    }

    async fn run(&self, switch: Switch) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.guard();
        let mut backoff = Backoff::new(self.policy);
        let tasks = TaskTracker::new();
        let clients_cancel = self.lifecycle.token().child_token();
        let client = self.client(switch, clients_cancel.clone());

        let result = self.listen(&client, &mut backoff, &tasks).await;

        clients_cancel.cancel();
        tasks.close();
        tasks.wait().await;
        result
    }

    fn send(&self, id: u32, payload: Vec<u8>) {
        let clients = Arc::clone(&self.clients);
        let tag = self.tag().to_string();
        tokio::spawn(async move {
            let clients = clients.read().await;
            if clients.is_empty() {
                debug!(connector = %tag, id, "No clients connected, dropping message");
                return;
            }
            for (peer, queue) in clients.iter() {
                if queue.try_send(Message::new(id, payload.clone())).is_err() {
                    warn!(connector = %tag, id, peer = %peer, "Client queue full, dropping message");
                }
            }
        });
    }

    async fn close(&self) {
        self.lifecycle.close().await;
    }
}
