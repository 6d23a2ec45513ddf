use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use udptunnel_core::message::hex_dump;
use udptunnel_core::{
    Backoff, BackoffPolicy, Connector, ConnectorError, Lifecycle, Mode, ReplyHandler, Switch,
    next_id,
};

use super::{DATAGRAM_BUFFER, bind_with_retry};

/// UDP portal. Requests arriving on the socket are relayed to the out-side;
/// in request mode their replies are sent back to the requester.
pub struct UdpListen {
    lifecycle: Lifecycle,
    addr: SocketAddr,
    policy: BackoffPolicy,
    mode: Mode,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl UdpListen {
    /// `udp/listen` connector.
    pub fn new(addr: SocketAddr, policy: BackoffPolicy) -> Self {
        Self::with_mode(format!("udp/listen:{addr}"), addr, policy, Mode::Request)
    }

    /// `udp/event` in-side connector: datagrams are relayed as one-way events.
    pub fn events(addr: SocketAddr, policy: BackoffPolicy) -> Self {
        Self::with_mode(format!("udp/event:{addr}"), addr, policy, Mode::Event)
    }

    fn with_mode(tag: String, addr: SocketAddr, policy: BackoffPolicy, mode: Mode) -> Self {
        let (bound, _) = watch::channel(None);
        Self {
            lifecycle: Lifecycle::new(tag),
            addr,
            policy,
            mode,
            bound,
        }
    }

    /// Address of the bound socket, once the run loop has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.bound.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|addr| *addr)
    }

    async fn serve(&self, socket: Arc<UdpSocket>, switch: &Switch) -> std::io::Result<()> {
        let cancel = self.lifecycle.token();
        let tag = self.lifecycle.tag();
        let mut buffer = vec![0u8; DATAGRAM_BUFFER];

        loop {
            let (n, remote) = tokio::select! {
                res = socket.recv_from(&mut buffer) => res?,
                () = cancel.cancelled() => return Ok(()),
            };

            let id = next_id();
            let payload = buffer[..n].to_vec();
            debug!(connector = %tag, id, bytes = n, peer = %remote, "Request\n{}", hex_dump(&payload));

            let reply = match self.mode {
                Mode::Request => Some(reply_to(Arc::clone(&socket), remote, tag.to_string(), id)),
                Mode::Event => None,
            };
            switch.received(id, payload, reply).await;
        }
    }
}

fn reply_to(socket: Arc<UdpSocket>, remote: SocketAddr, tag: String, id: u32) -> ReplyHandler {
    ReplyHandler::new(move |reply: Vec<u8>| async move {
        debug!(connector = %tag, id, bytes = reply.len(), peer = %remote, "Reply\n{}", hex_dump(&reply));
        if let Err(e) = socket.send_to(&reply, remote).await {
            warn!(connector = %tag, id, peer = %remote, error = %e, "Failed to send reply");
        }
    })
}

#[async_trait]
impl Connector for UdpListen {
    fn tag(&self) -> &str {
        self.lifecycle.tag()
    }

    async fn run(&self, switch: Switch) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.guard();
        let cancel = self.lifecycle.token();
        let mut backoff = Backoff::new(self.policy);

        loop {
            let Some(socket) = bind_with_retry(self.tag(), self.addr, &mut backoff, cancel).await? else {
                return Ok(());
            };
            if let Ok(local) = socket.local_addr() {
                self.bound.send_replace(Some(local));
            }

            let result = self.serve(Arc::new(socket), &switch).await;
            self.bound.send_replace(None);

            match result {
                Ok(()) => {
                    info!(connector = %self.tag(), "Stopped listening");
                    return Ok(());
                }
                Err(e) => warn!(connector = %self.tag(), error = %e, "UDP receive failed"),
            }
        }
    }

    fn send(&self, id: u32, _payload: Vec<u8>) {
        debug!(connector = %self.tag(), id, "Ignoring message for UDP portal");
    }

    async fn close(&self) {
        self.lifecycle.close().await;
    }
}
