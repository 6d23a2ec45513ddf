use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use udptunnel_core::message::hex_dump;
use udptunnel_core::{Connector, ConnectorError, Lifecycle, Message, Mode, Switch};

use super::{DATAGRAM_BUFFER, unspecified_for};

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const REPLY_QUEUE: usize = 64;

/// UDP out-side. Each relayed message goes out as one datagram from a fresh
/// ephemeral socket.
pub struct UdpBroadcast {
    lifecycle: Lifecycle,
    addr: SocketAddr,
    timeout: Duration,
    mode: Mode,
    replies: mpsc::Sender<Message>,
    inbox: Mutex<mpsc::Receiver<Message>>,
}

impl UdpBroadcast {
    /// `udp/broadcast` connector. Replies received within `timeout` are routed
    /// back under the request's ID.
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self::with_mode(format!("udp/broadcast:{addr}"), addr, timeout, Mode::Request)
    }

    /// `udp/event` out-side connector: send only, no replies expected.
    pub fn events(addr: SocketAddr) -> Self {
        Self::with_mode(format!("udp/event:{addr}"), addr, Duration::ZERO, Mode::Event)
    }

    fn with_mode(tag: String, addr: SocketAddr, timeout: Duration, mode: Mode) -> Self {
        let (replies, inbox) = mpsc::channel(REPLY_QUEUE);
        Self {
            lifecycle: Lifecycle::new(tag),
            addr,
            timeout,
            mode,
            replies,
            inbox: Mutex::new(inbox),
        }
    }
}

struct Broadcast {
    tag: String,
    addr: SocketAddr,
    timeout: Duration,
    mode: Mode,
    replies: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl Broadcast {
    async fn run(self, id: u32, payload: Vec<u8>) {
        if let Err(e) = self.exchange(id, &payload).await {
            warn!(connector = %self.tag, id, error = %e, "Broadcast failed");
        }
    }

    async fn exchange(&self, id: u32, payload: &[u8]) -> std::io::Result<()> {
        let socket = UdpSocket::bind(unspecified_for(self.addr)).await?;
        socket.set_broadcast(true)?;

        debug!(connector = %self.tag, id, bytes = payload.len(), "Broadcast\n{}", hex_dump(payload));
        let sent = timeout(WRITE_TIMEOUT, socket.send_to(payload, self.addr))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        debug!(connector = %self.tag, id, bytes = sent, addr = %self.addr, "Sent");

        if self.mode == Mode::Event {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        let mut buffer = vec![0u8; DATAGRAM_BUFFER];
        loop {
            let received = tokio::select! {
                res = timeout_at(deadline, socket.recv_from(&mut buffer)) => res,
                () = self.cancel.cancelled() => return Ok(()),
            };
            let Ok(received) = received else {
                return Ok(());
            };
            let (n, remote) = received?;

            let reply = buffer[..n].to_vec();
            debug!(connector = %self.tag, id, bytes = n, peer = %remote, "Received\n{}", hex_dump(&reply));
            if self.replies.send(Message::new(id, reply)).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Connector for UdpBroadcast {
    fn tag(&self) -> &str {
        self.lifecycle.tag()
    }

    async fn run(&self, switch: Switch) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.guard();
        let cancel = self.lifecycle.token();
        let mut inbox = self.inbox.lock().await;

        loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        switch.received(msg.id, msg.payload, None).await;
                    }
                    None => return Ok(()),
                },
                () = cancel.cancelled() => return Ok(()),
            }
        }
    }

    fn send(&self, id: u32, payload: Vec<u8>) {
        if self.lifecycle.is_cancelled() {
            return;
        }
        let broadcast = Broadcast {
            tag: self.tag().to_string(),
            addr: self.addr,
            timeout: self.timeout,
            mode: self.mode,
            replies: self.replies.clone(),
            cancel: self.lifecycle.token().clone(),
        };
        tokio::spawn(broadcast.run(id, payload));
    }

    async fn close(&self) {
        self.lifecycle.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use udptunnel_core::{Router, RouterConfig};

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    /// A UDP peer that answers every datagram twice.
    async fn double_echo() -> SocketAddr {
        let socket = UdpSocket::bind(loopback()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let mut reply = b"re:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                let _ = socket.send_to(&reply, from).await;
                let _ = socket.send_to(&reply, from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn replies_are_routed_under_the_request_id() {
        let peer = double_echo().await;
        let router = Router::start(RouterConfig {
            rate_limit: None,
            ..RouterConfig::default()
        });
        let (tx, mut relayed) = mpsc::unbounded_channel();
        let switch = Switch::new(router, move |id, payload| {
            let _ = tx.send((id, payload));
        });

        let out = Arc::new(UdpBroadcast::new(peer, Duration::from_millis(500)));
        let run = tokio::spawn({
            let out = Arc::clone(&out);
            async move { out.run(switch).await }
        });

        out.send(4242, b"ping".to_vec());

        for _ in 0..2 {
            let (id, payload) = timeout(Duration::from_secs(2), relayed.recv()).await.unwrap().unwrap();
            assert_eq!(id, 4242);
            assert_eq!(payload, b"re:ping");
        }

        out.close().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn event_mode_only_sends() {
        let receiver = UdpSocket::bind(loopback()).await.unwrap();
        let out = UdpBroadcast::events(receiver.local_addr().unwrap());

        out.send(1, b"event".to_vec());

        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"event");
    }
}
