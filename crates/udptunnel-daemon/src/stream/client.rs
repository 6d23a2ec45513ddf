use std::io;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use udptunnel_core::{
    Backoff, BackoffPolicy, Connector, ConnectorError, Lifecycle, Message, Mode, Switch,
    WaitOutcome,
};

use super::conn::Connection;
use super::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, QUEUE_CAPACITY};

/// Transport security for a client connection.
#[derive(Clone)]
pub enum ClientSecurity {
    Plain,
    Tls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

/// TCP/TLS client. Keeps one connection to the server open, reconnecting
/// with backoff, and multiplexes every in-flight request over it.
pub struct StreamClient {
    lifecycle: Lifecycle,
    addr: String,
    security: ClientSecurity,
    policy: BackoffPolicy,
    mode: Mode,
    queue: mpsc::Sender<Message>,
    outbound: Mutex<mpsc::Receiver<Message>>,
}

impl StreamClient {
    pub fn new(addr: impl Into<String>, security: ClientSecurity, policy: BackoffPolicy, mode: Mode) -> Self {
        let addr = addr.into();
        let scheme = match security {
            ClientSecurity::Plain => "tcp",
            ClientSecurity::Tls { .. } => "tls",
        };
        let (queue, outbound) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            lifecycle: Lifecycle::new(format!("{scheme}/client:{addr}")),
            addr,
            security,
            policy,
            mode,
            queue,
            outbound: Mutex::new(outbound),
        }
    }

    async fn connect_and_serve(
        &self,
        switch: &Switch,
        outbound: &mut mpsc::Receiver<Message>,
        backoff: &mut Backoff,
    ) -> io::Result<()> {
        let tag = self.tag();
        info!(connector = %tag, addr = %self.addr, "Connecting");

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        let peer = tcp.peer_addr()?;
        let conn = Connection {
            tag,
            peer,
            mode: self.mode,
            switch,
        };
        let cancel = self.lifecycle.token();

        match &self.security {
            ClientSecurity::Plain => {
                backoff.reset();
                info!(connector = %tag, peer = %peer, "Connected");
                conn.serve(tcp, outbound, cancel).await
            }
            ClientSecurity::Tls {
                connector,
                server_name,
            } => {
                let tls = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name.clone(), tcp))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
                backoff.reset();
                info!(connector = %tag, peer = %peer, "Connected");
                conn.serve(tls, outbound, cancel).await
            }
        }
    }
}

#[async_trait]
impl Connector for StreamClient {
    fn tag(&self) -> &str {
        self.lifecycle.tag()
    }

    async fn run(&self, switch: Switch) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.guard();
        let cancel = self.lifecycle.token();
        let mut backoff = Backoff::new(self.policy);
        let mut outbound = self.outbound.lock().await;

        loop {
            let result = tokio::select! {
                res = self.connect_and_serve(&switch, &mut outbound, &mut backoff) => res,
                () = cancel.cancelled() => Ok(()),
            };
            if cancel.is_cancelled() {
                info!(connector = %self.tag(), "Client shutting down");
                return Ok(());
            }
            match result {
                Ok(()) => info!(connector = %self.tag(), "Disconnected"),
                Err(e) => warn!(connector = %self.tag(), error = %e, "Connection failed"),
            }

            match backoff.wait(self.tag(), cancel).await {
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

    fn send(&self, id: u32, payload: Vec<u8>) {
        match self.queue.try_send(Message::new(id, payload)) {
            Ok(()) => debug!(connector = %self.tag(), id, "Queued"),
            Err(_) => warn!(connector = %self.tag(), id, "Outbound queue full, dropping message"),
        }
    }

    async fn close(&self) {
        self.lifecycle.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stream::fast_policy;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use udptunnel_core::codec::{decode, encode};
    use udptunnel_core::{Router, RouterConfig};

    fn router() -> Arc<Router> {
        Router::start(RouterConfig {
            rate_limit: None,
            ..RouterConfig::default()
        })
    }

    #[tokio::test]
    async fn queued_messages_are_sent_once_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Arc::new(StreamClient::new(
            addr.to_string(),
            ClientSecurity::Plain,
            fast_policy(None),
            Mode::Request,
        ));
        assert_eq!(client.tag(), format!("tcp/client:{addr}"));
        client.send(11, b"early".to_vec());

        let run = tokio::spawn({
            let client = Arc::clone(&client);
            let switch = Switch::new(router(), |_, _| {});
            async move { client.run(switch).await }
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        let (id, payload, _) = decode(&buf[..n]).unwrap();
        assert_eq!((id, payload), (11, b"early".as_slice()));

        client.close().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_server_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = router();
        let (tx, mut relayed) = mpsc::unbounded_channel();
        let switch = Switch::new(Arc::clone(&router), move |id, payload| {
            let _ = tx.send((id, payload));
        });

        let client = Arc::new(StreamClient::new(
            addr.to_string(),
            ClientSecurity::Plain,
            fast_policy(None),
            Mode::Request,
        ));
        let run = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run(switch).await }
        });

        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(&encode(5, b"after").unwrap()).await.unwrap();
        assert_eq!(relayed.recv().await.unwrap(), (5, b"after".to_vec()));

        client.close().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = StreamClient::new(addr.to_string(), ClientSecurity::Plain, fast_policy(Some(2)), Mode::Request);
        let err = client.run(Switch::new(router(), |_, _| {})).await.unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn full_queue_drops() {
        let client = StreamClient::new("127.0.0.1:1", ClientSecurity::Plain, fast_policy(None), Mode::Request);
        for id in 0..u32::try_from(QUEUE_CAPACITY).unwrap() + 4 {
            client.send(id, vec![1]);
        }
        assert_eq!(client.queue.capacity(), 0);
    }
}
