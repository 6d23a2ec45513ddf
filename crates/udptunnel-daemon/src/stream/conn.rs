//! One framed stream connection: a packet reader feeding the router and a
//! writer draining the reply and outbound queues.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use udptunnel_core::codec::encode;
use udptunnel_core::message::hex_dump;
use udptunnel_core::{Message, Mode, PacketCodec, ReplyHandler, Switch};

use super::QUEUE_CAPACITY;

/// Per-connection context.
pub(crate) struct Connection<'a> {
    pub tag: &'a str,
    pub peer: SocketAddr,
    pub mode: Mode,
    pub switch: &'a Switch,
}

impl Connection<'_> {
    /// Serve `stream` until the peer disconnects, an I/O or framing error
    /// occurs, or `cancel` fires.
    ///
    /// Messages from `outbound` are written to the peer, as are replies to
    /// requests this connection received.
    pub async fn serve<S>(
        &self,
        stream: S,
        outbound: &mut mpsc::Receiver<Message>,
        cancel: &CancellationToken,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (reply_tx, mut reply_rx) = mpsc::channel(QUEUE_CAPACITY);

        tokio::select! {
            res = self.read_loop(FramedRead::new(reader, PacketCodec), reply_tx) => res,
            res = self.write_loop(&mut writer, &mut reply_rx, outbound) => res,
            () = cancel.cancelled() => Ok(()),
        }
    }

    async fn read_loop<R>(
        &self,
        mut frames: FramedRead<R, PacketCodec>,
        replies: mpsc::Sender<Message>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        while let Some(frame) = frames.next().await {
            let msg = frame?;
            debug!(connector = %self.tag, id = msg.id, bytes = msg.payload.len(), peer = %self.peer, "Received");

            let reply = match self.mode {
                Mode::Request => Some(self.reply_handler(msg.id, replies.clone())),
                Mode::Event => None,
            };
            self.switch.received(msg.id, msg.payload, reply).await;
        }
        Ok(())
    }

    fn reply_handler(&self, id: u32, replies: mpsc::Sender<Message>) -> ReplyHandler {
        let tag = self.tag.to_string();
        let peer = self.peer;
        ReplyHandler::new(move |payload| async move {
            match replies.try_send(Message::new(id, payload)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(connector = %tag, id, peer = %peer, "Reply queue full, dropping reply");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connector = %tag, id, peer = %peer, "Connection gone, dropping reply");
                }
            }
        })
    }

    async fn write_loop<W>(
        &self,
        writer: &mut W,
        replies: &mut mpsc::Receiver<Message>,
        outbound: &mut mpsc::Receiver<Message>,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let msg = tokio::select! {
                Some(msg) = replies.recv() => msg,
                Some(msg) = outbound.recv() => msg,
                else => return Ok(()),
            };

            let packet = match encode(msg.id, &msg.payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(connector = %self.tag, id = msg.id, error = %e, "Dropping message");
                    continue;
                }
            };
            writer.write_all(&packet).await?;
            writer.flush().await?;
            debug!(
                connector = %self.tag,
                id = msg.id,
                bytes = msg.payload.len(),
                peer = %self.peer,
                "Sent\n{}",
                hex_dump(&msg.payload)
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use udptunnel_core::codec::decode;
    use udptunnel_core::{Router, RouterConfig};

    fn router() -> Arc<Router> {
        Router::start(RouterConfig {
            rate_limit: None,
            ..RouterConfig::default()
        })
    }

    async fn read_packet(stream: &mut (impl AsyncRead + Unpin)) -> (u32, Vec<u8>) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            if let Some((id, payload, _)) = decode(&buf) {
                return (id, payload.to_vec());
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn request_is_routed_and_reply_written_back() {
        let router = router();
        let (relay_tx, mut relayed) = mpsc::unbounded_channel();
        let switch = Switch::new(Arc::clone(&router), move |id, payload| {
            let _ = relay_tx.send((id, payload));
        });

        let (local, mut remote) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let (_queue, mut outbound) = mpsc::channel(QUEUE_CAPACITY);
                let conn = Connection {
                    tag: "test",
                    peer: SocketAddr::from(([127, 0, 0, 1], 9)),
                    mode: Mode::Request,
                    switch: &switch,
                };
                conn.serve(local, &mut outbound, &cancel).await
            }
        });

        remote.write_all(&encode(31, b"query").unwrap()).await.unwrap();
        assert_eq!(relayed.recv().await.unwrap(), (31, b"query".to_vec()));

        // The other side answers on the same id.
        Switch::new(Arc::clone(&router), |_, _| {})
            .received(31, b"answer".to_vec(), None)
            .await;
        let (id, payload) = tokio::time::timeout(Duration::from_secs(2), read_packet(&mut remote))
            .await
            .unwrap();
        assert_eq!((id, payload.as_slice()), (31, b"answer".as_slice()));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn outbound_messages_are_framed() {
        let router = router();
        let switch = Switch::new(router, |_, _| {});
        let (local, mut remote) = tokio::io::duplex(1024);
        let (queue, mut outbound) = mpsc::channel(QUEUE_CAPACITY);

        let task = tokio::spawn(async move {
            let conn = Connection {
                tag: "test",
                peer: SocketAddr::from(([127, 0, 0, 1], 9)),
                mode: Mode::Event,
                switch: &switch,
            };
            conn.serve(local, &mut outbound, &CancellationToken::new()).await
        });

        queue.send(Message::new(7, b"event".to_vec())).await.unwrap();
        assert_eq!(read_packet(&mut remote).await, (7, b"event".to_vec()));

        drop(remote);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn corrupt_stream_ends_the_connection() {
        let switch = Switch::new(router(), |_, _| {});
        let (local, mut remote) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move {
            let (_queue, mut outbound) = mpsc::channel(QUEUE_CAPACITY);
            let conn = Connection {
                tag: "test",
                peer: SocketAddr::from(([127, 0, 0, 1], 9)),
                mode: Mode::Request,
                switch: &switch,
            };
            conn.serve(local, &mut outbound, &CancellationToken::new()).await
        });

        // A truncated packet followed by EOF.
        remote.write_all(&[0x00, 0x10, 0x00]).await.unwrap();
        drop(remote);
        assert!(task.await.unwrap().is_err());
    }
}
