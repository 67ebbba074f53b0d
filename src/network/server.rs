//! TCP transport and per-peer connection tasks
//!
//! Each connection gets one reader task and one writer task. The writer
//! drains the peer's bounded outbound queue; the reader parses frames and
//! forwards `(addr, message)` events into the node's central channel. A
//! framing error (bad magic, oversized frame, checksum or codec failure)
//! tears the connection down.

use crate::network::message::Message;
use crate::network::peer::{
    Misbehavior, PeerError, PeerHandle, PeerManager, PeerState, OUTBOUND_QUEUE_SIZE,
};
use crate::network::wire::FrameCodec;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Events flowing from peer readers into the node
#[derive(Debug)]
pub enum PeerEvent {
    /// A decoded message from a peer
    Message(SocketAddr, Message),
    /// The peer's connection ended (cleanly or not)
    Disconnected(SocketAddr),
}

/// Listening socket wrapper
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        let port = listener.local_addr()?.port();
        log::info!("Listening on 0.0.0.0:{}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Dial a peer address
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;
    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;
    Ok((stream, peer_addr))
}

/// Run one peer connection to completion.
///
/// Registers the peer, sends our VERSION, then pumps frames until the
/// socket closes or errors. Always emits `Disconnected` and deregisters
/// the peer on the way out.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    magic: [u8; 4],
    peer_manager: Arc<PeerManager>,
    our_version: Message,
    event_tx: mpsc::Sender<PeerEvent>,
    outbound: bool,
) -> Result<(), PeerError> {
    let framed = Framed::new(stream, FrameCodec::new(magic));
    let (mut writer, mut reader) = framed.split();

    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
    let handle = PeerHandle { addr, tx };

    peer_manager.add_peer(addr, handle, outbound).await?;

    // Local VERSION goes out immediately; the peer is handshaking until
    // VERSION and VERACK have come back
    if let Err(e) = writer.send(our_version).await {
        peer_manager.remove_peer(&addr).await;
        return Err(PeerError::Io(e));
    }
    peer_manager.set_state(&addr, PeerState::Handshaking).await;

    // Writer task: drain the bounded outbound queue
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if writer.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Reader loop: forward decoded messages to the node
    loop {
        match reader.next().await {
            Some(Ok(msg)) => {
                peer_manager.record_recv(&addr).await;
                if event_tx.send(PeerEvent::Message(addr, msg)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                // Framing violations score against the peer, then disconnect
                log::warn!("Protocol error from {}: {}", addr, e);
                let misbehavior = if e.to_string().contains("oversized") {
                    Misbehavior::OversizedMessage
                } else {
                    Misbehavior::ProtocolViolation
                };
                peer_manager.penalize(&addr, misbehavior).await;
                break;
            }
            None => {
                log::debug!("Peer {} closed the connection", addr);
                break;
            }
        }
    }

    write_task.abort();
    peer_manager.remove_peer(&addr).await;
    let _ = event_tx.send(PeerEvent::Disconnected(addr)).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChainParams;
    use crate::network::message::VersionMessage;

    #[tokio::test]
    async fn test_connection_exchanges_version() {
        let params = ChainParams::regtest();
        let server = Server::bind(0).await.unwrap();
        let port = server.port();

        let manager_in = Arc::new(PeerManager::new());
        let manager_out = Arc::new(PeerManager::new());
        let (event_tx_in, mut event_rx_in) = mpsc::channel(16);
        let (event_tx_out, mut event_rx_out) = mpsc::channel(16);

        // Accept one inbound connection
        let magic = params.magic;
        let m_in = manager_in.clone();
        let accept_task = tokio::spawn(async move {
            let (stream, addr) = server.accept().await.unwrap();
            handle_connection(
                stream,
                addr,
                magic,
                m_in,
                Message::Version(VersionMessage::new(1, 0)),
                event_tx_in,
                false,
            )
            .await
        });

        // Dial it
        let (stream, addr) = connect_to_peer(&format!("127.0.0.1:{}", port)).await.unwrap();
        let m_out = manager_out.clone();
        tokio::spawn(async move {
            let _ = handle_connection(
                stream,
                addr,
                magic,
                m_out,
                Message::Version(VersionMessage::new(2, 5)),
                event_tx_out,
                true,
            )
            .await;
        });

        // Each side receives the other's VERSION
        let event = event_rx_in.recv().await.unwrap();
        match event {
            PeerEvent::Message(_, Message::Version(v)) => assert_eq!(v.start_height, 5),
            other => panic!("unexpected event: {:?}", other),
        }
        let event = event_rx_out.recv().await.unwrap();
        match event {
            PeerEvent::Message(_, Message::Version(v)) => assert_eq!(v.start_height, 0),
            other => panic!("unexpected event: {:?}", other),
        }

        accept_task.abort();
    }
}
