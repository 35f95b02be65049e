//! Framed transport over async byte streams

use crate::{Listener, ListenerTable, Transport, TransportConfig, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tether_proto::{Address, Frame, FrameCodec, Message, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands consumed by the writer task
enum Outbound {
    /// Pre-encoded frame bytes
    Frame(Bytes),
    /// Write a disconnect notice, shut the writer down, then acknowledge
    Close(oneshot::Sender<()>),
}

/// Transport framing messages over an `AsyncRead`/`AsyncWrite` pair
///
/// Suited to child-process stdio, pipes and sockets. A reader task decodes
/// incoming frames and hands them to listeners; a writer task drains the
/// outbound queue. EOF, a read error or a disconnect notice from the peer
/// fires the disconnection token.
pub struct IoTransport {
    /// Transport configuration
    config: TransportConfig,
    /// Codec used to encode outbound frames
    codec: FrameCodec,
    /// Listeners installed on this end
    listeners: Arc<ListenerTable>,
    /// Outbound frame queue
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Peer-termination signal
    disconnected: CancellationToken,
}

impl IoTransport {
    /// Start reader and writer tasks over the given halves
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, config: TransportConfig) -> Result<Self, TransportError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let listeners = Arc::new(ListenerTable::new());
        let disconnected = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(
            reader,
            FrameCodec::with_max_frame_size(config.max_frame_size),
            Arc::clone(&listeners),
            disconnected.clone(),
            config.name.clone(),
        ));
        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            disconnected.clone(),
            config.name.clone(),
        ));

        info!("[{}] framed transport started", config.name);

        Ok(Self {
            codec: FrameCodec::with_max_frame_size(config.max_frame_size),
            config,
            listeners,
            outbound: outbound_tx,
            disconnected,
        })
    }

    /// Transport configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for IoTransport {
    fn send(&self, address: &Address, message: Message) -> Result<(), TransportError> {
        if self.disconnected.is_cancelled() {
            return Err(TransportError::Disconnected);
        }

        let frame = Frame::message(address.clone(), &message)?;
        let encoded = self.codec.encode_frame(&frame)?;
        self.outbound
            .send(Outbound::Frame(encoded))
            .map_err(|_| TransportError::Disconnected)
    }

    fn listen(&self, address: &Address) -> Result<Listener, TransportError> {
        self.listeners.install(address)
    }

    fn remove_listener(&self, address: &Address) {
        self.listeners.remove(address);
    }

    fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.disconnected.is_cancelled() {
            return Ok(());
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Close(ack_tx)).is_ok() {
            // writer may already be gone; either way we are done
            let _ = ack_rx.await;
        }
        self.disconnected.cancel();
        info!("[{}] framed transport closed", self.config.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut codec: FrameCodec,
    listeners: Arc<ListenerTable>,
    disconnected: CancellationToken,
    name: String,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = disconnected.cancelled() => {
                debug!("[{}] reader stopping", name);
                break;
            }

            frame_result = codec.read_frame(&mut reader) => {
                match frame_result {
                    Ok(Some(frame)) if frame.is_disconnect() => {
                        info!("[{}] peer sent disconnect notice", name);
                        break;
                    }
                    Ok(Some(frame)) => match frame.decode_message() {
                        Ok(message) => {
                            listeners.deliver(&frame.address, message);
                        }
                        Err(e) => {
                            // framing is intact, only this payload is bad
                            warn!("[{}] dropping undecodable frame for {}: {}", name, frame.address, e);
                        }
                    },
                    Ok(None) => {
                        info!("[{}] peer closed the stream", name);
                        break;
                    }
                    Err(ProtocolError::Io(e)) => {
                        warn!("[{}] read failed: {}", name, e);
                        break;
                    }
                    Err(e) => {
                        error!("[{}] unrecoverable framing error: {}", name, e);
                        break;
                    }
                }
            }
        }
    }

    disconnected.cancel();
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    disconnected: CancellationToken,
    name: String,
) where
    W: AsyncWrite + Unpin,
{
    let codec = FrameCodec::new();

    loop {
        let command = tokio::select! {
            _ = disconnected.cancelled() => break,
            command = outbound.recv() => command,
        };

        match command {
            Some(Outbound::Frame(bytes)) => {
                let written = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!("[{}] write failed: {}", name, e);
                    break;
                }
            }
            Some(Outbound::Close(ack)) => {
                if let Err(e) = codec.write_frame(&mut writer, &Frame::disconnect()).await {
                    debug!("[{}] could not send disconnect notice: {}", name, e);
                }
                if let Err(e) = writer.shutdown().await {
                    debug!("[{}] writer shutdown failed: {}", name, e);
                }
                let _ = ack.send(());
                break;
            }
            None => break,
        }
    }

    debug!("[{}] writer stopped", name);
    disconnected.cancel();
}
