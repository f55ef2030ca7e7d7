//! Framed TCP carrier between brokers.
//!
//! Moves encoded envelopes over TCP streams.  Every frame is
//!
//! ```text
//! [4 bytes: envelope length (u32-le)] [N bytes: encoded envelope]
//! ```
//!
//! Frames longer than `max_message_size` end the connection, since the
//! stream cannot be resynchronised.  A frame that fails to decode is
//! skipped and the connection stays up.

use {
    crate::{
        config::OverlayConfig,
        error::{OverlayError, Result},
        message::Envelope,
    },
    log::{debug, error, info, warn},
    std::{io::ErrorKind, net::SocketAddr},
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
    },
};

/// An envelope read off the wire, with the peer that sent it.
#[derive(Debug)]
pub struct InboundEnvelope {
    pub envelope: Envelope,
    pub from: SocketAddr,
}

/// Returned by [`TcpCarrier::start`].
pub struct CarrierHandle {
    /// Every envelope decoded on any accepted connection.
    pub inbound_rx: mpsc::Receiver<InboundEnvelope>,
    /// Bound address; differs from the configured one when port 0 was asked for.
    pub local_addr: SocketAddr,
}

/// What reading one frame produced.
#[derive(Debug)]
pub enum Frame {
    Envelope(Envelope),
    /// Frame was read whole but did not decode.
    Malformed(OverlayError),
    /// Peer closed the stream between frames.
    Closed,
}

/// Read one length-prefixed frame from `reader`.
///
/// I/O errors and oversized frames are returned as errors; the caller
/// should drop the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
    max_route_depth: usize,
) -> Result<Frame> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Frame::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = Envelope::read_frame_len(&header);
    if len > max_message_size {
        return Err(OverlayError::MessageTooLarge {
            size: len,
            max: max_message_size,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(match Envelope::decode_with_limit(&body, max_route_depth) {
        Ok(envelope) => Frame::Envelope(envelope),
        Err(e) => Frame::Malformed(e),
    })
}

/// Accepts broker connections and decodes their frames.
pub struct TcpCarrier {
    config: OverlayConfig,
}

impl TcpCarrier {
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }

    /// Bind `bind_addr` and start accepting.
    ///
    /// One task is spawned per connection; all of them feed the same
    /// channel.
    pub async fn start(self) -> Result<CarrierHandle> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("rank {} carrier listening on {}", self.config.rank, local_addr);

        let (tx, rx) = mpsc::channel(self.config.channel_buffer_size);
        let max_message_size = self.config.max_message_size;
        let max_route_depth = self.config.max_route_depth;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted broker connection from {}", addr);
                        tokio::spawn(Self::serve(
                            stream,
                            addr,
                            tx.clone(),
                            max_message_size,
                            max_route_depth,
                        ));
                    }
                    Err(e) => error!("accept error: {}", e),
                }
            }
        });

        Ok(CarrierHandle {
            inbound_rx: rx,
            local_addr,
        })
    }

    async fn serve(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx: mpsc::Sender<InboundEnvelope>,
        max_message_size: usize,
        max_route_depth: usize,
    ) {
        loop {
            let frame = match read_frame(&mut stream, max_message_size, max_route_depth).await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("dropping connection from {}: {}", addr, e);
                    break;
                }
            };
            match frame {
                Frame::Envelope(envelope) => {
                    debug!("received {} from {}", envelope, addr);
                    let inbound = InboundEnvelope {
                        envelope,
                        from: addr,
                    };
                    if tx.send(inbound).await.is_err() {
                        info!("inbound channel closed, stopping reader for {}", addr);
                        break;
                    }
                }
                Frame::Malformed(e) => warn!("discarding malformed frame from {}: {}", addr, e),
                Frame::Closed => break,
            }
        }
        debug!("connection from {} closed", addr);
    }
}

// ── Outbound ────────────────────────────────────────────────────────────────

/// Open a connection to `addr`, send one envelope and close it.
pub async fn send_envelope(
    addr: SocketAddr,
    envelope: &Envelope,
    max_message_size: usize,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    send_on_stream(&mut stream, envelope, max_message_size).await
}

/// Send one envelope on an already connected stream.
pub async fn send_on_stream(
    stream: &mut TcpStream,
    envelope: &Envelope,
    max_message_size: usize,
) -> Result<()> {
    let frame = envelope.encode_framed(max_message_size)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Send `envelope` to every address in `addrs` concurrently.
///
/// Returns the addresses that could not be reached.  If the envelope
/// cannot be framed nothing is sent and the framing error is returned.
pub async fn broadcast_envelope(
    addrs: &[SocketAddr],
    envelope: &Envelope,
    max_message_size: usize,
) -> Result<Vec<(SocketAddr, OverlayError)>> {
    let frame = envelope.encode_framed(max_message_size)?;

    let mut tasks = Vec::with_capacity(addrs.len());
    for &addr in addrs {
        let frame = frame.clone();
        tasks.push(tokio::spawn(async move {
            let result = async {
                let mut stream = TcpStream::connect(addr).await?;
                stream.write_all(&frame).await?;
                stream.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await;
            (addr, result)
        }));
    }

    let mut failures = Vec::new();
    for task in tasks {
        match task.await {
            Ok((_, Ok(()))) => {}
            Ok((addr, Err(e))) => failures.push((addr, OverlayError::Transport(e))),
            Err(e) => warn!("broadcast task failed: {}", e),
        }
    }
    Ok(failures)
}
