use crate::{
    transport::{
        connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent,
    },
    Result,
};
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Upper bound for a single write so a large payload cannot monopolize the
/// write half against a slow peer.
pub(super) const WRITE_CHUNK_SIZE: usize = 4096;

/// Frames SIP messages on a byte stream: CRLF keepalives, then
/// Content-Length delimited messages.
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum SipFrame {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl Decoder for SipCodec {
    type Item = SipFrame;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Ok(Some(SipFrame::KeepaliveRequest));
        }

        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Ok(Some(SipFrame::KeepaliveResponse));
        }

        if let Some(headers_end) = src.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = &src[..headers_end + 4];
            let headers_str = std::str::from_utf8(headers)
                .map_err(|e| crate::Error::SipMessageError(format!("invalid utf-8: {}", e)))?;
            let mut content_length = 0;
            for line in headers_str.lines() {
                let Some((name, value)) = line.split_once(':') else {
                    continue;
                };
                if name.trim().eq_ignore_ascii_case("content-length")
                    || name.trim().eq_ignore_ascii_case("l")
                {
                    content_length = value.trim().parse::<usize>().map_err(|e| {
                        crate::Error::SipMessageError(format!("invalid content-length: {}", e))
                    })?;
                    break;
                }
            }

            let total_len = headers_end + 4 + content_length;
            if src.len() >= total_len {
                let msg_data = src.split_to(total_len);
                let msg = SipMessage::try_from(&msg_data[..])?;
                return Ok(Some(SipFrame::Message(msg)));
            }
        }

        if src.len() > MAX_SIP_MESSAGE_SIZE {
            return Err(crate::Error::SipMessageError(
                "message too large".to_string(),
            ));
        }
        Ok(None)
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.to_string().as_bytes());
        Ok(())
    }
}

/// Shared plumbing for stream-oriented connections (TCP, TLS).
///
/// The read half is taken exactly once by `serve_loop`; the write half is
/// guarded by a mutex so concurrent senders serialize per connection.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.send_raw(msg.to_string().as_bytes()).await
    }

    /// Write `data` in bounded chunks, holding the write lock across the
    /// whole message so frames from concurrent senders never interleave.
    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        for chunk in data.chunks(WRITE_CHUNK_SIZE) {
            lock.write_all(chunk).await?;
        }
        lock.flush().await?;
        Ok(())
    }

    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!("serve_loop called twice: {}", self.remote_addr);
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr.clone();
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = vec![0u8; 4096];

        loop {
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    info!("connection closed by peer: {}", remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[0..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(SipFrame::Message(msg))) => {
                                debug!("received from {}: {}", remote_addr, msg);
                                let remote_socket_addr = remote_addr.get_socketaddr()?;
                                let msg =
                                    SipConnection::update_msg_received(msg, remote_socket_addr)?;
                                sender.send(TransportEvent::Incoming(
                                    msg,
                                    connection.clone(),
                                    remote_addr.clone(),
                                ))?;
                            }
                            Ok(Some(SipFrame::KeepaliveRequest)) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await?;
                            }
                            Ok(Some(SipFrame::KeepaliveResponse)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                // drop the garbage rather than loop on it
                                warn!("decode error from {}: {}", remote_addr, e);
                                buffer.clear();
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("read error from {}: {}", remote_addr, e);
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await.map_err(|e| {
            crate::Error::TransportLayerError(
                format!("failed to shutdown write half: {}", e),
                self.remote_addr.clone(),
            )
        })?;
        Ok(())
    }
}

/// Seam implemented by every stream transport.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn get_addr(&self) -> &SipAddr;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
