use super::{
    connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
    sip_addr::SipAddr,
    SipConnection, TransportEvent,
};
use crate::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

struct UdpInner {
    conn: UdpSocket,
    addr: SipAddr,
}

/// Unreliable datagram transport. One socket serves every peer, so the
/// transaction layer is responsible for retransmission on top of it.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<Self> {
        let conn = UdpSocket::bind(local).await?;
        let local = conn.local_addr()?;

        let addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Udp),
            addr: external.unwrap_or(local).into(),
        };

        let t = UdpConnection {
            inner: Arc::new(UdpInner { addr, conn }),
        };
        info!("created UDP connection: {} external: {:?}", t, external);
        Ok(t)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn send(&self, msg: rsip::SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let target = match destination {
            Some(addr) => addr.get_socketaddr()?,
            None => SipConnection::get_destination(&msg)?.get_socketaddr()?,
        };
        let buf = msg.to_string();
        debug!("sending {} bytes -> {}", buf.len(), target);

        self.inner
            .conn
            .send_to(buf.as_bytes(), target)
            .await
            .map_err(|e| {
                crate::Error::TransportLayerError(e.to_string(), self.get_addr().to_owned())
            })
            .map(|_| ())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, addr) = match self.inner.conn.recv_from(&mut buf).await {
                Ok((len, addr)) => (len, addr),
                Err(e) => {
                    error!("error receiving UDP packet: {}", e);
                    continue;
                }
            };

            match &buf[..len] {
                KEEPALIVE_REQUEST => {
                    self.inner.conn.send_to(KEEPALIVE_RESPONSE, addr).await.ok();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                _ => {
                    if buf[..len].iter().all(|&b| b.is_ascii_whitespace()) {
                        continue;
                    }
                }
            }

            let undecoded = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(e) => {
                    info!("non-utf8 datagram from {}: {}", addr, e);
                    continue;
                }
            };

            let msg = match rsip::SipMessage::try_from(undecoded) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("error parsing SIP message from {}: {}", addr, e);
                    continue;
                }
            };

            let msg = match SipConnection::update_msg_received(msg, addr) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("error updating received params from {}: {}", addr, e);
                    continue;
                }
            };

            let source = SipAddr {
                r#type: Some(rsip::transport::Transport::Udp),
                addr: addr.into(),
            };
            sender.send(TransportEvent::Incoming(
                msg,
                SipConnection::Udp(self.clone()),
                source,
            ))?;
        }
    }
}

impl std::fmt::Display for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.conn.local_addr() {
            Ok(addr) => write!(f, "{}", addr),
            Err(_) => write!(f, "*:*"),
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}
