use super::{
    connection::{TransportReceiver, TransportSender},
    sip_addr::SipAddr,
    SipConnection, TransportEvent,
};
use crate::Result;
use rsip::SipMessage;
use std::{fmt, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

struct ChannelInner {
    addr: SipAddr,
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
}

/// In-memory transport backed by a pair of channels. Outbound messages are
/// pushed onto `outgoing`, inbound ones are drained from `incoming` by the
/// serve loop; tests wire two of these back to back to drive an endpoint
/// without sockets.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr,
                incoming: Mutex::new(Some(incoming)),
                outgoing,
            }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        debug!("channel send: {}", msg);
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(
                msg,
                SipConnection::Channel(self.clone()),
                self.inner.addr.clone(),
            ))
            .map_err(Into::into)
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut incoming = match self.inner.incoming.lock().await.take() {
            Some(incoming) => incoming,
            None => {
                return Err(crate::Error::TransportLayerError(
                    "serve_loop called twice".to_string(),
                    self.inner.addr.clone(),
                ))
            }
        };
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        sender.send(TransportEvent::Closed(SipConnection::Channel(self.clone())))?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.incoming.lock().await.take();
        Ok(())
    }
}

impl fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
