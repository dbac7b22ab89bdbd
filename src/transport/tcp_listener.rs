use crate::{
    transport::{
        connection::TransportSender, sip_addr::SipAddr, tcp::TcpConnection, TransportEvent,
    },
    Result,
};
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{error, info};

struct ListenerInner {
    listener: Mutex<Option<TcpListener>>,
    addr: SipAddr,
}

/// Accepting side of the TCP transport. Accepted streams are announced as
/// [`TransportEvent::New`]; the endpoint serve loop registers them with the
/// connection manager and spawns their serve loops.
#[derive(Clone)]
pub struct TcpListenerConnection {
    inner: Arc<ListenerInner>,
}

impl TcpListenerConnection {
    pub async fn create_listener(local: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tcp),
            addr: listener.local_addr()?.into(),
        };
        info!("created TCP listener: {}", addr);
        Ok(TcpListenerConnection {
            inner: Arc::new(ListenerInner {
                listener: Mutex::new(Some(listener)),
                addr,
            }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let listener = match self.inner.listener.lock().await.take() {
            Some(listener) => listener,
            None => {
                return Err(crate::Error::TransportLayerError(
                    "listener serve_loop called twice".to_string(),
                    self.inner.addr.clone(),
                ))
            }
        };

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    info!("accepted TCP connection from {}", remote);
                    match TcpConnection::from_stream(stream, self.inner.addr.clone()) {
                        Ok(connection) => {
                            sender.send(TransportEvent::New(connection.into()))?;
                        }
                        Err(e) => {
                            error!("error wrapping accepted stream from {}: {}", remote, e);
                        }
                    }
                }
                Err(e) => {
                    error!("error accepting TCP connection: {}", e);
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.listener.lock().await.take();
        Ok(())
    }
}

impl fmt::Display for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.addr)
    }
}

impl fmt::Debug for TcpListenerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
