use super::{
    channel::ChannelConnection, stream::StreamConnection, tcp::TcpConnection,
    tcp_listener::TcpListenerConnection, tls::TlsConnection, udp::UdpConnection, SipAddr,
};
use crate::Result;
use rsip::{
    param::{OtherParam, OtherParamValue, Received},
    prelude::{HeadersExt, ToTypedHeader},
    HostWithPort, Param, SipMessage,
};
use std::{fmt, net::SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Events flowing from connections up to the endpoint serve loop.
#[derive(Clone)]
pub enum TransportEvent {
    /// A parsed message arrived on `connection` from the given source.
    Incoming(SipMessage, SipConnection, SipAddr),
    /// A new connection exists (e.g. accepted by a listener).
    New(SipConnection),
    /// A connection's serve loop ended; the owner should drop cache entries.
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// One concrete connection of any supported transport kind.
#[derive(Clone, Debug)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    TcpListener(TcpListenerConnection),
    Tls(TlsConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, SipConnection::Udp(_))
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(c) => c.get_addr(),
            SipConnection::Tcp(c) => c.get_addr(),
            SipConnection::TcpListener(c) => c.get_addr(),
            SipConnection::Tls(c) => c.get_addr(),
            SipConnection::Channel(c) => c.get_addr(),
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.send(msg, destination).await,
            SipConnection::Tcp(c) => c.send_message(msg).await,
            SipConnection::TcpListener(c) => Err(crate::Error::TransportLayerError(
                "cannot send on a listener".to_string(),
                c.get_addr().clone(),
            )),
            SipConnection::Tls(c) => c.send_message(msg).await,
            SipConnection::Channel(c) => c.send(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.serve_loop(sender).await,
            SipConnection::Tcp(c) => c.serve_loop(sender).await,
            SipConnection::TcpListener(c) => c.serve_loop(sender).await,
            SipConnection::Tls(c) => c.serve_loop(sender).await,
            SipConnection::Channel(c) => c.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Udp(_) => Ok(()),
            SipConnection::Tcp(c) => c.close().await,
            SipConnection::TcpListener(c) => c.close().await,
            SipConnection::Tls(c) => c.close().await,
            SipConnection::Channel(c) => c.close().await,
        }
    }
}

impl SipConnection {
    /// Stamp `received`/`rport` on the topmost Via of an inbound request so
    /// responses travel back over the path the request actually took.
    pub fn update_msg_received(msg: SipMessage, addr: SocketAddr) -> Result<SipMessage> {
        match msg {
            SipMessage::Request(mut req) => {
                let via = req.via_header_mut()?;
                Self::build_via_received(via, addr)?;
                Ok(req.into())
            }
            SipMessage::Response(_) => Ok(msg),
        }
    }

    pub fn build_via_received(via: &mut rsip::headers::Via, addr: SocketAddr) -> Result<()> {
        let received: HostWithPort = addr.into();
        let mut typed_via = via.typed()?;
        if typed_via.uri.host_with_port == received {
            return Ok(());
        }
        typed_via.params.retain(|param| {
            if let Param::Other(key, _) = param {
                !key.value().eq_ignore_ascii_case("rport")
            } else {
                true
            }
        });
        *via = typed_via
            .with_param(Param::Received(Received::new(received.host.to_string())))
            .with_param(Param::Other(
                OtherParam::new("rport"),
                Some(OtherParamValue::new(addr.port().to_string())),
            ))
            .into();
        Ok(())
    }

    /// Response routing target: the sent-by of the topmost Via, corrected by
    /// `received`/`rport` when present.
    pub fn parse_target_from_via(via: &rsip::headers::untyped::Via) -> Result<HostWithPort> {
        let mut host_with_port = via.uri()?.host_with_port;
        if let Ok(params) = via.params().as_ref() {
            for param in params {
                match param {
                    Param::Received(v) => {
                        if let Ok(addr) = v.parse() {
                            host_with_port.host = addr.into();
                        }
                    }
                    Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                        if let Ok(port) = value.value().try_into() {
                            host_with_port.port = Some(port);
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(host_with_port)
    }

    /// Where a message should be sent when the caller gave no explicit
    /// destination: requests go to the request URI, responses back via Via.
    pub fn get_destination(msg: &SipMessage) -> Result<SipAddr> {
        match msg {
            SipMessage::Request(req) => {
                let addr = SipAddr::try_from(req.uri())?;
                Ok(addr)
            }
            SipMessage::Response(res) => {
                let via = res.via_header()?;
                let host_with_port = Self::parse_target_from_via(via)?;
                let transport = via.typed()?.transport;
                Ok(SipAddr {
                    r#type: Some(transport),
                    addr: host_with_port,
                })
            }
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Udp(t) => write!(f, "UDP {}", t),
            SipConnection::Tcp(t) => write!(f, "TCP {}", t),
            SipConnection::TcpListener(t) => write!(f, "TCP-LISTEN {}", t),
            SipConnection::Tls(t) => write!(f, "TLS {}", t),
            SipConnection::Channel(t) => write!(f, "CHANNEL {}", t),
        }
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(connection: UdpConnection) -> Self {
        SipConnection::Udp(connection)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<TcpListenerConnection> for SipConnection {
    fn from(connection: TcpListenerConnection) -> Self {
        SipConnection::TcpListener(connection)
    }
}

impl From<TlsConnection> for SipConnection {
    fn from(connection: TlsConnection) -> Self {
        SipConnection::Tls(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}
