use crate::{
    transport::{
        connection::TransportSender,
        sip_addr::SipAddr,
        stream::{StreamConnection, StreamConnectionInner},
        SipConnection,
    },
    Error, Result,
};
use rsip::SipMessage;
use std::{fmt, net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    },
    TlsConnector,
};
use tracing::info;

/// TLS configuration for outbound secure connections.
///
/// `ca_certs` holds root certificates in DER form; when absent, certificate
/// chain checking is skipped and [`PeerPolicy`] becomes the sole gatekeeper.
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub ca_certs: Option<Vec<CertificateDer<'static>>>,
    pub verifier: Option<Arc<dyn ServerCertVerifier>>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_certs", &self.ca_certs.as_ref().map(|c| c.len()))
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

/// Pluggable peer check run after the handshake completes.
///
/// Rejection aborts the send and evicts the connection from the manager's
/// cache; the caller sees [`Error::PolicyRejection`].
pub trait PeerPolicy: Send + Sync {
    fn check_peer(&self, peer: &SipAddr, certificates: &[CertificateDer<'_>]) -> Result<()>;
}

type TlsClientStream = tokio_rustls::client::TlsStream<TcpStream>;
type TlsInner = StreamConnectionInner<
    tokio::io::ReadHalf<TlsClientStream>,
    tokio::io::WriteHalf<TlsClientStream>,
>;

#[derive(Clone)]
pub struct TlsConnection {
    inner: Arc<TlsInner>,
}

impl TlsConnection {
    /// Connect and run the handshake synchronously, then hand the peer's
    /// certificate chain to `policy` before the connection becomes usable.
    pub async fn connect(
        remote: &SipAddr,
        config: &TlsConfig,
        policy: Option<Arc<dyn PeerPolicy>>,
    ) -> Result<Self> {
        let mut client_config = match &config.ca_certs {
            Some(certs) => {
                let mut root_store = RootCertStore::empty();
                for cert in certs {
                    root_store.add(cert.clone()).map_err(|e| {
                        Error::Error(format!("invalid root certificate: {}", e))
                    })?;
                }
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            }
            None => ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth(),
        };

        match &config.verifier {
            Some(verifier) => {
                client_config
                    .dangerous()
                    .set_certificate_verifier(verifier.clone());
            }
            None if config.ca_certs.is_none() => {
                // chain checking is delegated to the PeerPolicy hook
                client_config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
            }
            None => {}
        }

        let connector = TlsConnector::from(Arc::new(client_config));

        let (socket_addr, domain_string) = match &remote.addr.host {
            rsip::host_with_port::Host::Domain(domain) => {
                let port = remote.addr.port.as_ref().map_or(5061, |p| *p.value());
                let addr: SocketAddr = format!("{}:{}", domain, port).parse()?;
                (addr, domain.to_string())
            }
            rsip::host_with_port::Host::IpAddr(ip) => {
                let port = remote.addr.port.as_ref().map_or(5061, |p| *p.value());
                (SocketAddr::new(*ip, port), ip.to_string())
            }
        };

        let server_name = ServerName::try_from(domain_string.as_str())
            .map_err(|_| Error::Error(format!("invalid server name: {}", domain_string)))?
            .to_owned();

        let stream = TcpStream::connect(socket_addr).await.map_err(|e| {
            Error::TransportFailure(format!("connect: {}", e), remote.clone())
        })?;
        let local_addr = SipAddr {
            r#type: Some(rsip::transport::Transport::Tls),
            addr: stream.local_addr()?.into(),
        };

        let tls_stream = connector.connect(server_name, stream).await.map_err(|e| {
            Error::TransportFailure(format!("tls handshake: {}", e), remote.clone())
        })?;

        if let Some(policy) = policy {
            let certificates = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default();
            policy.check_peer(remote, &certificates)?;
        }

        let (read_half, write_half) = tokio::io::split(tls_stream);
        let connection = TlsConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr,
                remote.clone(),
                read_half,
                write_half,
            )),
        };
        info!(
            "created TLS client connection: {} -> {}",
            connection.inner.local_addr, remote
        );
        Ok(connection)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }
}

#[async_trait::async_trait]
impl StreamConnection for TlsConnection {
    fn get_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let sip_connection = SipConnection::Tls(self.clone());
        self.inner.serve_loop(sender, sip_connection).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.inner.local_addr, self.inner.remote_addr)
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Verifier that defers all trust decisions to the post-handshake
/// [`PeerPolicy`] hook.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
