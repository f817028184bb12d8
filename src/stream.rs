use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

use crate::conn::PeerInfo;
use crate::error::BoxError;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub type AsyncReadWriteBox = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Where and how to dial. Everything the socket layer needs lives here so
/// the client above it never touches addresses or TLS settings directly.
#[derive(Clone, Debug, bon::Builder)]
#[builder(start_fn = with_host)]
pub struct Target {
    #[builder(start_fn, into)]
    pub host: String,
    #[builder(start_fn)]
    pub port: u16,
    #[builder(default)]
    pub ssl: bool,
    /// TLS server name indication override; defaults to `host`.
    #[builder(into)]
    pub sni: Option<String>,
    /// Verify the server chain against the webpki roots. Off by default:
    /// protocol-testing targets are routinely self-signed.
    #[builder(default)]
    pub verify_tls: bool,
    /// NSS key log output for traffic decryption in a capture tool.
    pub keylog: Option<PathBuf>,
    /// Local address to bind before connecting.
    pub local: Option<SocketAddr>,
    pub connect_timeout: Option<Duration>,
}

impl Target {
    pub fn scheme(&self) -> &'static str {
        if self.ssl {
            "https"
        } else {
            "http"
        }
    }

    pub fn is_default_port(&self) -> bool {
        self.port == if self.ssl { 443 } else { 80 }
    }
}

/// An established stream plus the facts the layers above need: who we
/// actually reached and, for TLS, the leaf certificate for channel
/// binding.
pub struct Dialed {
    pub stream: AsyncReadWriteBox,
    pub peer: PeerInfo,
    pub peer_cert: Option<Vec<u8>>,
}

/// Accepts whatever certificate the server presents. Signature checks
/// still run against the provider's schemes so the handshake itself stays
/// honest.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl AcceptAnyCert {
    fn new() -> Self {
        AcceptAnyCert(rustls::crypto::aws_lc_rs::default_provider().into())
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Appends TLS secrets in the NSS key log format so captures of the
/// session can be decrypted.
#[derive(Debug)]
struct FileKeyLog {
    file: Mutex<std::fs::File>,
}

impl FileKeyLog {
    fn open(path: &PathBuf) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileKeyLog {
            file: Mutex::new(file),
        })
    }
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let hex = |bytes: &[u8]| {
            bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>()
        };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{} {} {}", label, hex(client_random), hex(secret));
        }
    }
}

fn tls_config(target: &Target) -> Result<rustls::ClientConfig, BoxError> {
    let mut config = if target.verify_tls {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth()
    };
    if let Some(path) = &target.keylog {
        config.key_log = Arc::new(FileKeyLog::open(path)?);
    }
    Ok(config)
}

async fn dial_tcp(target: &Target) -> Result<(TcpStream, PeerInfo), BoxError> {
    let addr = lookup_host((target.host.as_str(), target.port))
        .await?
        .next()
        .ok_or_else(|| format!("no address for {}", target.host))?;

    let stream = match target.local {
        Some(local) => {
            let socket = if local.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(local)?;
            socket.connect(addr).await?
        }
        None => TcpStream::connect(addr).await?,
    };
    let peer_addr = stream.peer_addr()?;
    Ok((
        stream,
        PeerInfo {
            addr: peer_addr.ip(),
            port: peer_addr.port(),
        },
    ))
}

/// Dials the target: TCP, then TLS on top when asked. The connect timeout
/// covers the whole dial including the TLS handshake.
pub async fn dial(target: &Target) -> Result<Dialed, BoxError> {
    match target.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, dial_inner(target))
            .await
            .map_err(|_| format!("connect to {}:{} timed out", target.host, target.port))?,
        None => dial_inner(target).await,
    }
}

async fn dial_inner(target: &Target) -> Result<Dialed, BoxError> {
    let (tcp, peer) = dial_tcp(target).await?;
    if !target.ssl {
        return Ok(Dialed {
            stream: Box::new(tcp),
            peer,
            peer_cert: None,
        });
    }

    let connector = TlsConnector::from(Arc::new(tls_config(target)?));
    let name = target
        .sni
        .clone()
        .unwrap_or_else(|| target.host.clone());
    let server_name = ServerName::try_from(name)?;
    let tls = connector.connect(server_name, tcp).await?;
    let peer_cert = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec());
    Ok(Dialed {
        stream: Box::new(tls),
        peer,
        peer_cert,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
        });

        let target = Target::with_host("127.0.0.1", port).build();
        let mut dialed = dial(&target).await.unwrap();
        assert_eq!(dialed.peer.port, port);
        assert!(dialed.peer_cert.is_none());

        dialed.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        dialed.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_timeout_fires() {
        // RFC 5737 TEST-NET-1 does not answer
        let target = Target::with_host("192.0.2.1", 81)
            .connect_timeout(Duration::from_millis(50))
            .build();
        assert!(dial(&target).await.is_err());
    }

    #[test]
    fn keylog_appends_nss_lines() {
        use rustls::KeyLog;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.log");
        let keylog = FileKeyLog::open(&path).unwrap();
        keylog.log("CLIENT_RANDOM", &[0xab, 0xcd], &[0x01, 0x02]);
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "CLIENT_RANDOM abcd 0102\n");
    }

    #[test]
    fn default_ports() {
        assert!(Target::with_host("h", 80).build().is_default_port());
        assert!(Target::with_host("h", 443).ssl(true).build().is_default_port());
        assert!(!Target::with_host("h", 8080).build().is_default_port());
        assert_eq!(Target::with_host("h", 443).ssl(true).build().scheme(), "https");
    }
}
