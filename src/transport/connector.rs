//! Custom dialer for the outbound HTTP client.
//!
//! # Responsibilities
//! - Resolve the upstream host and iterate addresses with a dial timeout
//! - For https, run the TLS handshake over a [`FragmentStream`] with the
//!   configured first-record budget
//! - On a failed fragmented handshake, re-dial the same address and retry
//!   with a plain handshake before moving to the next address
//! - Surface negotiated ALPN so the client speaks HTTP/2 when offered

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower::Service;

use crate::config::TransportSettings;
use crate::transport::dns::UpstreamResolver;
use crate::transport::fragment::FragmentStream;
use crate::transport::DialError;

/// Connection handed to the client pool: plain TCP for http upstreams, TLS
/// over a fragmenting stream for https ones.
pub enum UpstreamStream {
    Plain(TokioIo<TcpStream>),
    Tls {
        io: TokioIo<TlsStream<FragmentStream<TcpStream>>>,
        h2: bool,
    },
}

impl Read for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls { io, .. } => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls { io, .. } => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls { io, .. } => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls { io, .. } => Pin::new(io).poll_shutdown(cx),
        }
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        match self {
            UpstreamStream::Plain(_) => Connected::new(),
            UpstreamStream::Tls { h2, .. } => {
                if *h2 {
                    Connected::new().negotiated_h2()
                } else {
                    Connected::new()
                }
            }
        }
    }
}

/// Dialer used for both plain and TLS upstream connections.
#[derive(Clone)]
pub struct FragmentingConnector {
    resolver: Arc<UpstreamResolver>,
    tls: TlsConnector,
    fragment_len: u8,
    dial_timeout: Duration,
    tls_handshake_timeout: Duration,
}

impl FragmentingConnector {
    pub fn new(resolver: Arc<UpstreamResolver>, settings: &TransportSettings, fragment_len: u8) -> Self {
        crate::transport::ensure_crypto_provider();
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        if settings.force_http2 {
            config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        }
        Self {
            resolver,
            tls: TlsConnector::from(Arc::new(config)),
            fragment_len,
            dial_timeout: settings.dial_timeout,
            tls_handshake_timeout: settings.tls_handshake_timeout,
        }
    }

    async fn connect_to(self, dst: Uri) -> Result<UpstreamStream, DialError> {
        let https = dst.scheme_str() == Some("https");
        let host = dst
            .host()
            .ok_or(DialError::MissingHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = dst.port_u16().unwrap_or(if https { 443 } else { 80 });
        let addrs = self.resolver.resolve(&host).await?;
        if https {
            self.connect_tls(&host, port, &addrs).await
        } else {
            let stream = self.connect_tcp(&host, port, &addrs).await?;
            Ok(UpstreamStream::Plain(TokioIo::new(stream)))
        }
    }

    /// Iterate resolved addresses; first successful connect wins.
    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        addrs: &[IpAddr],
    ) -> Result<TcpStream, DialError> {
        let mut last_err = None;
        for &ip in addrs {
            match self.dial_addr(SocketAddr::new(ip, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(DialError::NoAddresses {
            host: host.to_string(),
        }))
    }

    async fn dial_addr(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let connect = TcpStream::connect(addr);
        let result = if self.dial_timeout > Duration::ZERO {
            match timeout(self.dial_timeout, connect).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            }
        } else {
            connect.await
        };
        let stream = result.map_err(|source| DialError::Connect { addr, source })?;
        // The fragment boundary only exists on the wire if the kernel does
        // not coalesce the two writes.
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Per address: fragmented handshake first, then a plain handshake on a
    /// fresh connection to the same address, then the next address.
    async fn connect_tls(
        &self,
        host: &str,
        port: u16,
        addrs: &[IpAddr],
    ) -> Result<UpstreamStream, DialError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| DialError::InvalidServerName {
                host: host.to_string(),
            })?;
        let mut last_err = None;
        for &ip in addrs {
            let addr = SocketAddr::new(ip, port);
            match self
                .handshake_once(addr, server_name.clone(), self.fragment_len)
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
            if self.fragment_len > 0 {
                match self.handshake_once(addr, server_name.clone(), 0).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_err = Some(e),
                }
            }
        }
        Err(last_err.unwrap_or(DialError::NoAddresses {
            host: host.to_string(),
        }))
    }

    async fn handshake_once(
        &self,
        addr: SocketAddr,
        server_name: ServerName<'static>,
        fragment_len: u8,
    ) -> Result<UpstreamStream, DialError> {
        let tcp = self.dial_addr(addr).await?;
        let stream = FragmentStream::new(tcp, fragment_len);
        let handshake = self.tls.connect(server_name, stream);
        let result = if self.tls_handshake_timeout > Duration::ZERO {
            match timeout(self.tls_handshake_timeout, handshake).await {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "tls handshake timed out",
                )),
            }
        } else {
            handshake.await
        };
        let tls_stream = result.map_err(|source| DialError::Handshake { addr, source })?;
        let h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
        Ok(UpstreamStream::Tls {
            io: TokioIo::new(tls_stream),
            h2,
        })
    }
}

impl Service<Uri> for FragmentingConnector {
    type Response = UpstreamStream;
    type Error = DialError;
    type Future = Pin<Box<dyn Future<Output = Result<UpstreamStream, DialError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(this.connect_to(dst))
    }
}
