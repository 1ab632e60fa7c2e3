use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::dbbat::common::{Error, Result};
use crate::dbbat::config::SslMode;
use crate::dbbat::pg::protocol::{MessageBuilder, Tag, SSL_ALLOWED, SSL_NOT_ALLOWED, SSL_REQUEST};
use crate::dbbat::server::DangerousCertificateNonverifier;
use crate::dbbat::store::{Database, FailureReason};

/// Marker for the byte streams a session proxies over; satisfied by plain
/// TCP, TLS-wrapped TCP, and the in-memory duplex used in tests.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Opens the transport to an upstream server. The session drives the
/// protocol; this only produces a connected (and possibly TLS-wrapped)
/// byte stream. Tests substitute a scripted in-memory implementation.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, database: &Database) -> Result<BoxedStream>;
}

/// The production connector: TCP, then SSLRequest negotiation per the
/// database's ssl_mode.
pub struct TcpUpstreamConnector;

#[async_trait]
impl UpstreamConnector for TcpUpstreamConnector {
    async fn connect(&self, database: &Database) -> Result<BoxedStream> {
        let addr = format!("{}:{}", database.host, database.port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            Error::auth(
                FailureReason::UpstreamConnFailed,
                format!("could not connect to {}: {}", addr, e),
            )
        })?;
        stream.set_nodelay(true)?;

        match database.ssl_mode {
            SslMode::Disable => Ok(Box::new(stream)),
            SslMode::Prefer | SslMode::Require => {
                negotiate_tls(stream, database).await
            }
        }
    }
}

async fn negotiate_tls(mut stream: TcpStream, database: &Database) -> Result<BoxedStream> {
    let mut mb = MessageBuilder::new(Tag::UNTAGGED);
    mb.write_i32(SSL_REQUEST);
    stream.write_all(mb.finish().as_slice()).await?;

    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await?;
    match answer[0] {
        SSL_ALLOWED => {
            let config = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(DangerousCertificateNonverifier::new())
                .with_no_client_auth();
            let server_name = rustls::pki_types::ServerName::try_from(database.host.clone())
                .map_err(|e| Error::new(format!("invalid upstream host name: {}", e)))?;
            let connector = TlsConnector::from(Arc::new(config));
            let tls = connector.connect(server_name, stream).await?;
            debug!(host = %database.host, "upstream TLS established");
            Ok(Box::new(tls))
        }
        SSL_NOT_ALLOWED => {
            if database.ssl_mode == SslMode::Require {
                return Err(Error::auth(
                    FailureReason::UpstreamConnFailed,
                    format!("upstream {} refused TLS but ssl_mode is require", database.host),
                ));
            }
            Ok(Box::new(stream))
        }
        other => Err(Error::protocol_error(format!(
            "unexpected SSLRequest response {:#04x}",
            other
        ))),
    }
}
