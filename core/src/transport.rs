//! Transport Client. Thin wrapper over a dial-with-timeout call and the
//! typed publish-stream stub, owned exclusively by its Publish Session.
//! Mirrors `solana_client::grpc`'s dial/TLS-config pattern, generalized
//! from a Yellowstone gRPC endpoint to an arbitrary `host:port` collector
//! address.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::TcpSocket;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::error::TransportError;
use crate::wire::{Notification, TelemetryPublishClient};

/// TLS credentials for a dial. Opaque beyond "present or absent" — actual
/// certificate provisioning is handled by the embedder, not here.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
}

/// Owns one connected channel and the typed client stub built on top of
/// it. Never shared between sessions.
pub struct TransportClient {
    client: TelemetryPublishClient<Channel>,
}

impl TransportClient {
    /// Blocking dial bounded by `timeout` (the global retry interval),
    /// optionally binding the outbound socket to `src_ip` first. Counts as
    /// a single attempt regardless of outcome.
    pub async fn dial(
        destination: &str,
        timeout: Duration,
        src_ip: Option<&str>,
        tls: &TlsConfig,
    ) -> Result<Self, TransportError> {
        let dial_err = |source| TransportError::DialFailed {
            destination: destination.to_owned(),
            source,
        };
        let timeout_err = || TransportError::DialTimeout {
            destination: destination.to_owned(),
            timeout_secs: timeout.as_secs(),
        };

        let scheme = if tls.enabled { "https" } else { "http" };
        let uri = Uri::from_str(&format!("{scheme}://{destination}")).map_err(|_| {
            dial_err(tonic::transport::Error::from(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "bad destination uri",
            )))
        })?;

        let mut endpoint = Endpoint::from(uri).timeout(timeout).connect_timeout(timeout);
        if tls.enabled {
            endpoint = endpoint
                .tls_config(tonic::transport::ClientTlsConfig::new().with_webpki_roots())
                .map_err(dial_err)?;
        }

        let connect = async {
            match src_ip {
                Some(src_ip) => {
                    let src_ip = src_ip.to_owned();
                    let destination = destination.to_owned();
                    let connector = service_fn(move |_uri: Uri| {
                        let src_ip = src_ip.clone();
                        let destination = destination.clone();
                        async move { dial_bound(&src_ip, &destination).await }
                    });
                    endpoint.connect_with_connector(connector).await
                }
                None => endpoint.connect().await,
            }
        };

        let channel = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| timeout_err())?
            .map_err(dial_err)?;

        Ok(Self {
            client: TelemetryPublishClient::new(channel),
        })
    }

    /// Opens the outbound publish stream. The returned stream of inbound
    /// messages is read but otherwise ignored by callers — the channel is
    /// unidirectional in this revision.
    pub async fn open_publish_stream(
        &mut self,
        outbound: tokio_stream::wrappers::ReceiverStream<Notification>,
    ) -> Result<tonic::Streaming<crate::wire::PublishResponse>, TransportError> {
        self.client
            .publish(outbound)
            .await
            .map(tonic::Response::into_inner)
            .map_err(|source| TransportError::StreamOpenFailed {
                destination: String::from("<connected>"),
                source,
            })
    }

    /// Tears down the transport. A dropped `Channel` closes its
    /// connections; this just makes that explicit at the session's Close
    /// call site instead of relying on drop order.
    pub fn close(self) {
        drop(self);
    }
}

/// Resolves `destination`, binds a fresh socket to `src_ip`, and connects.
/// The custom connector this backs is the only way to express
/// "bind-before-connect" through `tonic`/`hyper`, which otherwise pick the
/// local address themselves.
async fn dial_bound(
    src_ip: &str,
    destination: &str,
) -> Result<hyper_util::rt::TokioIo<tokio::net::TcpStream>, std::io::Error> {
    let remote: SocketAddr = tokio::net::lookup_host(destination)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))?;

    let socket = if remote.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    let local: SocketAddr = format!("{src_ip}:0")
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad src_ip"))?;
    socket.bind(local)?;

    let stream = socket.connect(remote).await?;
    Ok(hyper_util::rt::TokioIo::new(stream))
}
