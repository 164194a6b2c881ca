//! Device tunnel acceptor
//!
//! Listens for inbound CIRA connections, runs the hello exchange
//! (identity, protocol version, optional shared token), and hands
//! authenticated streams to the broker. TLS is optional and wraps the
//! stream before the hello.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use cira_broker::{Broker, BrokerError};
use cira_proto::{read_frame, write_frame, CodecError, TunnelFrame, PROTOCOL_VERSION};

/// How long a freshly accepted connection gets to present its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum AcceptError {
    #[error("Device did not send a hello in time")]
    HelloTimeout,
    #[error("First frame was not a hello")]
    UnexpectedFrame,
    #[error("Unsupported protocol version {0}")]
    VersionMismatch(u32),
    #[error("Device presented an invalid auth token")]
    BadToken,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Accepts device tunnel connections and feeds them to a [`Broker`].
pub struct TunnelAcceptor {
    listener: TcpListener,
    broker: Broker,
    device_token: Option<String>,
    tls: Option<TlsAcceptor>,
}

impl TunnelAcceptor {
    pub async fn bind(addr: SocketAddr, broker: Broker) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Tunnel acceptor listening");
        Ok(Self {
            listener,
            broker,
            device_token: None,
            tls: None,
        })
    }

    /// Require devices to present this token in their hello.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.device_token = Some(token.into());
        self
    }

    /// Wrap accepted connections in TLS before the hello exchange.
    pub fn with_tls(mut self, tls: TlsAcceptor) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is aborted.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    let broker = self.broker.clone();
                    let token = self.device_token.clone();
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(tls) => match tls.accept(socket).await {
                                Ok(stream) => handshake(broker, token, stream).await,
                                Err(e) => {
                                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => handshake(broker, token, socket).await,
                        };
                        if let Err(e) = result {
                            warn!(peer = %peer, error = %e, "Tunnel handshake rejected");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept tunnel connection");
                }
            }
        }
    }
}

/// Run the hello exchange on a fresh connection, then register the
/// tunnel with the broker. Rejected connections are dropped without an
/// acknowledgement.
async fn handshake<S>(
    broker: Broker,
    token: Option<String>,
    mut stream: S,
) -> Result<(), AcceptError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let hello: TunnelFrame = timeout(HELLO_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| AcceptError::HelloTimeout)??;

    let (version, device_id, auth_token) = match hello {
        TunnelFrame::Hello {
            version,
            device_id,
            auth_token,
        } => (version, device_id, auth_token),
        other => {
            debug!(frame = ?other, "Expected a hello frame");
            return Err(AcceptError::UnexpectedFrame);
        }
    };

    if version != PROTOCOL_VERSION {
        return Err(AcceptError::VersionMismatch(version));
    }
    if let Some(expected) = token {
        if auth_token.as_deref() != Some(expected.as_str()) {
            return Err(AcceptError::BadToken);
        }
    }

    let ack = TunnelFrame::HelloAck {
        instance_id: broker.instance_id().to_string(),
    };
    write_frame(&mut stream, &ack).await?;

    debug!(device_id = %device_id, "Tunnel authenticated");
    broker.tunnel_accepted(device_id, stream).await?;
    Ok(())
}
