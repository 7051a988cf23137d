//! TCP server that answers every connection with one pipeline run.
//!
//! The accept loop never waits on a client: each accepted stream is handed
//! to its own task, which runs the pipeline, writes the result and closes
//! the stream. Handlers share nothing but the read-only [`Pipeline`].

use crate::config::{Config, ConfigError};
use crate::connection::Connection;
use crate::pipeline::Pipeline;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// How long to keep discarding client input after the response is sent.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server instance
pub struct Server {
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let listen = config.listen_addr();
        let addr = listen
            .to_socket_addrs()
            .map_err(|e| ServerError::Resolve(listen.clone(), e))?
            .next()
            .ok_or_else(|| {
                ServerError::Resolve(
                    listen.clone(),
                    io::Error::new(io::ErrorKind::NotFound, "no addresses"),
                )
            })?;

        let listener = create_listener(addr, config.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(addr, e))?;

        Ok(Server {
            listener,
            pipeline: Arc::new(Pipeline::new(config.quote.clone(), config.render.clone())),
            connection_limit: config
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the limiter is closed, which never happens
    /// in normal operation.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr().map_err(ServerError::Accept)?;
        info!(address = %addr, "Server listening");

        let mut next_id: u64 = 0;

        loop {
            // Wait for a connection slot
            let permit = match &self.connection_limit {
                Some(limit) => Some(
                    Arc::clone(limit)
                        .acquire_owned()
                        .await
                        .map_err(|_| ServerError::LimiterClosed)?,
                ),
                None => None,
            };

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    next_id += 1;
                    let conn = Connection::new(next_id, peer);
                    debug!(id = conn.id, peer = %conn.peer, "New connection");

                    let pipeline = Arc::clone(&self.pipeline);
                    let span = info_span!("conn", id = conn.id, peer = %peer);

                    tokio::spawn(
                        async move {
                            handle_connection(conn, stream, &pipeline).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Handle a single client connection.
///
/// The stream is shut down and dropped before returning, whatever the
/// pipeline outcome. Returns the connection in its closed state.
async fn handle_connection<S>(
    mut conn: Connection,
    mut stream: S,
    pipeline: &Pipeline,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.start_generating();

    let output = match pipeline.run().await {
        Ok(output) => output,
        Err(partial) => {
            warn!(
                stage = %partial.error.stage(),
                error = %partial.error,
                salvaged = partial.output.len(),
                "Pipeline failed"
            );
            partial.output
        }
    };

    conn.start_writing(output.len());
    trace!(state = %conn.state(), "Response ready");

    if !output.is_empty() {
        if let Err(e) = stream.write_all(&output).await {
            debug!(error = %e, "Write failed");
        }
    }

    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Shutdown failed");
    }
    drain(&mut stream).await;
    drop(stream);

    conn.close();
    debug_assert!(conn.is_closed());
    debug!(bytes = output.len(), "Connection closed");
    conn
}

/// Discard whatever the client sent until it closes its side or
/// `DRAIN_TIMEOUT` passes.
///
/// Closing a socket with unread input makes the kernel send RST, which can
/// destroy the response before the client has read it.
async fn drain<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];
    let discard = async {
        let mut discarded = 0usize;
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return discarded,
                Ok(n) => discarded += n,
            }
        }
    };

    match tokio::time::timeout(DRAIN_TIMEOUT, discard).await {
        Ok(0) => {}
        Ok(discarded) => trace!(discarded, "Ignored client input"),
        Err(_) => debug!("Client kept the connection open after the response"),
    }
}

/// Create the listening socket.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    Resolve(String, io::Error),
    Bind(SocketAddr, io::Error),
    Accept(io::Error),
    Config(ConfigError),
    LimiterClosed,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Resolve(listen, e) => {
                write!(f, "Failed to resolve listen address '{listen}': {e}")
            }
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            ServerError::Accept(e) => write!(f, "Listener failed: {e}"),
            ServerError::Config(e) => write!(f, "Invalid configuration: {e}"),
            ServerError::LimiterClosed => f.write_str("Connection limiter closed"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Resolve(_, e) | ServerError::Bind(_, e) | ServerError::Accept(e) => {
                Some(e)
            }
            ServerError::Config(e) => Some(e),
            ServerError::LimiterClosed => None,
        }
    }
}
