//! The binary TCP server: remote database access and replication
//! serving on one port. Each accepted connection binds to a role by
//! its first frame and is handled strictly serially.

pub mod dispatch;
pub mod replication;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use xapiand_replication::frame::{read_frame, write_frame};
use xapiand_replication::message::{
    RemoteMessageType, RemoteReplyType, ReplicationMessageType,
};
use xapiand_replication::payload::ExceptionBody;

use crate::context::ServerContext;
use crate::error::{Error, Result};

pub use dispatch::{RemoteSession, SessionState};

/// A connection with no complete request for this long is destroyed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct RemoteServer {
    local_addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl RemoteServer {
    pub async fn spawn(ctx: Arc<ServerContext>) -> Result<Self> {
        let bind = (ctx.config.host.clone(), ctx.config.binary_port);
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "binary protocol listening");
        let task = tokio::spawn(accept_loop(listener, ctx));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tracing::debug!(%peer, "binary connection accepted");
                tokio::spawn(connection(stream, ctx.clone(), peer));
            }
            Err(err) => {
                tracing::warn!(%err, "accept failed");
            }
        }
    }
}

async fn connection(mut stream: TcpStream, ctx: Arc<ServerContext>, peer: SocketAddr) {
    // The first frame selects the connection's role.
    let Ok(first) = timed_read(&mut stream).await else {
        return;
    };

    if first.0 == ReplicationMessageType::Hello.as_u8() {
        if let Err(err) = replication::serve(&mut stream, &first.1, &ctx).await {
            tracing::warn!(%peer, %err, "replication connection closed");
        }
        return;
    }

    remote_loop(stream, ctx, peer, first).await;
}

async fn remote_loop(
    mut stream: TcpStream,
    ctx: Arc<ServerContext>,
    peer: SocketAddr,
    first: (u8, bytes::Bytes),
) {
    let mut session = RemoteSession::new(ctx);
    let mut pending = Some(first);
    loop {
        let (raw_type, payload) = match pending.take() {
            Some(frame) => frame,
            None => match timed_read(&mut stream).await {
                Ok(frame) => frame,
                Err(Error::NetworkTimeout) => {
                    tracing::debug!(%peer, "idle connection destroyed");
                    return;
                }
                Err(err) => {
                    tracing::debug!(%peer, %err, "connection ended");
                    return;
                }
            },
        };

        let ty = match RemoteMessageType::try_from(raw_type) {
            Ok(ty) => ty,
            Err(err) => {
                tracing::warn!(%peer, %err, "destroying connection");
                return;
            }
        };

        let outcome =
            tokio::task::block_in_place(|| session.handle_message(ty, &payload));
        match outcome {
            Ok(frames) => {
                for frame in frames {
                    if write_frame(&mut stream, frame.ty.as_u8(), &frame.payload)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if session.shutdown_requested() {
                    tracing::info!(%peer, "shutdown requested over binary protocol");
                    return;
                }
            }
            // Handled errors go back as Exception replies and the
            // connection keeps serving.
            Err(err) if err.is_recoverable_on_connection() => {
                let body = ExceptionBody {
                    type_code: err.exception_type_code(),
                    context: ty.name().to_owned(),
                    message: err.to_string(),
                    error_string: err.to_string(),
                };
                if write_frame(
                    &mut stream,
                    RemoteReplyType::Exception.as_u8(),
                    &body.encode(),
                )
                .await
                .is_err()
                {
                    return;
                }
            }
            // The terminal arm: anything else destroys the connection.
            Err(err) => {
                tracing::warn!(%peer, %err, "destroying connection");
                return;
            }
        }
    }
}

async fn timed_read(stream: &mut TcpStream) -> Result<(u8, bytes::Bytes)> {
    match tokio::time::timeout(IDLE_TIMEOUT, read_frame(stream)).await {
        Ok(Ok(frame)) => Ok(frame),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::NetworkTimeout),
    }
}
