use std::io;
use std::net::SocketAddr;

use bridge::codec::encode_frame;
use bridge::protocol::Response;
use bridge::session::Transport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ServerContext;
use crate::server::wait_for_shutdown;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Accepts line-delimited JSON-RPC connections until shutdown is signalled.
/// Connections already open keep being served; they answer every further
/// request with a shutting-down error until the peer hangs up.
pub async fn serve(
    listener: TcpListener,
    context: ServerContext,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "tcp listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("tcp accept failed: {err}");
                        continue;
                    }
                };
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, context).await {
                        debug!(%peer, "tcp connection ended with error: {err}");
                    }
                });
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    info!("tcp listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: ServerContext,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut session = match context.open_session(Transport::Tcp, Some(peer)) {
        Ok(session) => session,
        Err(fault) => {
            warn!(%peer, "refusing tcp connection: {fault}");
            let line = encode_frame(&Response::fault(None, &fault))?;
            writer.write_all(line.as_bytes()).await?;
            writer.shutdown().await?;
            return Ok(());
        }
    };

    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        while let Some(response) = session.next_response().await {
            let line = encode_frame(&response)?;
            writer.write_all(line.as_bytes()).await?;
        }
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            session.finish();
            while let Some(response) = session.next_response().await {
                let line = encode_frame(&response)?;
                writer.write_all(line.as_bytes()).await?;
            }
            break;
        }
        session.push(&buf[..read]);
    }
    session.close();
    Ok(())
}
