use std::io;
use std::net::SocketAddr;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use bridge::codec::encode_frame;
use bridge::protocol;
use bridge::session::{Session, Transport};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ServerContext;
use crate::server::wait_for_shutdown;

pub fn router(context: ServerContext) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .with_state(context)
}

pub async fn serve(
    listener: TcpListener,
    context: ServerContext,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "websocket listening");
    axum::serve(
        listener,
        router(context).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
    .await?;
    info!("websocket listener stopped");
    Ok(())
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(context): State<ServerContext>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, context))
}

async fn handle_socket(mut socket: WebSocket, peer: SocketAddr, context: ServerContext) {
    let mut session = match context.open_session(Transport::WebSocket, Some(peer)) {
        Ok(session) => session,
        Err(fault) => {
            warn!(%peer, "refusing websocket connection: {fault}");
            if let Ok(line) = encode_frame(&protocol::Response::fault(None, &fault)) {
                let _ = socket.send(Message::Text(line.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    while let Some(message) = socket.recv().await {
        match message {
            Ok(Message::Text(text)) => session.push_message(text.as_str()),
            Ok(Message::Binary(bytes)) => {
                session.push(&bytes);
                session.finish();
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                debug!(%peer, "websocket receive failed: {err}");
                break;
            }
        }
        if send_responses(&mut socket, &mut session).await.is_err() {
            break;
        }
    }
    session.close();
}

async fn send_responses(socket: &mut WebSocket, session: &mut Session) -> Result<(), axum::Error> {
    while let Some(response) = session.next_response().await {
        match encode_frame(&response) {
            Ok(line) => socket.send(Message::Text(line.into())).await?,
            Err(err) => warn!("failed to encode response: {err}"),
        }
    }
    Ok(())
}
