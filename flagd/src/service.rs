//! The TCP service loop: each accepted connection is framed and dispatched
//! through one shared `flagdb::dispatcher::Dispatcher`, which already
//! serializes per tenant, so this layer adds no further locking of its
//! own.

use std::sync::Arc;

use flagdb::dispatcher::Dispatcher;
use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::TcpListener;

use crate::protocol::{self, Transport};

pub async fn serve(bind: &str, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!("flagd listening on {bind}");

    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            info!("connection accepted from {peer}");
            if let Err(err) = handle_connection(protocol::transport(stream), dispatcher).await {
                warn!("connection {peer} ended with error: {err}");
            }
        });
    }
}

async fn handle_connection(mut transport: Transport, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    while let Some(frame) = transport.next().await {
        let frame = frame?;
        let reply = match protocol::decode_request(&frame) {
            Ok(request) => dispatcher.handle(request),
            Err(err) => flagdb::ops::Reply::Err(format!("malformed request: {err}")),
        };

        if let Err(err) = transport.send(protocol::encode_reply(&reply)?).await {
            error!("failed writing reply: {err}");
            break;
        }
    }
    Ok(())
}
