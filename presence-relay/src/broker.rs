use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::broadcast,
};
use tracing::{debug, info, warn};

use crate::{
    descriptor::{ConnId, EndpointDescriptor, Role},
    envelope::Envelope,
    groups::Outbox,
    hub::{Admitted, Hub},
    message::{ClientToServer, FrameReader, ServerToClient, write_message},
};

pub struct Broker {
    listener: TcpListener,
    hub: Arc<Hub>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            listener,
            hub: Arc::new(Hub::new()),
            shutdown,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker {
            listener,
            hub,
            shutdown: shutdown_tx,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    // Sessions tell their endpoint and unregister on their own.
                    let _ = shutdown_tx.send(());
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub, &shutdown_tx);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &Arc<Hub>,
    shutdown: &broadcast::Sender<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, hub, shutdown.subscribe()),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &Arc<Hub>,
    shutdown: broadcast::Receiver<()>,
) {
    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, hub, shutdown).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    hub: Arc<Hub>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(reader));

    let param = perform_handshake(&mut frames, &mut writer).await?;
    let conn_id = Hub::next_conn_id();
    let admitted = admit_and_welcome(&hub, conn_id.clone(), param, &mut writer).await?;
    debug!(?peer, %conn_id, "session started");

    // Unregister even when the session ends with an error.
    let session = async {
        let welcome = ServerToClient::Connected {
            conn_id: conn_id.clone(),
        };
        write_message(&mut writer, &welcome).await?;
        run_session(
            &hub,
            &conn_id,
            &mut frames,
            &mut writer,
            admitted.outbox,
            shutdown,
        )
        .await
    }
    .await;
    let _ = hub.release(&conn_id).await;

    session
}

async fn perform_handshake<R, W>(
    frames: &mut FrameReader<R>,
    writer: &mut W,
) -> Result<EndpointDescriptor>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first = match frames.next_frame::<ClientToServer>().await? {
        Some(message) => message,
        None => anyhow::bail!("connection closed before handshake"),
    };

    let param = extract_param(first)?;
    validate_param(&param, writer).await?;

    Ok(param)
}

// The arrival is queued in the new outbox before `Connected` goes out, and the
// session only drains the outbox after that, so the endpoint sees its
// identity first.
async fn admit_and_welcome<W>(
    hub: &Hub,
    conn_id: ConnId,
    param: EndpointDescriptor,
    writer: &mut W,
) -> Result<Admitted>
where
    W: AsyncWrite + Unpin,
{
    match hub.admit(conn_id.clone(), param).await {
        Some(admitted) => Ok(admitted),
        None => {
            write_message(
                writer,
                &ServerToClient::Error {
                    message: format!("connection identity {conn_id} is already registered"),
                },
            )
            .await?;
            anyhow::bail!("connection identity {conn_id} is already registered");
        }
    }
}

fn extract_param(message: ClientToServer) -> Result<EndpointDescriptor> {
    match message {
        ClientToServer::Connect { mut param } => {
            param.name = param.name.trim().to_string();
            Ok(param)
        }
        _ => anyhow::bail!("expected connect message first"),
    }
}

async fn validate_param<W>(param: &EndpointDescriptor, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if param.name.is_empty() {
        write_message(
            writer,
            &ServerToClient::Error {
                message: "display name cannot be empty".to_string(),
            },
        )
        .await?;
        anyhow::bail!("display name cannot be empty");
    }
    Ok(())
}

async fn run_session<R, W>(
    hub: &Hub,
    conn_id: &ConnId,
    frames: &mut FrameReader<R>,
    writer: &mut W,
    mut outbox: Outbox,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            client_message = frames.next_frame::<ClientToServer>() => {
                if !handle_client_message(client_message, writer, hub, conn_id).await? {
                    break;
                }
            }
            envelope = outbox.recv() => {
                if !handle_outbound_envelope(envelope, writer).await? {
                    break;
                }
            }
            _ = shutdown.recv() => {
                notify_shutdown(writer).await;
                break;
            }
        }
    }

    Ok(())
}

async fn handle_client_message<W>(
    message: Result<Option<ClientToServer>, std::io::Error>,
    writer: &mut W,
    hub: &Hub,
    conn_id: &str,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match message? {
        Some(ClientToServer::SendMessage { envelope }) => {
            let delivery = hub.submit(conn_id, envelope).await;
            debug!(%conn_id, ?delivery, "envelope routed");
            Ok(true)
        }
        Some(ClientToServer::GetOnlineServices) => {
            hub.roster_query(conn_id, Role::Service).await;
            Ok(true)
        }
        Some(ClientToServer::GetOnlineClients) => {
            hub.roster_query(conn_id, Role::Client).await;
            Ok(true)
        }
        Some(ClientToServer::Connect { .. }) => {
            write_message(
                writer,
                &ServerToClient::Error {
                    message: "already connected".to_string(),
                },
            )
            .await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn handle_outbound_envelope<W>(envelope: Option<Envelope>, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match envelope {
        Some(envelope) => {
            if let Err(err) = write_message(writer, &ServerToClient::AddMessage { envelope }).await
            {
                debug!(?err, "failed to deliver envelope to endpoint");
                return Ok(false);
            }
            Ok(true)
        }
        // The hub dropped our outbox, so nothing more will arrive.
        None => Ok(false),
    }
}

async fn notify_shutdown<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let notice = ServerToClient::Error {
        message: "broker shutting down".to_string(),
    };
    if let Err(err) = write_message(writer, &notice).await {
        debug!(?err, "failed to notify endpoint about shutdown");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{io::AsyncWriteExt, time::timeout};

    use super::*;
    use crate::envelope::{Body, Route};

    const READ_TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn handshake_requires_connect_first() {
        let result = extract_param(ClientToServer::GetOnlineClients);
        assert!(result.is_err());
    }

    #[test]
    fn handshake_trims_display_name() {
        let param = extract_param(ClientToServer::Connect {
            param: EndpointDescriptor::new("  alice \n", Role::Client),
        })
        .expect("connect frame accepted");
        assert_eq!(param.name, "alice");
    }

    #[tokio::test]
    async fn empty_name_is_rejected_with_an_error_frame() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut frames = FrameReader::new(BufReader::new(reader));

        let result = validate_param(&EndpointDescriptor::new("", Role::Service), &mut writer).await;
        assert!(result.is_err());

        let frame = frames
            .next_frame::<ServerToClient>()
            .await
            .expect("read frame")
            .expect("error frame sent");
        assert_eq!(
            frame,
            ServerToClient::Error {
                message: "display name cannot be empty".into()
            }
        );
    }

    #[tokio::test]
    async fn refused_admission_sends_an_error_instead_of_connected() {
        let hub = Hub::new();
        let _first = hub
            .admit("dup".into(), EndpointDescriptor::new("svc", Role::Service))
            .await
            .expect("first admission");

        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut frames = FrameReader::new(BufReader::new(reader));
        let result = admit_and_welcome(
            &hub,
            "dup".into(),
            EndpointDescriptor::new("cli", Role::Client),
            &mut writer,
        )
        .await;
        assert!(result.is_err());

        let frame = frames
            .next_frame::<ServerToClient>()
            .await
            .expect("read frame")
            .expect("error frame sent");
        assert!(matches!(frame, ServerToClient::Error { .. }), "got {frame:?}");
        assert_eq!(hub.registry().len(Role::Client).await, 0);
        assert_eq!(hub.registry().len(Role::Service).await, 1);
    }

    #[tokio::test]
    async fn frame_split_around_outbox_delivery_is_still_routed() {
        let hub = Arc::new(Hub::new());
        let me = hub
            .admit("me".into(), EndpointDescriptor::new("me", Role::Client))
            .await
            .expect("me admitted");
        let mut peer = hub
            .admit("peer".into(), EndpointDescriptor::new("peer", Role::Service))
            .await
            .expect("peer admitted");

        let (mut to_broker, broker_in) = tokio::io::duplex(16 * 1024);
        let (broker_out, from_broker) = tokio::io::duplex(64 * 1024);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let session = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move {
                let mut frames = FrameReader::new(BufReader::new(broker_in));
                let mut writer = broker_out;
                run_session(
                    &hub,
                    &"me".to_string(),
                    &mut frames,
                    &mut writer,
                    me.outbox,
                    shutdown_rx,
                )
                .await
            }
        });

        let long_text = "x".repeat(4000);
        let frame = ClientToServer::SendMessage {
            envelope: Envelope::text("me", Route::Direct("peer".into()), long_text.clone()),
        };
        let mut encoded = serde_json::to_vec(&frame).expect("encode frame");
        encoded.push(b'\n');
        let (head, tail) = encoded.split_at(2000);

        to_broker.write_all(head).await.expect("write head");
        hub.submit(
            "peer",
            Envelope::text("peer", Route::Direct("me".into()), "interrupt"),
        )
        .await;

        // Wait until the session has written the interrupting envelope out.
        let mut delivered = FrameReader::new(BufReader::new(from_broker));
        loop {
            let next = timeout(READ_TIMEOUT, delivered.next_frame::<ServerToClient>())
                .await
                .expect("session kept writing")
                .expect("read frame");
            match next {
                Some(ServerToClient::AddMessage { envelope }) => {
                    if matches!(&envelope.body, Body::Text { message } if message == "interrupt") {
                        break;
                    }
                }
                Some(_) => {}
                None => panic!("session closed before delivering the interrupt"),
            }
        }

        to_broker.write_all(tail).await.expect("write tail");
        let routed = loop {
            let envelope = timeout(READ_TIMEOUT, peer.outbox.recv())
                .await
                .expect("peer received the long frame")
                .expect("peer outbox open");
            if let Body::Text { message } = envelope.body {
                break (envelope.from, message);
            }
        };
        assert_eq!(routed, ("me".to_string(), long_text));

        drop(to_broker);
        let result = timeout(READ_TIMEOUT, session)
            .await
            .expect("session ends on eof")
            .expect("session task");
        assert!(result.is_ok(), "session failed: {result:?}");
    }
}
