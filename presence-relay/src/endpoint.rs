use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::EndpointArgs,
    descriptor::{ConnId, EndpointDescriptor, login_user_name},
    envelope::{Command, Envelope, Route},
    message::{ClientToServer, FrameReader, ServerToClient, write_message},
    reconciler::{Reaction, Reconciler},
    view::{render_event, render_roster},
};

pub async fn run(args: EndpointArgs) -> Result<()> {
    let mut reconciler = Reconciler::new();
    reconciler.begin_connecting();

    let (mut reader, mut writer, descriptor) = establish_connection(&args).await?;
    let conn_id = send_handshake(&mut reader, &mut writer, descriptor).await?;
    write_stdout(&format!("*** connected as {conn_id}")).await?;

    let reaction = reconciler.on_connected(conn_id);
    apply_reaction(reaction, &mut writer).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    run_endpoint_loop(&mut reconciler, &mut reader, &mut writer, &mut stdin).await?;
    reconciler.on_disconnected();
    shutdown_connection(&mut writer).await;

    Ok(())
}

type ServerFrames = FrameReader<BufReader<OwnedReadHalf>>;

async fn establish_connection(
    args: &EndpointArgs,
) -> Result<(ServerFrames, OwnedWriteHalf, EndpointDescriptor)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let local_ip = stream.local_addr()?.ip();
    let name = args.name.clone().unwrap_or_else(login_user_name);
    let descriptor = EndpointDescriptor::probe_local(name, args.role, local_ip);

    let (reader, writer) = stream.into_split();
    Ok((FrameReader::new(BufReader::new(reader)), writer, descriptor))
}

async fn send_handshake(
    reader: &mut ServerFrames,
    writer: &mut OwnedWriteHalf,
    param: EndpointDescriptor,
) -> Result<ConnId> {
    write_message(writer, &ClientToServer::Connect { param }).await?;

    match reader.next_frame::<ServerToClient>().await? {
        Some(ServerToClient::Connected { conn_id }) => Ok(conn_id),
        Some(ServerToClient::Error { message }) => anyhow::bail!("broker refused: {message}"),
        Some(other) => anyhow::bail!("unexpected handshake response: {other:?}"),
        None => anyhow::bail!("broker closed the connection during handshake"),
    }
}

async fn run_endpoint_loop(
    reconciler: &mut Reconciler,
    reader: &mut ServerFrames,
    writer: &mut OwnedWriteHalf,
    stdin: &mut Lines<BufReader<Stdin>>,
) -> Result<()> {
    loop {
        select! {
            server_message = reader.next_frame::<ServerToClient>() => {
                if !handle_server_message(server_message, reconciler, writer).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, reconciler, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: io::Result<Option<ServerToClient>>,
    reconciler: &mut Reconciler,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    match message? {
        Some(ServerToClient::AddMessage { envelope }) => {
            match reconciler.apply(envelope) {
                Ok(reaction) => apply_reaction(reaction, writer).await?,
                Err(err) => warn!(error = %err, "presence update did not match the mirror"),
            }
            Ok(true)
        }
        Some(ServerToClient::Error { message }) => {
            write_stderr(&format!("!!! {message}")).await?;
            Ok(true)
        }
        Some(ServerToClient::Connected { conn_id }) => {
            warn!(%conn_id, "ignoring repeated connected frame");
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Empty,
    Quit,
    Who,
    Say { route: Route, text: String },
    Ping { target: ConnId },
    Usage(&'static str),
}

pub fn parse_input(line: &str) -> Input {
    let text = line.trim_end();
    if text.is_empty() {
        return Input::Empty;
    }

    let mut words = text.splitn(3, ' ');
    match words.next() {
        Some(cmd) if cmd.eq_ignore_ascii_case("/quit") => Input::Quit,
        Some(cmd) if cmd.eq_ignore_ascii_case("/who") => Input::Who,
        Some(cmd) if cmd.eq_ignore_ascii_case("/to") => match (words.next(), words.next()) {
            (Some(target), Some(body)) if !target.is_empty() && !body.trim().is_empty() => {
                Input::Say {
                    route: Route::Direct(target.to_string()),
                    text: body.to_string(),
                }
            }
            _ => Input::Usage("usage: /to <conn_id> <message>"),
        },
        Some(cmd) if cmd.eq_ignore_ascii_case("/ping") => match words.next() {
            Some(target) if !target.is_empty() => Input::Ping {
                target: target.to_string(),
            },
            _ => Input::Usage("usage: /ping <conn_id>"),
        },
        _ => Input::Say {
            route: Route::Broadcast,
            text: text.to_string(),
        },
    }
}

async fn handle_stdin_input(
    line: io::Result<Option<String>>,
    reconciler: &Reconciler,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(input) = line? else {
        return Ok(false);
    };

    let from = reconciler.conn_id().unwrap_or_default().to_string();
    let envelope = match parse_input(&input) {
        Input::Empty => return Ok(true),
        Input::Quit => {
            write_stdout("*** leaving").await?;
            return Ok(false);
        }
        Input::Who => {
            for line in render_roster(reconciler.mirror()) {
                write_stdout(&line).await?;
            }
            return Ok(true);
        }
        Input::Usage(usage) => {
            write_stderr(usage).await?;
            return Ok(true);
        }
        Input::Say { route, text } => Envelope::text(from, route, text),
        Input::Ping { target } => Envelope::command(
            from,
            Route::Direct(target),
            Command::Ping {
                nonce: next_nonce(),
            },
        ),
    };

    write_message(writer, &ClientToServer::SendMessage { envelope }).await?;
    Ok(true)
}

fn next_nonce() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NONCE: AtomicU64 = AtomicU64::new(1);
    NONCE.fetch_add(1, Ordering::Relaxed)
}

async fn apply_reaction(reaction: Reaction, writer: &mut OwnedWriteHalf) -> Result<()> {
    for event in &reaction.events {
        if let Some(line) = render_event(event) {
            write_stdout(&line).await?;
        }
    }
    for frame in &reaction.outgoing {
        write_message(writer, frame).await?;
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown endpoint writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
