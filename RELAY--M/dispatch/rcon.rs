use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use relay_actions::remote::{RemoteConsole, RemoteError};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    time::timeout,
};
use tracing::{debug, warn};

const SERVERDATA_AUTH: i32 = 3;
const SERVERDATA_AUTH_RESPONSE: i32 = 2;
const SERVERDATA_EXECCOMMAND: i32 = 2;
const SERVERDATA_RESPONSE_VALUE: i32 = 0;
const AUTH_FAILED_ID: i32 = -1;
/// Id, type and the two trailing NUL bytes.
const HEADER_LEN: usize = 10;
const MAX_PACKET_LEN: usize = 1 << 20;

/// Where and how to reach the game server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconConfig {
    /// Resolved server address.
    pub address: SocketAddr,
    /// RCON password.
    pub password: String,
    /// Upper bound for connecting and for each reply.
    pub reply_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

fn encode_packet(id: i32, kind: i32, body: &str) -> Result<Vec<u8>, RemoteError> {
    let size = i32::try_from(body.len() + HEADER_LEN)
        .map_err(|_| RemoteError::Protocol("command too long".into()))?;
    let mut buffer = Vec::with_capacity(body.len() + HEADER_LEN + 4);
    buffer.extend_from_slice(&size.to_le_bytes());
    buffer.extend_from_slice(&id.to_le_bytes());
    buffer.extend_from_slice(&kind.to_le_bytes());
    buffer.extend_from_slice(body.as_bytes());
    buffer.extend_from_slice(&[0, 0]);
    Ok(buffer)
}

async fn read_packet<S>(stream: &mut S) -> Result<Packet, RemoteError>
where
    S: AsyncRead + Unpin,
{
    let size = stream.read_i32_le().await?;
    let size = usize::try_from(size)
        .ok()
        .filter(|size| (HEADER_LEN..=MAX_PACKET_LEN).contains(size))
        .ok_or_else(|| RemoteError::Protocol(format!("invalid packet size {size}")))?;
    let mut payload = vec![0u8; size];
    stream.read_exact(&mut payload).await?;
    let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let body = &payload[8..size - 2];
    let body = body.split(|byte| *byte == 0).next().unwrap_or_default();
    Ok(Packet {
        id,
        kind,
        body: String::from_utf8_lossy(body).into_owned(),
    })
}

async fn write_packet<S>(stream: &mut S, id: i32, kind: i32, body: &str) -> Result<(), RemoteError>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode_packet(id, kind, body)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// [`RemoteConsole`] speaking the Source RCON protocol over TCP.
#[derive(Debug)]
pub struct RconClient {
    config: RconConfig,
    stream: Option<TcpStream>,
    next_id: i32,
    disconnects: watch::Sender<u64>,
}

impl RconClient {
    /// Creates a client; no connection is made until [`RemoteConsole::connect`].
    #[must_use]
    pub fn new(config: RconConfig) -> Self {
        let (disconnects, _) = watch::channel(0);
        Self {
            config,
            stream: None,
            next_id: 0,
            disconnects,
        }
    }

    /// Address this client talks to.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Whether a session is currently open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn allocate_id(&mut self) -> i32 {
        self.next_id = if self.next_id >= i32::MAX - 1 {
            1
        } else {
            self.next_id + 1
        };
        self.next_id
    }

    fn drop_session(&mut self, err: &RemoteError) {
        if self.stream.take().is_some() {
            warn!(address = %self.config.address, error = %err, "rcon.session.lost");
            self.disconnects.send_modify(|count| *count += 1);
        }
    }

    async fn authenticate(&mut self, stream: &mut TcpStream) -> Result<(), RemoteError> {
        let id = self.allocate_id();
        write_packet(stream, id, SERVERDATA_AUTH, &self.config.password).await?;
        loop {
            let packet = read_packet(stream).await?;
            if packet.kind != SERVERDATA_AUTH_RESPONSE {
                continue;
            }
            if packet.id == AUTH_FAILED_ID {
                return Err(RemoteError::AuthRejected);
            }
            if packet.id == id {
                return Ok(());
            }
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<String, RemoteError> {
        let command_id = self.allocate_id();
        let sentinel_id = self.allocate_id();
        let stream = self.stream.as_mut().ok_or(RemoteError::NotConnected)?;
        write_packet(stream, command_id, SERVERDATA_EXECCOMMAND, command).await?;
        write_packet(stream, sentinel_id, SERVERDATA_RESPONSE_VALUE, "").await?;
        let mut reply = String::new();
        loop {
            let packet = read_packet(stream).await?;
            if packet.id == sentinel_id {
                return Ok(reply);
            }
            if packet.id == command_id && packet.kind == SERVERDATA_RESPONSE_VALUE {
                reply.push_str(&packet.body);
            } else {
                debug!(id = packet.id, kind = packet.kind, "rcon.packet.ignored");
            }
        }
    }
}

#[async_trait]
impl RemoteConsole for RconClient {
    async fn connect(&mut self) -> Result<(), RemoteError> {
        self.stream = None;
        let limit = self.config.reply_timeout;
        let mut stream = timeout(limit, TcpStream::connect(self.config.address))
            .await
            .map_err(|_| RemoteError::Timeout)??;
        stream.set_nodelay(true)?;
        timeout(limit, self.authenticate(&mut stream))
            .await
            .map_err(|_| RemoteError::Timeout)??;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String, RemoteError> {
        if self.stream.is_none() {
            return Err(RemoteError::NotConnected);
        }
        let result = match timeout(self.config.reply_timeout, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        };
        if let Err(err) = &result {
            self.drop_session(err);
        }
        result
    }

    fn disconnect_events(&self) -> watch::Receiver<u64> {
        self.disconnects.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const PASSWORD: &str = "hunter2";

    async fn serve_one(listener: TcpListener, replies: Vec<&'static str>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let auth = read_packet(&mut socket).await.unwrap();
        assert_eq!(auth.kind, SERVERDATA_AUTH);
        write_packet(&mut socket, auth.id, SERVERDATA_RESPONSE_VALUE, "")
            .await
            .unwrap();
        let granted = if auth.body == PASSWORD {
            auth.id
        } else {
            AUTH_FAILED_ID
        };
        write_packet(&mut socket, granted, SERVERDATA_AUTH_RESPONSE, "")
            .await
            .unwrap();
        if granted == AUTH_FAILED_ID {
            return;
        }
        let mut replies = replies.into_iter();
        loop {
            let Ok(command) = read_packet(&mut socket).await else {
                return;
            };
            if command.kind == SERVERDATA_RESPONSE_VALUE {
                write_packet(&mut socket, command.id, SERVERDATA_RESPONSE_VALUE, "")
                    .await
                    .unwrap();
                continue;
            }
            if command.body == "hangup" {
                return;
            }
            write_packet(&mut socket, 999, SERVERDATA_RESPONSE_VALUE, "noise")
                .await
                .unwrap();
            for chunk in replies.next().unwrap_or_default().split('|') {
                write_packet(&mut socket, command.id, SERVERDATA_RESPONSE_VALUE, chunk)
                    .await
                    .unwrap();
            }
        }
    }

    async fn client_for(replies: Vec<&'static str>, password: &str) -> RconClient {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(serve_one(listener, replies));
        RconClient::new(RconConfig {
            address,
            password: password.into(),
            reply_timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn packets_are_little_endian_and_nul_terminated() {
        let frame = encode_packet(7, SERVERDATA_EXECCOMMAND, "status").unwrap();
        assert_eq!(&frame[..4], &16i32.to_le_bytes());
        assert_eq!(&frame[4..8], &7i32.to_le_bytes());
        assert_eq!(&frame[8..12], &2i32.to_le_bytes());
        assert_eq!(&frame[12..18], b"status");
        assert_eq!(&frame[18..], &[0, 0]);
    }

    #[tokio::test]
    async fn authenticates_and_joins_multi_packet_replies() {
        let mut client = client_for(vec!["hostname: relay|players: 4"], PASSWORD).await;
        client.connect().await.unwrap();
        assert!(client.is_connected());
        let reply = client.send_command("status").await.unwrap();
        assert_eq!(reply, "hostname: relayplayers: 4");
    }

    #[tokio::test]
    async fn rejected_password_reports_auth_failure() {
        let mut client = client_for(Vec::new(), "wrong").await;
        let err = client.connect().await.unwrap_err();
        assert_eq!(err, RemoteError::AuthRejected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn sending_without_session_fails_fast() {
        let mut client = RconClient::new(RconConfig {
            address: "127.0.0.1:9".parse().unwrap(),
            password: PASSWORD.into(),
            reply_timeout: Duration::from_secs(1),
        });
        let err = client.send_command("status").await.unwrap_err();
        assert_eq!(err, RemoteError::NotConnected);
    }

    #[tokio::test]
    async fn lost_session_bumps_disconnect_counter() {
        let mut client = client_for(Vec::new(), PASSWORD).await;
        let mut disconnects = client.disconnect_events();
        client.connect().await.unwrap();
        assert!(client.send_command("hangup").await.is_err());
        assert!(!client.is_connected());
        disconnects.changed().await.unwrap();
        assert_eq!(*disconnects.borrow(), 1);
    }
}
