//! MariaDB client protocol session for replication.
//!
//! Implements the slice of the wire protocol the reader needs:
//! - handshake and authentication (`mysql_native_password`,
//!   MariaDB `client_ed25519`, auth-switch)
//! - `COM_QUERY` for the session variables of the GTID handshake
//! - `COM_REGISTER_SLAVE` and `COM_BINLOG_DUMP`
//! - the binlog event stream
//!
//! Result-set-bearing SQL goes through [`crate::connection::SqlSession`]
//! instead; this session only ever sees OK/ERR responses.

use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use std::io::Cursor;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Server;
use crate::error::{ReplicationError, Result};
use crate::event::{EventParser, ReplicationEvent};

const PACKET_HEADER_SIZE: usize = 4;
const MAX_PACKET_SIZE: usize = 16_777_215;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

// Client capability flags used during the handshake
const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

/// The server greeting packet.
#[derive(Debug)]
struct HandshakePacket {
    server_version: String,
    connection_id: u32,
    capability_flags: u32,
    auth_plugin_data: Vec<u8>,
    auth_plugin_name: String,
}

impl HandshakePacket {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let _protocol_version = read_u8(&mut cursor)?;

        let mut server_version = Vec::new();
        loop {
            let byte = read_u8(&mut cursor)?;
            if byte == 0 {
                break;
            }
            server_version.push(byte);
        }
        let server_version = String::from_utf8_lossy(&server_version).to_string();

        let connection_id = read_u32_le(&mut cursor)?;

        let mut auth_data_part1 = [0u8; 8];
        read_exact(&mut cursor, &mut auth_data_part1)?;

        let _filler = read_u8(&mut cursor)?;
        let cap_lower = read_u16_le(&mut cursor)?;
        let _character_set = read_u8(&mut cursor)?;
        let _status_flags = read_u16_le(&mut cursor)?;
        let cap_upper = read_u16_le(&mut cursor)?;
        let capability_flags = ((cap_upper as u32) << 16) | cap_lower as u32;

        let auth_data_len = read_u8(&mut cursor)? as usize;

        let mut reserved = [0u8; 10];
        read_exact(&mut cursor, &mut reserved)?;

        let part2_len = if auth_data_len > 8 { auth_data_len - 8 } else { 13 };
        let mut auth_data_part2 = vec![0u8; part2_len];
        read_exact(&mut cursor, &mut auth_data_part2)?;
        if let Some(pos) = auth_data_part2.iter().position(|&b| b == 0) {
            auth_data_part2.truncate(pos);
        }

        let mut auth_plugin_name = Vec::new();
        if capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            while (cursor.position() as usize) < data.len() {
                let byte = read_u8(&mut cursor)?;
                if byte == 0 {
                    break;
                }
                auth_plugin_name.push(byte);
            }
        }

        let mut auth_plugin_data = auth_data_part1.to_vec();
        auth_plugin_data.extend_from_slice(&auth_data_part2);

        Ok(Self {
            server_version,
            connection_id,
            capability_flags,
            auth_plugin_data,
            auth_plugin_name: String::from_utf8_lossy(&auth_plugin_name).to_string(),
        })
    }
}

/// One authenticated client-protocol session, promotable to a replication
/// stream.
pub struct BinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server: Server,
    server_version: String,
    replicating: bool,
    parser: EventParser,
}

impl std::fmt::Debug for BinlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogClient")
            .field("server", &self.server)
            .field("server_version", &self.server_version)
            .field("replicating", &self.replicating)
            .finish_non_exhaustive()
    }
}

impl BinlogClient {
    /// Connect and authenticate against one server.
    pub async fn connect(server: &Server) -> Result<Self> {
        let addr = format!("{}:{}", server.host, server.port);
        debug!(server = %server, "connecting replication session");

        let tcp = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ReplicationError::connection(format!(
                    "connect to {addr} failed: {e}"
                )))
            }
            Err(_) => {
                return Err(ReplicationError::connection(format!(
                    "connect to {addr} timed out"
                )))
            }
        };

        let mut client = Self {
            stream: BufReader::new(tcp),
            sequence_id: 0,
            server: server.clone(),
            server_version: String::new(),
            replicating: false,
            parser: EventParser::new(),
        };

        let greeting = client.read_packet().await?;
        let handshake = HandshakePacket::parse(&greeting)?;
        client.server_version = handshake.server_version.clone();

        info!(
            server = %server,
            version = %handshake.server_version,
            connection_id = handshake.connection_id,
            "connected to primary"
        );

        client.authenticate(&handshake).await?;
        Ok(client)
    }

    /// Connect to the first reachable candidate, in list order.
    pub async fn connect_any(candidates: &[Server]) -> Result<Self> {
        let mut last_error = "no candidate servers".to_string();

        for server in candidates {
            match Self::connect(server).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    warn!(server = %server, error = %err, "candidate connection failed");
                    last_error = err.to_string();
                }
            }
        }

        Err(ReplicationError::connection(last_error))
    }

    /// Which candidate this session is connected to.
    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    async fn authenticate(&mut self, handshake: &HandshakePacket) -> Result<()> {
        let client_flags = CLIENT_LONG_PASSWORD
            | CLIENT_LONG_FLAG
            | CLIENT_PROTOCOL_41
            | CLIENT_TRANSACTIONS
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH;

        let auth_response = auth_reply(
            &handshake.auth_plugin_name,
            &self.server.password,
            &handshake.auth_plugin_data,
        )?;

        let mut response = BytesMut::with_capacity(128);
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(45); // utf8mb4
        response.put_slice(&[0u8; 23]);
        response.put_slice(self.server.user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(handshake.auth_plugin_name.as_bytes());
        response.put_u8(0);

        self.write_packet(&response).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(error_packet(&reply, "authentication failed")),
            Some(0xFE) => {
                // Auth switch request: plugin name then fresh auth data
                if reply.len() < 2 {
                    return Err(ReplicationError::protocol("malformed auth switch packet"));
                }
                let name_end = reply[1..].iter().position(|&b| b == 0).unwrap_or(reply.len() - 1);
                let plugin = String::from_utf8_lossy(&reply[1..1 + name_end]).to_string();
                let auth_data = reply.get(2 + name_end..).unwrap_or(&[]).to_vec();
                debug!(plugin = %plugin, "auth switch requested");

                let switched = auth_reply(&plugin, &self.server.password, &auth_data)?;
                self.write_packet(&switched).await?;

                let final_reply = self.read_packet().await?;
                match final_reply.first() {
                    Some(0x00) => Ok(()),
                    Some(0xFF) => Err(error_packet(&final_reply, "auth switch failed")),
                    _ => Err(ReplicationError::protocol("unexpected auth switch reply")),
                }
            }
            _ => Err(ReplicationError::protocol("unexpected authentication reply")),
        }
    }

    /// Execute one statement; only OK/ERR replies are expected.
    pub async fn query(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(0x03); // COM_QUERY
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(error_packet(&reply, sql)),
            _ => Ok(()),
        }
    }

    /// Execute a sequence of statements, stopping at the first failure.
    pub async fn query_batch(&mut self, statements: &[String]) -> Result<()> {
        for stmt in statements {
            self.query(stmt).await?;
        }
        Ok(())
    }

    /// Promote the session to a replication stream.
    ///
    /// Registers with the given server id and requests the binlog dump; the
    /// start position comes from the `@slave_connect_state` session
    /// variable set during the handshake batch. Fails if the session has
    /// already been promoted.
    pub async fn replicate(&mut self, server_id: u32) -> Result<()> {
        if self.replicating {
            return Err(ReplicationError::protocol(
                "session is already a replication stream",
            ));
        }

        self.register_slave(server_id).await?;
        self.binlog_dump(server_id).await?;
        self.replicating = true;

        info!(server_id, server = %self.server, "replication stream open");
        Ok(())
    }

    async fn register_slave(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(0x15); // COM_REGISTER_SLAVE
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id

        self.write_packet(&packet).await?;

        let reply = self.read_packet().await?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(error_packet(&reply, "COM_REGISTER_SLAVE")),
            _ => Err(ReplicationError::protocol(
                "unexpected COM_REGISTER_SLAVE reply",
            )),
        }
    }

    async fn binlog_dump(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;

        let mut packet = BytesMut::with_capacity(11);
        packet.put_u8(0x12); // COM_BINLOG_DUMP
        packet.put_u32_le(4); // position: past the magic header
        packet.put_u16_le(0); // flags
        packet.put_u32_le(server_id);
        // Empty binlog filename: the GTID connect state picks the position

        self.write_packet(&packet).await
    }

    /// Fetch the next replication event.
    ///
    /// `Ok(None)` means the stream ended (EOF packet); the caller drops
    /// the connection and reconnects. Errors cover broken streams and
    /// error packets from the primary.
    pub async fn fetch_event(&mut self) -> Result<Option<ReplicationEvent>> {
        if !self.replicating {
            return Err(ReplicationError::protocol(
                "fetch_event on a session that is not replicating",
            ));
        }

        let packet = self.read_packet().await?;
        if packet.is_empty() {
            return Ok(None);
        }

        match packet[0] {
            0x00 => {
                let event = self.parser.parse(&packet[1..])?;
                Ok(Some(event))
            }
            0xFE => {
                debug!("EOF in replication stream");
                Ok(None)
            }
            0xFF => Err(error_packet(&packet, "replication stream")),
            _ => Err(ReplicationError::protocol(format!(
                "unexpected replication packet marker 0x{:02X}",
                packet[0]
            ))),
        }
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| ReplicationError::connection("read timed out"))??;

        let payload_len =
            header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
        self.sequence_id = header[3].wrapping_add(1);

        let mut payload = vec![0u8; payload_len];
        timeout(IO_TIMEOUT, self.stream.read_exact(&mut payload))
            .await
            .map_err(|_| ReplicationError::connection("read timed out"))??;

        Ok(payload)
    }

    async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(ReplicationError::protocol(format!(
                "packet too large: {} bytes",
                data.len()
            )));
        }

        let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + data.len());
        packet.push((data.len() & 0xFF) as u8);
        packet.push(((data.len() >> 8) & 0xFF) as u8);
        packet.push(((data.len() >> 16) & 0xFF) as u8);
        packet.push(self.sequence_id);
        packet.extend_from_slice(data);

        timeout(IO_TIMEOUT, async {
            self.stream.get_mut().write_all(&packet).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| ReplicationError::connection("write timed out"))??;

        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }
}

/// Build the authentication reply for a plugin.
fn auth_reply(plugin: &str, password: &str, auth_data: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        "" | "mysql_native_password" => Ok(mysql_native_password(password, auth_data)),
        "client_ed25519" => Ok(client_ed25519(password, auth_data)),
        other => Err(ReplicationError::protocol(format!(
            "unsupported authentication plugin '{other}'"
        ))),
    }
}

/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`
fn mysql_native_password(password: &str, salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// MariaDB `client_ed25519`: sign the server nonce with an Ed25519 key
/// derived from `SHA-512(password)`.
fn client_ed25519(password: &str, nonce: &[u8]) -> Vec<u8> {
    use ed25519_dalek::{Signer, SigningKey};
    use sha2::Sha512;

    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha512::new();
    hasher.update(password.as_bytes());
    let hash = hasher.finalize();

    let seed: [u8; 32] = match hash[..32].try_into() {
        Ok(seed) => seed,
        Err(_) => return Vec::new(),
    };

    let signing_key = SigningKey::from_bytes(&seed);
    signing_key.sign(nonce).to_bytes().to_vec()
}

/// Render an ERR packet into an error carrying the server's code and text.
fn error_packet(packet: &[u8], context: &str) -> ReplicationError {
    if packet.len() > 9 {
        let code = u16::from_le_bytes([packet[1], packet[2]]);
        let message = String::from_utf8_lossy(&packet[9..]);
        ReplicationError::protocol(format!("{context}: {code} {message}"))
    } else {
        ReplicationError::protocol(format!("{context}: malformed error packet"))
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(cursor, &mut buf)?;
    Ok(buf[0])
}

fn read_u16_le(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(cursor, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_le(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<()> {
    std::io::Read::read_exact(cursor, buf)
        .map_err(|_| ReplicationError::protocol("truncated handshake packet"))
}
