//! A single remote-backend connection
//!
//! Connections are owned by the pool while idle and lent exclusively to one
//! caller while active. The only suspension points are TCP establishment,
//! command dispatch, and response reception, each bounded by its configured
//! timeout.

use crate::errors::{CacheError, Result};
use crate::remote::resp::{self, Reply};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Exclusive handle to one remote connection
#[derive(Debug)]
pub struct Connection {
    id: u64,
    addr: String,
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    /// Establish a connection, authenticating and selecting the database
    /// when configured
    pub async fn connect(
        id: u64,
        addr: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
        password: Option<&str>,
        database: u32,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CacheError::Timeout {
                operation: "connect",
                duration: connect_timeout,
            })?
            .map_err(|e| CacheError::ConnectionFailed {
                addr: addr.to_string(),
                source: e,
            })?;

        let mut conn = Connection {
            id,
            addr: addr.to_string(),
            stream,
            buf: BytesMut::with_capacity(4096),
        };

        if let Some(password) = password {
            let args: [&[u8]; 2] = [b"AUTH", password.as_bytes()];
            let reply = conn.execute(&args, read_timeout).await?;
            if let Some(message) = reply.error_message() {
                return Err(CacheError::ConnectionFailed {
                    addr: conn.addr,
                    source: std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        message.to_string(),
                    ),
                });
            }
        }
        if database != 0 {
            let database = database.to_string();
            let args: [&[u8]; 2] = [b"SELECT", database.as_bytes()];
            let reply = conn.execute(&args, read_timeout).await?;
            if let Some(message) = reply.error_message() {
                return Err(CacheError::ConnectionFailed {
                    addr: conn.addr,
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        message.to_string(),
                    ),
                });
            }
        }

        tracing::debug!(id, addr, "remote connection established");
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Issue one command and wait for its reply
    pub async fn execute(&mut self, args: &[&[u8]], read_timeout: Duration) -> Result<Reply> {
        let mut out = BytesMut::new();
        resp::encode_command(&mut out, args);
        self.stream
            .write_all(&out)
            .await
            .map_err(|e| self.io_failed(e))?;
        self.read_reply(read_timeout).await
    }

    /// Issue a batch of commands in one write, then collect one reply per
    /// command in order
    pub async fn pipeline(
        &mut self,
        commands: &[Vec<Vec<u8>>],
        read_timeout: Duration,
    ) -> Result<Vec<Reply>> {
        let mut out = BytesMut::new();
        for command in commands {
            let args: Vec<&[u8]> = command.iter().map(Vec::as_slice).collect();
            resp::encode_command(&mut out, &args);
        }
        self.stream
            .write_all(&out)
            .await
            .map_err(|e| self.io_failed(e))?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply(read_timeout).await?);
        }
        Ok(replies)
    }

    /// Health probe; any failure means the connection must be destroyed
    pub async fn ping(&mut self, read_timeout: Duration) -> bool {
        let args: [&[u8]; 1] = [b"PING"];
        matches!(
            self.execute(&args, read_timeout).await,
            Ok(Reply::Simple(s)) if s == "PONG"
        )
    }

    async fn read_reply(&mut self, read_timeout: Duration) -> Result<Reply> {
        loop {
            if let Some(reply) = resp::decode(&mut self.buf)? {
                return Ok(reply);
            }
            let read = tokio::time::timeout(read_timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| CacheError::Timeout {
                    operation: "read reply",
                    duration: read_timeout,
                })?
                .map_err(|e| self.io_failed(e))?;
            if read == 0 {
                return Err(CacheError::ConnectionFailed {
                    addr: self.addr.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ),
                });
            }
        }
    }

    fn io_failed(&self, source: std::io::Error) -> CacheError {
        CacheError::ConnectionFailed {
            addr: self.addr.clone(),
            source,
        }
    }
}
