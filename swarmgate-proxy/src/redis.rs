//! Redis-backed cache collaborator.
//!
//! Speaks just enough RESP2 for the sync loop: `GET` for the service list and
//! `SUBSCRIBE` for change notifications.
//!
//! ```text
//! Client → Server:
//!   *2\r\n$3\r\nGET\r\n$8\r\nservices\r\n
//!
//! Server → Client:
//!   $<len>\r\n<payload>\r\n     (bulk string, $-1 when missing)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use swarmgate_core::{Cache, CacheError, Notifications};

/// Largest bulk string Redis itself will store.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK`
    Simple(String),
    /// `-ERR ...`
    Error(String),
    /// `:1`
    Integer(i64),
    /// `$3 foo`, `None` for the nil bulk string.
    Bulk(Option<Bytes>),
    /// `*2 ...`, `None` for the nil array.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    fn bulk_eq(&self, expected: &[u8]) -> bool {
        matches!(self, Reply::Bulk(Some(b)) if b.eq_ignore_ascii_case(expected))
    }

    /// Whether this is a pub/sub `message` push.
    fn is_message(&self) -> bool {
        match self {
            Reply::Array(Some(items)) => items.first().is_some_and(|kind| kind.bulk_eq(b"message")),
            _ => false,
        }
    }
}

/// One RESP connection over any byte stream.
#[derive(Debug)]
pub struct Connection<S> {
    stream: BufReader<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an established stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Send one command as an array of bulk strings.
    pub async fn send(&mut self, args: &[&[u8]]) -> Result<(), CacheError> {
        let mut frame = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
        frame.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            frame.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            frame.extend_from_slice(arg);
            frame.extend_from_slice(b"\r\n");
        }

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one complete reply.
    pub fn read_reply(&mut self) -> BoxFuture<'_, Result<Reply, CacheError>> {
        Box::pin(async move {
            let line = self.read_line().await?;
            let (kind, rest) = line
                .split_first()
                .ok_or_else(|| CacheError::Protocol("empty reply line".into()))?;
            let rest = std::str::from_utf8(rest)
                .map_err(|_| CacheError::Protocol("reply header is not UTF-8".into()))?;

            match kind {
                b'+' => Ok(Reply::Simple(rest.to_string())),
                b'-' => Ok(Reply::Error(rest.to_string())),
                b':' => Ok(Reply::Integer(parse_int(rest)?)),
                b'$' => {
                    let Some(len) = parse_len(rest)? else {
                        return Ok(Reply::Bulk(None));
                    };
                    if len > MAX_BULK_LEN {
                        return Err(CacheError::Protocol(format!("bulk string of {len} bytes is too large")));
                    }
                    let mut data = vec![0; len + 2];
                    self.stream.read_exact(&mut data).await.map_err(eof_as_closed)?;
                    if !data.ends_with(b"\r\n") {
                        return Err(CacheError::Protocol("bulk string not terminated by CRLF".into()));
                    }
                    data.truncate(len);
                    Ok(Reply::Bulk(Some(Bytes::from(data))))
                }
                b'*' => {
                    let Some(len) = parse_len(rest)? else {
                        return Ok(Reply::Array(None));
                    };
                    let mut items = Vec::with_capacity(len.min(64));
                    for _ in 0..len {
                        items.push(self.read_reply().await?);
                    }
                    Ok(Reply::Array(Some(items)))
                }
                other => Err(CacheError::Protocol(format!("unknown reply type {:?}", *other as char))),
            }
        })
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, CacheError> {
        let mut line = Vec::new();
        if self.stream.read_until(b'\n', &mut line).await? == 0 {
            return Err(CacheError::Closed);
        }
        if !line.ends_with(b"\r\n") {
            return Err(CacheError::Closed);
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }
}

fn parse_int(text: &str) -> Result<i64, CacheError> {
    text.parse()
        .map_err(|_| CacheError::Protocol(format!("invalid integer {text:?}")))
}

fn parse_len(text: &str) -> Result<Option<usize>, CacheError> {
    match parse_int(text)? {
        -1 => Ok(None),
        n => usize::try_from(n)
            .map(Some)
            .map_err(|_| CacheError::Protocol(format!("invalid length {n}"))),
    }
}

fn eof_as_closed(e: std::io::Error) -> CacheError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CacheError::Closed
    } else {
        CacheError::Io(e)
    }
}

/// The production [`Cache`]: a Redis server reached over TCP.
///
/// Each `get` uses a short-lived connection; each `subscribe` holds its own
/// connection for as long as the subscription lives.
#[derive(Debug, Clone)]
pub struct RedisCache {
    addr: String,
    connect_timeout: Duration,
}

impl RedisCache {
    /// Target the server at `host:port` (a `redis://` prefix is accepted).
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let addr = addr
            .strip_prefix("redis://")
            .map(|rest| rest.trim_end_matches('/').to_string())
            .unwrap_or(addr);

        Self {
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override how long a connection attempt may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The server address connections are made to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<Connection<TcpStream>, CacheError> {
        let stream = time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| CacheError::Timeout(self.addr.clone()))??;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "connected to redis");
        Ok(Connection::new(stream))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        let mut conn = self.connect().await?;
        conn.send(&[b"GET", key.as_bytes()]).await?;

        match conn.read_reply().await? {
            Reply::Bulk(Some(value)) => Ok(value),
            Reply::Bulk(None) => Err(CacheError::Missing(key.to_string())),
            Reply::Error(message) => Err(CacheError::Protocol(message)),
            other => Err(CacheError::Protocol(format!("unexpected reply to GET: {other:?}"))),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Notifications, CacheError> {
        let conn = self.connect().await?;
        subscribe_on(conn, channel).await
    }
}

/// Issue `SUBSCRIBE` on `conn` and turn the pushes that follow into notifications.
pub async fn subscribe_on<S>(mut conn: Connection<S>, channel: &str) -> Result<Notifications, CacheError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    conn.send(&[b"SUBSCRIBE", channel.as_bytes()]).await?;

    match conn.read_reply().await? {
        Reply::Array(Some(items)) if items.first().is_some_and(|kind| kind.bulk_eq(b"subscribe")) => {}
        Reply::Error(message) => return Err(CacheError::Protocol(message)),
        other => {
            return Err(CacheError::Protocol(format!(
                "unexpected reply to SUBSCRIBE: {other:?}"
            )))
        }
    }

    let notifications = stream::unfold(Some(conn), |state| async move {
        let mut conn = state?;
        loop {
            match conn.read_reply().await {
                Ok(reply) if reply.is_message() => return Some((Ok(()), Some(conn))),
                Ok(reply) => debug!(?reply, "ignoring non-message push"),
                Err(e) => return Some((Err(e), None)),
            }
        }
    });

    Ok(notifications.boxed())
}
