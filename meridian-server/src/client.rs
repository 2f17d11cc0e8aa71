//! Minimal leader-connection client used by the replication follower.
//!
//! Speaks the same wire protocol the server serves: requests go out as
//! canonical array frames, replies come back as JSON lines. After an
//! `AOF <pos>` request the same connection switches to a raw frame
//! stream.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, ServerError};
use crate::protocol::{encode_frame, parse_frame};

pub struct LeaderConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl LeaderConn {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<LeaderConn> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ServerError::other(format!("connect to {addr}: timed out")))?
            .map_err(|e| ServerError::other(format!("connect to {addr}: {e}")))?;
        Ok(LeaderConn {
            stream,
            buf: Vec::new(),
        })
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 16 * 1024];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::other("connection closed by leader"));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn send(&mut self, args: &[String]) -> Result<()> {
        let frame = encode_frame(args);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// One CRLF-terminated JSON reply line.
    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
                while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map_err(|_| ServerError::other("bad reply encoding"));
            }
            self.fill().await?;
        }
    }

    /// Issue a request and parse its JSON reply. `{"ok":false}` replies
    /// become errors carrying the server's message.
    pub async fn request(&mut self, args: &[String]) -> Result<Value> {
        self.send(args).await?;
        let line = self.read_line().await?;
        let value: Value = serde_json::from_str(&line)
            .map_err(|e| ServerError::other(format!("bad reply: {e}")))?;
        if value["ok"].as_bool() != Some(true) {
            let err = value["err"].as_str().unwrap_or("request failed");
            if err == "EOF" {
                return Err(ServerError::Eof);
            }
            return Err(ServerError::other(err));
        }
        Ok(value)
    }

    /// Issue `AOF <pos>` and wait for the live sentinel; afterwards the
    /// connection is a raw frame stream readable via
    /// [`LeaderConn::next_frame`].
    pub async fn request_live(&mut self, args: &[String]) -> Result<()> {
        let value = self.request(args).await?;
        if value["live"].as_bool() != Some(true) {
            return Err(ServerError::other("invalid response to aof live request"));
        }
        Ok(())
    }

    /// Next frame from the live stream.
    pub async fn next_frame(&mut self) -> Result<Vec<String>> {
        loop {
            if let Some((args, used)) = parse_frame(&self.buf)? {
                self.buf.drain(..used);
                return Ok(args);
            }
            self.fill().await?;
        }
    }
}
