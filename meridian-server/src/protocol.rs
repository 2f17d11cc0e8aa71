//! Wire and log framing.
//!
//! Requests arrive either as length-prefixed arrays (`*N\r\n$len\r\n...`,
//! the canonical form, also used verbatim as the AOF frame format) or as
//! newline-terminated text commands tokenized on whitespace with support
//! for `"quoted strings"`. Replies are rendered in the connection's output
//! dialect: JSON envelopes or RESP simple strings / errors / integers /
//! bulk strings.

use crate::error::{Result, ServerError};

/// Per-connection reply dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    Json,
    Resp,
}

/// A parsed request: an argument vector plus the dialect to answer in.
#[derive(Debug, Clone)]
pub struct Message {
    pub args: Vec<String>,
    pub output: OutputKind,
}

impl Message {
    pub fn new(args: Vec<String>) -> Self {
        Message {
            args,
            output: OutputKind::Json,
        }
    }

    /// Lowercased command name; empty for an empty message.
    pub fn command(&self) -> String {
        self.args
            .first()
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Encode an argument vector into a canonical array frame.
pub fn encode_frame(args: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for a in args {
        out.extend_from_slice(format!("${}\r\n", a.len()).as_bytes());
        out.extend_from_slice(a.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Incrementally parse one frame from `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the argument
/// vector and the number of bytes consumed. A malformed prefix is
/// [`ServerError::CorruptedLog`]. Plain text lines (no leading `*`) are
/// tokenized with quote support.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Vec<String>, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        // Inline text command, terminated by \n.
        let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = &buf[..nl];
        let line = if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        };
        let text = std::str::from_utf8(line).map_err(|_| ServerError::CorruptedLog)?;
        return Ok(Some((tokenize_line(text)?, nl + 1)));
    }

    let mut pos = 0usize;
    let count = match read_prefixed_int(buf, &mut pos, b'*')? {
        Some(n) => n,
        None => return Ok(None),
    };
    if count < 0 || count > 1024 * 1024 {
        return Err(ServerError::CorruptedLog);
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = match read_prefixed_int(buf, &mut pos, b'$')? {
            Some(n) => n,
            None => return Ok(None),
        };
        if len < 0 {
            return Err(ServerError::CorruptedLog);
        }
        let len = len as usize;
        if buf.len() < pos + len + 2 {
            return Ok(None);
        }
        let bytes = &buf[pos..pos + len];
        if &buf[pos + len..pos + len + 2] != b"\r\n" {
            return Err(ServerError::CorruptedLog);
        }
        let s = std::str::from_utf8(bytes)
            .map_err(|_| ServerError::CorruptedLog)?
            .to_string();
        args.push(s);
        pos += len + 2;
    }
    Ok(Some((args, pos)))
}

fn read_prefixed_int(buf: &[u8], pos: &mut usize, marker: u8) -> Result<Option<i64>> {
    if buf.len() <= *pos {
        return Ok(None);
    }
    if buf[*pos] != marker {
        return Err(ServerError::CorruptedLog);
    }
    let rest = &buf[*pos + 1..];
    let Some(nl) = rest.iter().position(|&b| b == b'\r') else {
        // Bound the prefix so garbage cannot stall the parser forever.
        if rest.len() > 16 {
            return Err(ServerError::CorruptedLog);
        }
        return Ok(None);
    };
    if rest.len() < nl + 2 || rest[nl + 1] != b'\n' {
        if rest.len() < nl + 2 {
            return Ok(None);
        }
        return Err(ServerError::CorruptedLog);
    }
    let digits =
        std::str::from_utf8(&rest[..nl]).map_err(|_| ServerError::CorruptedLog)?;
    let n: i64 = digits.parse().map_err(|_| ServerError::CorruptedLog)?;
    *pos += 1 + nl + 2;
    Ok(Some(n))
}

/// Tokenize a text command line, honoring double-quoted strings with
/// backslash escapes.
pub fn tokenize_line(line: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut tok = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => tok.push('\n'),
                        Some('t') => tok.push('\t'),
                        Some(other) => tok.push(other),
                        None => return Err(ServerError::invalid_argument(line)),
                    },
                    Some(other) => tok.push(other),
                    None => return Err(ServerError::invalid_argument(line)),
                }
            }
            args.push(tok);
        } else {
            let mut tok = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                tok.push(c);
                chars.next();
            }
            args.push(tok);
        }
    }
    Ok(args)
}

/// A reply carrying both dialect renderings.
#[derive(Debug, Clone)]
pub struct Reply {
    pub json: String,
    pub resp: RespValue,
}

/// RESP-side reply value.
#[derive(Debug, Clone)]
pub enum RespValue {
    Simple(String),
    Integer(i64),
    Bulk(String),
    Array(Vec<RespValue>),
    Null,
}

impl RespValue {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::Simple(s) => out.extend_from_slice(format!("+{s}\r\n").as_bytes()),
            RespValue::Integer(n) => out.extend_from_slice(format!(":{n}\r\n").as_bytes()),
            RespValue::Bulk(s) => {
                out.extend_from_slice(format!("${}\r\n{}\r\n", s.len(), s).as_bytes())
            }
            RespValue::Array(items) => {
                out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode_into(out);
                }
            }
            RespValue::Null => out.extend_from_slice(b"$-1\r\n"),
        }
    }
}

impl Reply {
    /// Plain success: `{"ok":true,"elapsed":...}` / `+OK`.
    pub fn ok(elapsed: &str) -> Reply {
        Reply {
            json: format!("{{\"ok\":true,\"elapsed\":\"{elapsed}\"}}"),
            resp: RespValue::Simple("OK".into()),
        }
    }

    /// A JSON body; RESP connections receive it as a bulk string.
    pub fn json(body: String) -> Reply {
        Reply {
            resp: RespValue::Bulk(body.clone()),
            json: body,
        }
    }

    pub fn with_resp(mut self, resp: RespValue) -> Reply {
        self.resp = resp;
        self
    }

    /// Render for the given dialect, including wire framing.
    pub fn render(&self, output: OutputKind) -> Vec<u8> {
        match output {
            OutputKind::Json => {
                let mut b = self.json.clone().into_bytes();
                b.extend_from_slice(b"\r\n");
                b
            }
            OutputKind::Resp => {
                let mut b = Vec::new();
                self.resp.encode_into(&mut b);
                b
            }
        }
    }
}

/// Render an error in the given dialect, including wire framing.
pub fn render_error(err: &ServerError, cmd: &str, elapsed: &str, output: OutputKind) -> Vec<u8> {
    match output {
        OutputKind::Json => format!(
            "{{\"ok\":false,\"err\":{},\"elapsed\":\"{elapsed}\"}}\r\n",
            json_string(&err.to_string())
        )
        .into_bytes(),
        OutputKind::Resp => {
            let text = match err {
                ServerError::InvalidNumArgs => {
                    format!("wrong number of arguments for '{cmd}' command")
                }
                other => other.to_string(),
            };
            format!("-ERR {text}\r\n").into_bytes()
        }
    }
}

/// JSON-escape a string, with surrounding quotes.
pub fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}
