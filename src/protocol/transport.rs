//! Line-oriented, prompt-terminated transport to one drive.
//!
//! The drive console is a telnet service: commands go out as ASCII text plus
//! CRLF, responses come back as `<payload>\r\n-->`. Error responses begin
//! with the literal `Error:` marker instead. This module owns the TCP
//! stream, the response framing, and the minimum amount of telnet option
//! handling needed to keep long responses from being hard-wrapped by the
//! remote terminal emulation.
//!
//! The exchange model is strictly half-duplex: one request, one terminated
//! response, enforced by `&mut self` on [`Transport::execute`].

use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::config::{DriveEndpoint, ProtocolTimeouts};
use crate::error::{DriveError, DriveResult};

/// Fixed response terminator the drive prints as its prompt.
const TERMINATOR: &[u8] = b"\r\n-->";
/// Error responses begin with this marker.
const ERROR_MARKER: &[u8] = b"Error:";
/// How long to keep draining stale bytes right after connect.
const STALE_GRACE: Duration = Duration::from_millis(50);

// Telnet protocol bytes (RFC 854 / RFC 1073).
const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const NAWS: u8 = 31;

/// Window size advertised to the remote terminal emulation. Wide enough
/// that long parameter dumps come back without inserted line breaks.
const WINDOW_WIDTH: u16 = 20_000;
const WINDOW_HEIGHT: u16 = 1_000;

/// One TCP connection to one drive's command console.
#[derive(Debug)]
pub(crate) struct Transport {
    stream: TcpStream,
    label: String,
    trace: bool,
    rx: BytesMut,
    /// Raw bytes held back because they end in an incomplete telnet
    /// sequence; prepended to the next read before scrubbing.
    telnet_tail: Vec<u8>,
}

impl Transport {
    /// Open a connection with a bounded timeout, advertise the window size,
    /// and discard any stale bytes left over from a prior session.
    pub(crate) async fn connect(
        endpoint: &DriveEndpoint,
        timeouts: &ProtocolTimeouts,
    ) -> DriveResult<Self> {
        let addr = endpoint.addr();
        let stream = match time::timeout(timeouts.connect(), TcpStream::connect(&addr)).await {
            Err(_) => {
                return Err(DriveError::Connect {
                    addr,
                    reason: "connect timed out, verify that nothing is already connected to it"
                        .to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(DriveError::Connect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;

        let label = if endpoint.name.is_empty() {
            addr
        } else {
            endpoint.label()
        };
        let mut transport = Self {
            stream,
            label,
            trace: endpoint.trace,
            rx: BytesMut::new(),
            telnet_tail: Vec::new(),
        };
        transport.offer_window_size().await?;
        transport.discard_stale().await?;
        Ok(transport)
    }

    /// Replace the transport label once the drive's real name is known.
    pub(crate) fn set_label(&mut self, label: String) {
        self.label = label;
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Send one command and read until the response terminator.
    ///
    /// Comments (`#` to end of line) are stripped before sending; an
    /// all-comment or empty line is a no-op that returns immediately
    /// without a round trip. Three terminal conditions are checked in
    /// order on every read iteration: an empty read with nothing
    /// accumulated is [`DriveError::NoResponse`]; a buffer starting with
    /// the `Error:` marker is [`DriveError::Device`]; a buffer matching
    /// `<payload>\r\n-->` yields the payload.
    pub(crate) async fn execute(&mut self, cmd: &str, timeout: Duration) -> DriveResult<Vec<u8>> {
        let cmd = strip_comment(cmd);
        if cmd.is_empty() {
            return Ok(Vec::new());
        }

        // Half-duplex: anything still buffered belongs to no exchange.
        self.rx.clear();
        self.telnet_tail.clear();

        if self.trace {
            debug!("[{}] >>> {:?}", self.label, cmd);
        }
        self.stream.write_all(cmd.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;

        let deadline = Instant::now() + timeout;
        loop {
            let n = self.read_chunk(deadline).await?;

            if n == 0 && self.rx.is_empty() {
                return Err(self.no_response(cmd));
            }
            if self.rx.starts_with(ERROR_MARKER) {
                let message = String::from_utf8_lossy(&self.rx[ERROR_MARKER.len()..])
                    .trim()
                    .to_string();
                if self.trace {
                    debug!("[{}] <<< {:?}", self.label, &self.rx[..]);
                }
                return Err(DriveError::Device {
                    drive: self.label.clone(),
                    cmd: cmd.to_string(),
                    message,
                });
            }
            if let Some(pos) = find(&self.rx, TERMINATOR) {
                if self.trace {
                    debug!("[{}] <<< {:?}", self.label, &self.rx[..pos + TERMINATOR.len()]);
                }
                let payload = self.rx[..pos].to_vec();
                self.rx.advance(pos + TERMINATOR.len());
                return Ok(payload);
            }
            if n == 0 {
                // Closed or timed out with a partial, unterminated response.
                return Err(self.no_response(cmd));
            }
        }
    }

    /// Close the connection. Safe to call once; the session guarantees it
    /// is not called twice.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn no_response(&self, cmd: &str) -> DriveError {
        DriveError::NoResponse {
            drive: self.label.clone(),
            cmd: cmd.to_string(),
        }
    }

    /// Read once with the remaining deadline budget. Returns 0 on timeout
    /// or a closed stream; scrubbed payload bytes land in `self.rx`.
    async fn read_chunk(&mut self, deadline: Instant) -> DriveResult<usize> {
        let now = Instant::now();
        if now >= deadline {
            return Ok(0);
        }
        let mut chunk = [0u8; 4096];
        match time::timeout(deadline - now, self.stream.read(&mut chunk)).await {
            Err(_) => Ok(0),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Ok(0),
            Ok(Ok(n)) => {
                self.ingest(&chunk[..n]).await?;
                Ok(n)
            }
        }
    }

    /// Run freshly read bytes through the telnet scrubber, answering
    /// option negotiations as they appear.
    async fn ingest(&mut self, raw_new: &[u8]) -> DriveResult<()> {
        let mut raw = std::mem::take(&mut self.telnet_tail);
        raw.extend_from_slice(raw_new);
        let scrubbed = scrub_telnet(&raw);
        self.telnet_tail = scrubbed.tail;
        if !scrubbed.replies.is_empty() {
            self.stream.write_all(&scrubbed.replies).await?;
        }
        self.rx.extend_from_slice(&scrubbed.clean);
        Ok(())
    }

    /// Unsolicited NAWS offer sent right after connect so the remote side
    /// never hard-wraps long responses.
    async fn offer_window_size(&mut self) -> DriveResult<()> {
        self.stream.write_all(&naws_offer()).await?;
        Ok(())
    }

    /// Drop whatever a prior, improperly closed session left buffered on
    /// the remote side, including the connect-time telnet chatter.
    async fn discard_stale(&mut self) -> DriveResult<()> {
        let mut chunk = [0u8; 1024];
        loop {
            match time::timeout(STALE_GRACE, self.stream.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if self.trace {
                        debug!("[{}] discarding {} stale bytes", self.label, n);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Strip a trailing `#` comment. Returns the command with trailing
/// whitespace removed; a line that was all comment comes back empty.
pub(crate) fn strip_comment(cmd: &str) -> &str {
    match cmd.find('#') {
        Some(pos) => cmd[..pos].trim_end(),
        None => cmd,
    }
}

/// `IAC WILL NAWS` followed by the window-size subnegotiation.
fn naws_offer() -> Vec<u8> {
    let w = WINDOW_WIDTH.to_be_bytes();
    let h = WINDOW_HEIGHT.to_be_bytes();
    vec![
        IAC, WILL, NAWS, IAC, SB, NAWS, w[0], w[1], h[0], h[1], IAC, SE,
    ]
}

struct Scrubbed {
    /// Payload bytes with telnet sequences removed.
    clean: Vec<u8>,
    /// Incomplete trailing telnet sequence, to be retried on the next read.
    tail: Vec<u8>,
    /// Negotiation responses to write back to the peer.
    replies: Vec<u8>,
}

/// Remove telnet command sequences from `raw`, refusing every option the
/// peer proposes except NAWS, which gets the window-size offer.
fn scrub_telnet(raw: &[u8]) -> Scrubbed {
    let mut clean = Vec::with_capacity(raw.len());
    let mut replies = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != IAC {
            clean.push(raw[i]);
            i += 1;
            continue;
        }
        if i + 1 >= raw.len() {
            break;
        }
        match raw[i + 1] {
            IAC => {
                // Escaped data byte.
                clean.push(IAC);
                i += 2;
            }
            SB => {
                // Skip the whole subnegotiation through IAC SE.
                let mut j = i + 2;
                let mut end = None;
                while j + 1 < raw.len() {
                    if raw[j] == IAC && raw[j + 1] == SE {
                        end = Some(j + 2);
                        break;
                    }
                    j += 1;
                }
                match end {
                    Some(e) => i = e,
                    None => break,
                }
            }
            cmd @ (DO | DONT) => {
                if i + 2 >= raw.len() {
                    break;
                }
                let opt = raw[i + 2];
                if cmd == DO && opt == NAWS {
                    replies.extend_from_slice(&naws_offer());
                } else {
                    replies.extend_from_slice(&[IAC, WONT, opt]);
                }
                i += 3;
            }
            WILL | WONT => {
                if i + 2 >= raw.len() {
                    break;
                }
                replies.extend_from_slice(&[IAC, DONT, raw[i + 2]]);
                i += 3;
            }
            _ => {
                // Two-byte commands (NOP, GA, ...), dropped.
                i += 2;
            }
        }
    }
    Scrubbed {
        clean,
        tail: raw[i..].to_vec(),
        replies,
    }
}

/// First index of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
