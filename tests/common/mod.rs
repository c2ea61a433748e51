//! In-process mock drive speaking the command console protocol.
//!
//! Accepts any number of connections; each received command line is logged
//! and answered from the configured reply table. Unknown commands behave
//! like parameter sets: they echo nothing beyond the terminator.

// Each test binary uses a different subset of this helper.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use servo_fleet::{DriveEndpoint, ProtocolTimeouts};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone)]
pub enum MockReply {
    /// Answer with `<payload>\r\n-->`.
    Payload(String),
    /// Answer with the device error marker.
    Error(String),
    /// Answer nothing at all.
    Silent,
    /// Pop answers in order; the last one repeats forever.
    Sequence(VecDeque<String>),
}

type ReplyTable = Arc<Mutex<HashMap<String, MockReply>>>;

pub struct MockDrive {
    pub addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
    replies: ReplyTable,
}

impl MockDrive {
    /// Start a mock drive that reports `name` for `drv.name`.
    pub async fn start(name: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let commands: Arc<Mutex<Vec<String>>> = Arc::default();
        let replies: ReplyTable = Arc::default();
        replies
            .lock()
            .unwrap()
            .insert("drv.name".to_string(), MockReply::Payload(name.to_string()));

        let accept_commands = Arc::clone(&commands);
        let accept_replies = Arc::clone(&replies);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let commands = Arc::clone(&accept_commands);
                let replies = Arc::clone(&accept_replies);
                tokio::spawn(serve(stream, commands, replies));
            }
        });

        Self {
            addr,
            commands,
            replies,
        }
    }

    pub fn endpoint(&self) -> DriveEndpoint {
        DriveEndpoint::new("", self.addr.ip().to_string()).with_port(self.addr.port())
    }

    /// Short timeouts so failure-path tests stay fast.
    pub fn timeouts() -> ProtocolTimeouts {
        ProtocolTimeouts {
            connect_ms: 1_000,
            command_ms: 500,
            factory_reset_ms: 1_000,
            flash_ms: 1_000,
        }
    }

    pub fn set_reply(&self, cmd: &str, reply: MockReply) {
        self.replies
            .lock()
            .unwrap()
            .insert(cmd.to_string(), reply);
    }

    /// Every command line received so far, across all connections.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

async fn serve(
    mut stream: TcpStream,
    commands: Arc<Mutex<Vec<String>>>,
    replies: ReplyTable,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&strip_telnet(&chunk[..n]));

        while let Some(pos) = find(&buf, b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).to_string();
            buf.drain(..pos + 2);
            commands.lock().unwrap().push(line.clone());

            let reply = {
                let mut table = replies.lock().unwrap();
                match table.get_mut(&line) {
                    None => MockReply::Payload(String::new()),
                    Some(MockReply::Sequence(seq)) => {
                        let payload = if seq.len() > 1 {
                            seq.pop_front().unwrap_or_default()
                        } else {
                            seq.front().cloned().unwrap_or_default()
                        };
                        MockReply::Payload(payload)
                    }
                    Some(other) => other.clone(),
                }
            };

            let out = match reply {
                MockReply::Payload(payload) => format!("{}\r\n-->", payload),
                MockReply::Error(message) => format!("Error: {}\r\n-->", message),
                MockReply::Silent => continue,
                MockReply::Sequence(_) => unreachable!("sequences are resolved above"),
            };
            if stream.write_all(out.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Drop telnet negotiation bytes the client sends on connect.
fn strip_telnet(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != 255 {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        // IAC SB ... IAC SE, or IAC <cmd> <opt>
        if raw.get(i + 1) == Some(&250) {
            let mut j = i + 2;
            while j + 1 < raw.len() && !(raw[j] == 255 && raw[j + 1] == 240) {
                j += 1;
            }
            i = j + 2;
        } else {
            i += 3;
        }
    }
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
