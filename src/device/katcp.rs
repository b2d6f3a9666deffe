//! KATCP over TCP client for ROACH2 boards.
//!
//! KATCP is a line protocol: a request `?name arg ...` is answered by any number of
//! `#inform` lines followed by `!name ok ...` or `!name fail ...`. Binary arguments are
//! escaped so a message always stays on one line.

use super::snapshot::{Snapshot, SnapshotLayout};
use super::{FpgaProgrammer, RegisterInterface};
use crate::config::RegisterMap;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default KATCP port on a ROACH2.
pub const DEFAULT_PORT: u16 = 7147;

/// Multiple of the I/O timeout granted to `?progdev`.
const PROGRAM_TIMEOUT_FACTOR: u32 = 12;

/// Snapshot status register bit that flags a completed capture.
const SNAPSHOT_DONE: u32 = 1 << 31;

/// Async KATCP client holding one TCP connection.
pub struct KatcpClient {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
    poll_interval: Duration,
    layouts: HashMap<String, SnapshotLayout>,
    peer: String,
}

impl KatcpClient {
    /// Connect to `host:port`, failing after `io_timeout`.
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;

        stream.set_nodelay(true)?;

        tracing::info!(host, port, "Connected to KATCP server");

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: io_timeout,
            poll_interval: Duration::from_millis(1),
            layouts: HashMap::new(),
            peer: format!("{}:{}", host, port),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Register how words of snapshot `name` decode.
    pub fn with_snapshot_layout(mut self, name: impl Into<String>, layout: SnapshotLayout) -> Self {
        self.layouts.insert(name.into(), layout);
        self
    }

    /// Register the ADC calibration, IQ and phase snapshot layouts named in `registers`.
    pub fn with_default_layouts(mut self, registers: &RegisterMap) -> Self {
        for (i, name) in registers.adc_snapshots.iter().enumerate() {
            self.layouts.insert(name.clone(), SnapshotLayout::adc(i));
        }
        for name in &registers.iq_snapshots {
            self.layouts.insert(name.clone(), SnapshotLayout::iq());
        }
        self.layouts
            .insert(registers.phase_snapshot.clone(), SnapshotLayout::phase());
        self
    }

    /// Send a request and return the arguments of its `ok` reply.
    pub async fn request(&self, name: &str, args: &[&[u8]], wait: Duration) -> Result<Vec<Vec<u8>>> {
        let reply = self.exchange(name, args, wait).await?;
        reply_args(name, reply)
    }

    /// Send a request and return every argument of its reply, status first.
    async fn exchange(&self, name: &str, args: &[&[u8]], wait: Duration) -> Result<Vec<Vec<u8>>> {
        let mut stream = self.stream.lock().await;

        let line = format_request(name, args);
        tracing::trace!(peer = %self.peer, request = name, bytes = line.len(), "KATCP request");

        stream
            .get_mut()
            .write_all(&line)
            .await
            .with_context(|| format!("Failed to send ?{}", name))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush stream")?;

        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut raw = Vec::new();
            match timeout(remaining, stream.read_until(b'\n', &mut raw)).await {
                Ok(Ok(0)) => bail!("Connection closed by {}", self.peer),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e).context("Failed to read reply"),
                Err(_) => bail!("Timeout waiting for reply to ?{}", name),
            }
            let message = parse_message(&raw)?;
            match message.kind {
                b'#' => {
                    tracing::trace!(inform = %String::from_utf8_lossy(&message.name), "KATCP inform");
                }
                b'!' if message.name == name.as_bytes() => return Ok(message.args),
                _ => {
                    tracing::debug!(
                        line = %String::from_utf8_lossy(&raw).trim_end(),
                        "Ignoring unexpected KATCP message"
                    );
                }
            }
        }
    }

    async fn call(&self, name: &str, args: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        self.request(name, args, self.timeout).await
    }
}

#[async_trait]
impl RegisterInterface for KatcpClient {
    async fn read_register(&self, name: &str) -> Result<u32> {
        let reply = self.call("wordread", &[name.as_bytes(), b"0"]).await?;
        let word = reply
            .first()
            .with_context(|| format!("Empty ?wordread reply for {}", name))?;
        parse_word(word).with_context(|| format!("Bad ?wordread reply for {}", name))
    }

    async fn write_register(&self, name: &str, value: u32, blocking: bool) -> Result<()> {
        let hex = format!("0x{:08x}", value);
        self.call("wordwrite", &[name.as_bytes(), b"0", hex.as_bytes()])
            .await?;
        if blocking {
            let readback = self.read_register(name).await?;
            if readback != value {
                bail!(
                    "Verification of write to {} failed: wrote {:#x}, read {:#x}",
                    name,
                    value,
                    readback
                );
            }
        }
        Ok(())
    }

    async fn blind_write(&self, name: &str, data: &[u8], offset: usize) -> Result<()> {
        let offset = offset.to_string();
        self.call("write", &[name.as_bytes(), offset.as_bytes(), data])
            .await
            .with_context(|| format!("Failed to write {} bytes to {}", data.len(), name))?;
        Ok(())
    }

    async fn read_memory(&self, name: &str, size: usize, offset: usize) -> Result<Vec<u8>> {
        let (offset, size_arg) = (offset.to_string(), size.to_string());
        let mut reply = self
            .call("read", &[name.as_bytes(), offset.as_bytes(), size_arg.as_bytes()])
            .await?;
        if reply.is_empty() {
            bail!("Empty ?read reply for {}", name);
        }
        let data = reply.swap_remove(0);
        if data.len() != size {
            bail!("Read {} bytes from {}, expected {}", data.len(), name, size);
        }
        Ok(data)
    }

    async fn arm_snapshot(&self, name: &str) -> Result<()> {
        let ctrl = format!("{name}_ctrl");
        self.write_register(&ctrl, 0, false).await?;
        self.write_register(&ctrl, 1, false).await
    }

    async fn read_snapshot(&self, name: &str) -> Result<Snapshot> {
        let layout = self
            .layouts
            .get(name)
            .with_context(|| format!("No field layout registered for snapshot {}", name))?;
        let status_reg = format!("{name}_status");
        let deadline = Instant::now() + self.timeout;
        let status = loop {
            let status = self.read_register(&status_reg).await?;
            if status & SNAPSHOT_DONE != 0 {
                break status;
            }
            if Instant::now() >= deadline {
                bail!("Snapshot {} did not complete within {:?}", name, self.timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        };
        let n_bytes = (status & !SNAPSHOT_DONE) as usize;
        let raw = self.read_memory(&format!("{name}_bram"), n_bytes, 0).await?;
        layout.decode(&raw)
    }
}

#[async_trait]
impl FpgaProgrammer for KatcpClient {
    async fn is_running(&self) -> Result<bool> {
        let reply = self.exchange("fpgastatus", &[], self.timeout).await?;
        Ok(reply.first().map(Vec::as_slice) == Some(b"ok".as_slice()))
    }

    async fn program(&self, bitstream: &str) -> Result<()> {
        tracing::info!(peer = %self.peer, bitstream, "Programming FPGA");
        self.request(
            "progdev",
            &[bitstream.as_bytes()],
            self.timeout * PROGRAM_TIMEOUT_FACTOR,
        )
        .await
        .with_context(|| format!("Failed to program {}", bitstream))?;
        Ok(())
    }
}

// =============================================================================
// Wire format
// =============================================================================

struct Message {
    kind: u8,
    name: Vec<u8>,
    args: Vec<Vec<u8>>,
}

/// Escape one argument for the wire.
pub fn escape(data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return b"\\@".to_vec();
    }
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' => out.extend_from_slice(b"\\_"),
            0 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x1b => out.extend_from_slice(b"\\e"),
            b'\t' => out.extend_from_slice(b"\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Undo [`escape`].
pub fn unescape(arg: &[u8]) -> Result<Vec<u8>> {
    if arg == b"\\@" {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(arg.len());
    let mut bytes = arg.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let decoded = match bytes.next() {
            Some(b'\\') => b'\\',
            Some(b'_') => b' ',
            Some(b'0') => 0,
            Some(b'n') => b'\n',
            Some(b'r') => b'\r',
            Some(b'e') => 0x1b,
            Some(b't') => b'\t',
            Some(other) => bail!("Invalid KATCP escape \\{}", *other as char),
            None => bail!("Dangling KATCP escape"),
        };
        out.push(decoded);
    }
    Ok(out)
}

fn format_request(name: &str, args: &[&[u8]]) -> Vec<u8> {
    let mut line = Vec::with_capacity(name.len() + 2 + args.iter().map(|a| a.len() + 1).sum::<usize>());
    line.push(b'?');
    line.extend_from_slice(name.as_bytes());
    for arg in args {
        line.push(b' ');
        line.extend_from_slice(&escape(arg));
    }
    line.push(b'\n');
    line
}

fn parse_message(raw: &[u8]) -> Result<Message> {
    let line = raw
        .strip_suffix(b"\n")
        .unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let mut parts = line
        .split(|b| *b == b' ' || *b == b'\t')
        .filter(|p| !p.is_empty());
    let head = parts.next().context("Empty KATCP message")?;
    let (&kind, name) = head.split_first().context("Empty KATCP message")?;
    if !matches!(kind, b'?' | b'!' | b'#') {
        bail!("Malformed KATCP message type {:?}", kind as char);
    }
    let args = parts.map(unescape).collect::<Result<Vec<_>>>()?;
    Ok(Message {
        kind,
        name: name.to_vec(),
        args,
    })
}

fn reply_args(name: &str, mut args: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
    if args.first().map(Vec::as_slice) == Some(b"ok".as_slice()) {
        args.remove(0);
        return Ok(args);
    }
    let detail = args
        .iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    bail!("?{} failed: {}", name, detail)
}

fn parse_word(word: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(word)?;
    let value = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => text.parse()?,
    };
    Ok(value)
}
