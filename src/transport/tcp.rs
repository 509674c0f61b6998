//! TCP client for an instrument server.
//!
//! Every command opens its own connection: the request line is written with a
//! `\r\n` terminator and the reply is read up to the first newline (or until the
//! server closes the connection), capped at `buffer_size` bytes. The whole
//! exchange is bounded by the configured timeout.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::TcpSettings;
use crate::error::{ScanError, ScanResult};
use crate::grid::InstrumentGrid;
use crate::transport::protocol::rejection;
use crate::transport::{InstrumentInfo, Transport};

const LINE_TERMINATOR: &str = "\r\n";

/// Instrument reached over TCP.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
    buffer_size: usize,
    timeout: Duration,
}

impl TcpTransport {
    /// Client for the endpoint in `settings`. Nothing is connected until the first request.
    pub fn new(settings: &TcpSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            buffer_size: settings.buffer_size,
            timeout: settings.timeout,
        }
    }

    /// `host:port` of the instrument.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Send one command and return the trimmed reply.
    pub async fn request(&self, command: &str) -> ScanResult<String> {
        let address = self.address();
        let exchange = async {
            let mut stream = TcpStream::connect(&address).await?;
            stream
                .write_all(format!("{command}{LINE_TERMINATOR}").as_bytes())
                .await?;
            stream.flush().await?;
            trace!(%command, %address, "Sent command");

            let mut reader = BufReader::new(stream).take(self.buffer_size as u64);
            let mut reply = Vec::new();
            reader.read_until(b'\n', &mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };

        let reply = timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ScanError::Transport(format!(
                    "'{command}' to {address} timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| ScanError::Transport(format!("'{command}' to {address} failed: {e}")))?;

        let reply = String::from_utf8_lossy(&reply).trim().to_string();
        debug!(%command, reply_len = reply.len(), "Received reply");
        Ok(reply)
    }

    async fn command(&self, command: &str) -> ScanResult<String> {
        let reply = self.request(command).await?;
        match rejection(&reply) {
            Some(message) => Err(ScanError::TransportRejected(format!("{command}: {message}"))),
            None => Ok(reply),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> ScanResult<()> {
        match self.command("START").await {
            Err(ScanError::Transport(msg)) => Err(ScanError::TransportConnect(msg)),
            other => other.map(|_| ()),
        }
    }

    async fn end(&self) -> ScanResult<()> {
        self.command("END").await.map(|_| ())
    }

    async fn status(&self) -> ScanResult<String> {
        self.request("STATUS").await
    }

    async fn connect(&self) -> ScanResult<InstrumentInfo> {
        let axes = parse_axes(&self.command("AXES").await?)?;
        let measurement_shape = parse_shape(&self.command("SPECTRUM_SHAPE").await?)?;
        let filename = parse_filename(&self.command("FILENAME").await?)?;
        Ok(InstrumentInfo {
            grid: InstrumentGrid::new(axes)?,
            filename,
            measurement_shape,
        })
    }

    async fn add_point(&self, position: &[f64]) -> ScanResult<()> {
        let coords: Vec<String> = position.iter().map(f64::to_string).collect();
        self.command(&format!("ADD_POINT {}", coords.join(" ")))
            .await
            .map(|_| ())
    }

    async fn measure(&self) -> ScanResult<String> {
        self.request("MEASURE").await
    }
}

fn expect_tag<'a>(reply: &'a str, tag: &str) -> ScanResult<Vec<&'a str>> {
    let mut tokens = reply.split_whitespace();
    match tokens.next() {
        Some(t) if t == tag => Ok(tokens.collect()),
        _ => Err(ScanError::Protocol(format!("expected '{tag}' reply, got '{reply}'"))),
    }
}

fn parse_number<T: std::str::FromStr>(token: &str, what: &str) -> ScanResult<T> {
    token
        .parse()
        .map_err(|_| ScanError::Protocol(format!("invalid {what} '{token}'")))
}

/// `AXES <n> (<start> <stop> <step>)..`
fn parse_axes(reply: &str) -> ScanResult<Vec<Vec<f64>>> {
    let tokens = expect_tag(reply, "AXES")?;
    let (count, ranges) = tokens
        .split_first()
        .ok_or_else(|| ScanError::TransportConnect("instrument reported no axes".to_string()))?;
    let n: usize = parse_number(count, "axis count")?;
    if ranges.len() != 3 * n {
        return Err(ScanError::Protocol(format!(
            "expected {} axis range values, got {}",
            3 * n,
            ranges.len()
        )));
    }
    ranges
        .chunks(3)
        .map(|range| {
            let start: f64 = parse_number(range[0], "axis start")?;
            let stop: f64 = parse_number(range[1], "axis stop")?;
            let step: f64 = parse_number(range[2], "axis step")?;
            InstrumentGrid::axis_from_range(start, stop, step)
        })
        .collect()
}

/// `SPECTRUM_SHAPE <rank> <d1> .. <dr>`
fn parse_shape(reply: &str) -> ScanResult<Vec<usize>> {
    let tokens = expect_tag(reply, "SPECTRUM_SHAPE")?;
    let (rank, dims) = tokens
        .split_first()
        .ok_or_else(|| ScanError::Protocol("missing measurement rank".to_string()))?;
    let rank: usize = parse_number(rank, "measurement rank")?;
    if dims.len() != rank {
        return Err(ScanError::Protocol(format!(
            "measurement rank {rank} but {} dimensions",
            dims.len()
        )));
    }
    dims.iter().map(|d| parse_number(d, "dimension")).collect()
}

/// `FILENAME <path>`; the path may contain spaces.
fn parse_filename(reply: &str) -> ScanResult<PathBuf> {
    let path = reply
        .trim()
        .strip_prefix("FILENAME")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ScanError::Protocol(format!("expected 'FILENAME <path>', got '{reply}'")))?;
    Ok(PathBuf::from(path))
}
