//! Verification probes
//!
//! A probe opens a short-lived connection at a candidate address, sends a
//! descriptor's verification question and returns the raw answer. The registry
//! bounds every probe with a timeout and checks the answer itself.
//!
//! Serial I/O runs on a blocking thread (`spawn_blocking`) so a slow port never
//! stalls the runtime. The port is owned by that closure and dropped when it
//! returns, which releases the temporary connection on every exit path. The
//! caller's `budget` bounds the whole exchange, so the blocking thread gives the
//! port back no later than the caller stops waiting for it.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use anyhow::{anyhow, Context};

/// Opens a temporary connection, asks `question` and returns the answer.
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    /// Query `address`, releasing the connection within `budget`.
    async fn query(&self, address: &str, question: &str, budget: Duration) -> Result<String>;
}

/// Serial port probe.
///
/// Writes the question followed by the line terminator and reads one line of at
/// most `max_response_len` bytes. The exchange ends at the shorter of the port
/// timeout and the caller's budget.
#[derive(Debug, Clone)]
pub struct SerialProbe {
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    response_delimiter: char,
    max_response_len: usize,
}

impl Default for SerialProbe {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            timeout: Duration::from_secs(10),
            line_terminator: "\r".to_string(),
            response_delimiter: '\n',
            max_response_len: 50,
        }
    }
}

impl SerialProbe {
    /// Probe at `baud_rate` with the default framing.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the port read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator appended to the question
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Set response line ending character
    pub fn with_response_delimiter(mut self, delimiter: char) -> Self {
        self.response_delimiter = delimiter;
        self
    }
}

#[async_trait]
impl ConnectionProbe for SerialProbe {
    #[cfg(feature = "instrument_serial")]
    async fn query(&self, address: &str, question: &str, budget: Duration) -> Result<String> {
        let address = address.to_string();
        let command = format!("{}{}", question, self.line_terminator);
        let probe = self.clone();
        let limit = probe.timeout.min(budget);

        tokio::task::spawn_blocking(move || {
            use std::io::{Read, Write};

            let deadline = std::time::Instant::now() + limit;
            let mut port = serialport::new(&address, probe.baud_rate)
                .timeout(limit)
                .open()
                .with_context(|| format!("Failed to open serial port {address}"))?;

            port.write_all(command.as_bytes())
                .context("Failed to write to serial port")?;
            port.flush().context("Failed to flush serial port")?;

            let mut response = String::new();
            let mut buffer = [0u8; 1];

            while response.len() < probe.max_response_len {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                if remaining.is_zero() {
                    return Err(anyhow!("Serial read timeout after {:?}", limit));
                }
                port.set_timeout(remaining)
                    .context("Failed to set serial port timeout")?;
                match port.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(_) => {
                        let ch = buffer[0] as char;
                        if ch == probe.response_delimiter {
                            break;
                        }
                        response.push(ch);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                    Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                }
            }

            tracing::debug!(port = %address, response = %response.trim(), "Serial probe answered");
            Ok(response.trim().to_string())
        })
        .await
        .context("Serial probe task panicked")?
    }

    #[cfg(not(feature = "instrument_serial"))]
    async fn query(&self, _address: &str, _question: &str, _budget: Duration) -> Result<String> {
        Err(crate::error::DaqError::SerialFeatureDisabled.into())
    }
}

/// Serial ports present on this host, as candidates for a port scan.
#[cfg(feature = "instrument_serial")]
pub fn available_serial_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to enumerate serial ports");
            Vec::new()
        }
    }
}

/// Without serial support there is nothing to scan.
#[cfg(not(feature = "instrument_serial"))]
pub fn available_serial_ports() -> Vec<String> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_probe_builder() {
        let probe = SerialProbe::new(19200)
            .with_timeout(Duration::from_millis(250))
            .with_line_terminator("\r\n")
            .with_response_delimiter('\r');

        assert_eq!(probe.baud_rate, 19200);
        assert_eq!(probe.timeout, Duration::from_millis(250));
        assert_eq!(probe.line_terminator, "\r\n");
        assert_eq!(probe.response_delimiter, '\r');
    }

    #[tokio::test]
    async fn missing_port_is_an_error() {
        let probe = SerialProbe::default();
        let result = probe
            .query("/dev/does-not-exist-42", "*IDN?", Duration::from_millis(50))
            .await;
        assert!(result.is_err());
    }
}
