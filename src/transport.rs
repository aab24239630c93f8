//! Byte-stream connection abstraction over a serial-like channel.
//!
//! The driver only ever sees line-oriented text: it writes one command
//! line and reads acknowledgement lines with a deadline. Opening a port
//! auto-resets most controller boards, so connection setup must wait a
//! settle delay and drain the boot chatter before the first command —
//! [`SerialTransport::open`] does both.

use std::time::Duration;

use async_trait::async_trait;

#[cfg(feature = "serial")]
use crate::error::StageError;
use crate::error::StageResult;

/// Line-oriented transport seam between the driver and the wire.
#[async_trait]
pub trait Transport: Send {
    /// Write one command line; the terminator is appended here.
    async fn write_line(&mut self, line: &str) -> StageResult<()>;

    /// Read one response line (terminator stripped), failing with
    /// [`StageError::Timeout`] when the deadline passes in silence.
    async fn read_line(&mut self, timeout: Duration) -> StageResult<String>;

    /// Discard any buffered input (boot banners, stale acks).
    async fn drain(&mut self) -> StageResult<()>;

    /// Human-readable endpoint description for logs ("port@baud").
    fn describe(&self) -> String;
}

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use super::*;

    use log::debug;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{SerialPortBuilderExt, SerialStream};

    /// Serial implementation of [`Transport`] on top of tokio-serial.
    pub struct SerialTransport {
        port: SerialStream,
        port_name: String,
        baud: u32,
        /// Bytes received but not yet returned as a complete line.
        pending: Vec<u8>,
    }

    impl SerialTransport {
        /// Open `port_name`, wait out the board's auto-reset, drain chatter.
        pub async fn open(port_name: &str, baud: u32, settle: Duration) -> StageResult<Self> {
            let port = tokio_serial::new(port_name, baud)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| {
                    StageError::Transport(format!("failed to open {port_name}@{baud}: {e}"))
                })?;

            debug!("opened {port_name} @ {baud}, settling {settle:?}");
            let mut transport = Self {
                port,
                port_name: port_name.to_string(),
                baud,
                pending: Vec::new(),
            };
            tokio::time::sleep(settle).await;
            transport.drain().await?;
            Ok(transport)
        }

        /// Pop a complete line out of the pending buffer, if one is there.
        fn take_line(&mut self) -> Option<String> {
            let nl = self.pending.iter().position(|&b| b == b'\n')?;
            let mut raw: Vec<u8> = self.pending.drain(..=nl).collect();
            raw.pop(); // '\n'
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            Some(String::from_utf8_lossy(&raw).into_owned())
        }
    }

    #[async_trait]
    impl Transport for SerialTransport {
        async fn write_line(&mut self, line: &str) -> StageResult<()> {
            let framed = format!("{}\n", line.trim());
            self.port
                .write_all(framed.as_bytes())
                .await
                .map_err(|e| StageError::Transport(format!("write failed: {e}")))?;
            self.port
                .flush()
                .await
                .map_err(|e| StageError::Transport(format!("flush failed: {e}")))?;
            debug!("TX >> {}", line.trim());
            Ok(())
        }

        async fn read_line(&mut self, timeout: Duration) -> StageResult<String> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(line) = self.take_line() {
                    debug!("RX << {line}");
                    return Ok(line);
                }

                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(StageError::Timeout(format!(
                        "no line from {} within {:?}",
                        self.describe(),
                        timeout
                    )));
                }

                let mut buf = [0u8; 256];
                match tokio::time::timeout(remaining, self.port.read(&mut buf)).await {
                    Ok(Ok(0)) => {
                        return Err(StageError::Transport("unexpected EOF from serial port".into()))
                    }
                    Ok(Ok(n)) => self.pending.extend_from_slice(&buf[..n]),
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Ok(Err(e)) => return Err(StageError::Transport(format!("read failed: {e}"))),
                    Err(_) => {
                        return Err(StageError::Timeout(format!(
                            "no line from {} within {:?}",
                            self.describe(),
                            timeout
                        )))
                    }
                }
            }
        }

        async fn drain(&mut self) -> StageResult<()> {
            self.pending.clear();
            let mut buf = [0u8; 512];
            let mut discarded = 0usize;
            // Keep reading short windows until the line goes quiet.
            while let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(50), self.port.read(&mut buf)).await
            {
                if n == 0 {
                    break;
                }
                discarded += n;
            }
            if discarded > 0 {
                debug!("drained {discarded}B from {}", self.describe());
            }
            Ok(())
        }

        fn describe(&self) -> String {
            format!("{}@{}", self.port_name, self.baud)
        }
    }
}
