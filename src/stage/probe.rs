//! Port discovery and identity verification.
//!
//! Connecting blind to a guessed port is how stages get crashed by
//! firmware meant for something else, so every candidate port is
//! interrogated with `M115` and accepted only when the reported firmware
//! family and machine name match the configuration. When several boards
//! match and the configured UUID cannot single one out, probing fails
//! with `AmbiguousDevice` rather than guessing.

use std::time::Duration;

use crate::config::ProbeSettings;
use crate::error::{StageError, StageResult};
use crate::transport::Transport;

use super::protocol::{self, AckLine};
use super::BoardIdentity;

/// One responsive board found during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeHit {
    pub port: String,
    pub baud: u32,
    pub identity: BoardIdentity,
}

/// Interrogate an opened transport with `M115`.
///
/// Returns `Ok(None)` when whatever is on the other end stays silent or
/// answers without a firmware-name token; only transport-level failures
/// are errors.
pub async fn identify(
    transport: &mut dyn Transport,
    read_timeout: Duration,
) -> StageResult<Option<BoardIdentity>> {
    transport.drain().await?;
    transport.write_line(protocol::CMD_IDENTIFY).await?;

    let mut payload = String::new();
    loop {
        match transport.read_line(read_timeout).await {
            Ok(line) => match protocol::classify(&line) {
                AckLine::Ok | AckLine::Error(_) => break,
                AckLine::Busy => continue,
                AckLine::Data => {
                    payload.push_str(&line);
                    payload.push('\n');
                }
            },
            // silence just means "not a compatible board"
            Err(StageError::Timeout(_)) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(protocol::parse_identity(&payload))
}

/// Pick the one board to connect to.
///
/// Candidates must match the firmware family and the required machine
/// name. A configured UUID then disambiguates; with no UUID match and
/// more than one candidate left, selection fails closed with
/// [`StageError::AmbiguousDevice`] instead of picking arbitrarily.
pub fn select<'a>(hits: &'a [ProbeHit], settings: &ProbeSettings) -> StageResult<&'a ProbeHit> {
    let candidates: Vec<&ProbeHit> = hits
        .iter()
        .filter(|h| h.identity.is_family(&settings.firmware_family))
        .filter(|h| h.identity.machine_name.as_deref() == Some(settings.machine_name.as_str()))
        .collect();

    if candidates.is_empty() {
        return Err(StageError::NoDeviceFound);
    }

    if let Some(uuid) = &settings.machine_uuid {
        let matched: Vec<&ProbeHit> = candidates
            .iter()
            .copied()
            .filter(|h| {
                h.identity
                    .machine_uuid
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(uuid))
            })
            .collect();
        match matched.len() {
            1 => return Ok(matched[0]),
            0 => {}
            _ => {
                return Err(StageError::AmbiguousDevice(
                    matched.iter().map(|h| h.port.clone()).collect(),
                ))
            }
        }
    }

    if candidates.len() == 1 {
        Ok(candidates[0])
    } else {
        Err(StageError::AmbiguousDevice(
            candidates.iter().map(|h| h.port.clone()).collect(),
        ))
    }
}

#[cfg(feature = "serial")]
pub use self::serial::{probe_and_connect, scan_ports};

#[cfg(feature = "serial")]
mod serial {
    use log::{debug, info};
    use serialport::{SerialPortInfo, SerialPortType};

    use crate::config::TimeoutSettings;
    use crate::events::{Event, EventBus};
    use crate::stage::{ConnectionState, StageDriver};
    use crate::transport::SerialTransport;

    use super::*;

    // The controller ships with a CH340 USB-serial bridge.
    const CH340_VID: u16 = 0x1A86;
    const CH340_PID: u16 = 0x7523;

    fn port_score(info: &SerialPortInfo) -> i32 {
        let mut score = 0;
        if let SerialPortType::UsbPort(usb) = &info.port_type {
            score += 10;
            if usb.vid == CH340_VID && usb.pid == CH340_PID {
                score += 100;
            }
        }
        // COM1 is almost always a legacy motherboard UART, try it last
        if info.port_name.eq_ignore_ascii_case("COM1") {
            score -= 1000;
        }
        score
    }

    fn candidate_ports(settings: &ProbeSettings) -> Vec<String> {
        if !settings.ports.is_empty() {
            return settings.ports.clone();
        }
        let mut infos = serialport::available_ports().unwrap_or_default();
        infos.sort_by_key(|p| std::cmp::Reverse(port_score(p)));
        infos.into_iter().map(|p| p.port_name).collect()
    }

    /// Open each candidate port at each configured baud and collect the
    /// boards that identify themselves. Per-port failures are logged and
    /// skipped; an unplugged hub must not abort the whole scan.
    pub async fn scan_ports(settings: &ProbeSettings) -> Vec<ProbeHit> {
        let mut hits = Vec::new();
        for port in candidate_ports(settings) {
            for &baud in &settings.bauds {
                let mut transport = match SerialTransport::open(&port, baud, settings.settle).await
                {
                    Ok(t) => t,
                    Err(e) => {
                        debug!("skipping {port}: {e}");
                        break;
                    }
                };
                match identify(&mut transport, settings.read_timeout).await {
                    Ok(Some(identity)) => {
                        info!("{port} @ {baud}: {}", identity.firmware_name);
                        hits.push(ProbeHit {
                            port: port.clone(),
                            baud,
                            identity,
                        });
                        break;
                    }
                    Ok(None) => debug!("{port} @ {baud}: no identification"),
                    Err(e) => {
                        debug!("{port} @ {baud}: {e}");
                        break;
                    }
                }
            }
        }
        hits
    }

    /// Scan, select and connect in one step.
    pub async fn probe_and_connect(
        settings: &ProbeSettings,
        timeouts: TimeoutSettings,
        events: EventBus,
    ) -> StageResult<StageDriver> {
        events.emit(Event::ConnectionChanged {
            state: ConnectionState::Probing,
        });
        let hits = scan_ports(settings).await;
        let chosen = select(&hits, settings)?.clone();
        info!(
            "selected {} @ {} ({})",
            chosen.port, chosen.baud, chosen.identity.firmware_name
        );
        // identification closed the port; reopen it for the session
        let transport = SerialTransport::open(&chosen.port, chosen.baud, settings.settle).await?;
        StageDriver::connect(Box::new(transport), chosen.identity, timeouts, events).await
    }
}
