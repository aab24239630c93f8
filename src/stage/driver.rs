//! StageDriver: the motion-controller protocol state machine.
//!
//! The driver translates motion intents into protocol commands and
//! enforces the acknowledgement discipline: exactly one command is
//! outstanding at any time (the transport sits behind a mutex), and
//! exactly one long-running *operation* — ad-hoc jog, autofocus or scan —
//! may own the stage at any time (a single-permit semaphore guards the
//! slot; [`StageDriver::try_begin`] hands out a [`StageOperation`] or
//! fails with `Busy`).
//!
//! Failure latching: a read timeout poisons the connection (`Error`
//! state; the silent controller's queue state is unknown) and fails all
//! subsequent calls; a transport-level I/O error latches `Disconnected`
//! and requires re-probing. Motion commands are never retried here —
//! silently re-issuing a move is unsafe, the caller decides whether to
//! re-home.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::TimeoutSettings;
use crate::error::{StageError, StageResult};
use crate::events::{Event, EventBus};
use crate::transport::Transport;

use super::protocol::{self, AckLine};
use super::{BoardIdentity, ConnectionState, MotionCommand, Position, StageBounds};

/// Cloneable handle to one controller connection.
#[derive(Clone)]
pub struct StageDriver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    transport: Mutex<Box<dyn Transport>>,
    identity: BoardIdentity,
    timeouts: TimeoutSettings,
    state: StdMutex<ConnectionState>,
    /// First fatal error; once set, every further call fails with it.
    fault: StdMutex<Option<StageError>>,
    op_slot: Arc<Semaphore>,
    active_op: StdMutex<Option<&'static str>>,
    events: EventBus,
}

impl StageDriver {
    /// Take ownership of an opened, settled transport and run the
    /// connection handshake: reset line numbers, force absolute mode.
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        identity: BoardIdentity,
        timeouts: TimeoutSettings,
        events: EventBus,
    ) -> StageResult<Self> {
        transport.drain().await?;
        let driver = Self {
            inner: Arc::new(DriverInner {
                transport: Mutex::new(transport),
                identity,
                timeouts,
                state: StdMutex::new(ConnectionState::Connected),
                fault: StdMutex::new(None),
                op_slot: Arc::new(Semaphore::new(1)),
                active_op: StdMutex::new(None),
                events,
            }),
        };

        let cmd_timeout = driver.inner.timeouts.command;
        driver
            .inner
            .command(protocol::CMD_RESET_LINE_NUMBERS, cmd_timeout)
            .await?;
        driver
            .inner
            .command(protocol::CMD_ABSOLUTE_MODE, cmd_timeout)
            .await?;

        driver.inner.emit_state(ConnectionState::Connected);
        info!(
            "stage connected: {} ({})",
            driver.inner.identity.firmware_name,
            driver
                .inner
                .identity
                .machine_name
                .as_deref()
                .unwrap_or("unnamed")
        );
        Ok(driver)
    }

    pub fn identity(&self) -> &BoardIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Claim exclusive use of the stage for a long-running operation.
    ///
    /// Fails with [`StageError::Busy`] while another operation is active.
    /// Dropping the returned handle releases the stage.
    pub fn try_begin(&self, label: &'static str) -> StageResult<StageOperation> {
        self.inner.check_usable()?;
        let permit = self
            .inner
            .op_slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| {
                let holder = self
                    .inner
                    .active_op
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .unwrap_or("operation");
                StageError::Busy(holder.to_string())
            })?;
        *self
            .inner
            .active_op
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(label);
        self.inner.set_state(ConnectionState::Busy);
        Ok(StageOperation {
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    /// One-shot relative move; claims and releases the stage around it.
    pub async fn jog(&self, dx: f64, dy: f64, dz: f64, feed_mm_s: f64) -> StageResult<()> {
        self.try_begin("jog")?.jog(dx, dy, dz, feed_mm_s).await
    }

    /// One-shot home; claims and releases the stage around it.
    pub async fn home(&self) -> StageResult<()> {
        self.try_begin("home")?.home().await
    }

    /// One-shot motion sync; claims and releases the stage around it.
    pub async fn wait_idle(&self) -> StageResult<()> {
        self.try_begin("wait")?.wait_idle().await
    }

    /// Query the current position; claims and releases the stage around it.
    pub async fn position(&self) -> StageResult<Position> {
        self.try_begin("query")?.position().await
    }

    /// Mark the connection closed. Subsequent calls fail with
    /// `NotConnected`; the port itself closes when the driver drops.
    pub fn disconnect(&self) {
        *self.inner.fault.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(StageError::NotConnected);
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

/// Exclusive stage ownership for the duration of one operation.
///
/// All motion primitives live here; holding the handle *is* the proof
/// that no other operation can interleave commands.
pub struct StageOperation {
    inner: Arc<DriverInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for StageOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageOperation").finish_non_exhaustive()
    }
}

impl StageOperation {
    /// Execute one motion intent.
    pub async fn execute(&self, cmd: MotionCommand) -> StageResult<()> {
        match cmd {
            MotionCommand::Jog {
                dx,
                dy,
                dz,
                feed_mm_s,
            } => self.jog(dx, dy, dz, feed_mm_s).await,
            MotionCommand::Home => self.home().await,
            MotionCommand::Wait => self.wait_idle().await,
        }
    }

    /// Relative move as one logical operation: switch to relative mode,
    /// move, switch back. The absolute-mode switch is issued even when
    /// the move itself fails — the controller must never be left in
    /// relative mode after a jog returns.
    pub async fn jog(&self, dx: f64, dy: f64, dz: f64, feed_mm_s: f64) -> StageResult<()> {
        if feed_mm_s <= 0.0 {
            return Err(StageError::InvalidParameter(format!(
                "feed must be positive, got {feed_mm_s} mm/s"
            )));
        }
        if dx == 0.0 && dy == 0.0 && dz == 0.0 {
            return Ok(());
        }

        let t = self.inner.timeouts.command;
        self.inner.command(protocol::CMD_RELATIVE_MODE, t).await?;
        let moved = self
            .inner
            .command(&protocol::format_move(dx, dy, dz, feed_mm_s), t)
            .await;
        let restored = self.inner.command(protocol::CMD_ABSOLUTE_MODE, t).await;
        if let Err(e) = &moved {
            warn!("jog failed ({e}); absolute mode restored: {}", restored.is_ok());
        }
        moved.and(restored).map(|_| ())
    }

    /// Home all axes, Z first so the objective clears the sample before
    /// XY travel. Uses the long homing budget.
    pub async fn home(&self) -> StageResult<()> {
        let t = self.inner.timeouts.home;
        self.inner.command(protocol::CMD_HOME_Z, t).await?;
        self.inner.command(protocol::CMD_HOME_XY, t).await?;
        Ok(())
    }

    /// Home only the focus axis.
    pub async fn home_z(&self) -> StageResult<()> {
        let t = self.inner.timeouts.home;
        self.inner.command(protocol::CMD_HOME_Z, t).await.map(|_| ())
    }

    /// Block until all queued motion has physically completed. Callers
    /// use this before any capture; the acknowledgement establishes the
    /// happens-before edge between motion and the next frame.
    pub async fn wait_idle(&self) -> StageResult<()> {
        let t = self.inner.timeouts.wait_idle;
        self.inner
            .command(protocol::CMD_WAIT_IDLE, t)
            .await
            .map(|_| ())
    }

    /// Query the current machine position.
    pub async fn position(&self) -> StageResult<Position> {
        let payload = self
            .inner
            .command(protocol::CMD_POSITION, self.inner.timeouts.command)
            .await?;
        let text = payload.join("\n");
        protocol::parse_position(&text)
            .ok_or_else(|| StageError::Protocol(format!("unparseable position report: {text:?}")))
    }

    /// Query firmware soft endstop bounds.
    pub async fn bounds(&self) -> StageResult<StageBounds> {
        let payload = self
            .inner
            .command(protocol::CMD_BOUNDS, self.inner.timeouts.command)
            .await?;
        Ok(protocol::parse_bounds(&payload.join("\n")))
    }
}

impl Drop for StageOperation {
    fn drop(&mut self) {
        *self
            .inner
            .active_op
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        // Only restore Connected if no fault latched a terminal state.
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ConnectionState::Busy {
            *state = ConnectionState::Connected;
            drop(state);
            self.inner.events.emit(Event::ConnectionChanged {
                state: ConnectionState::Connected,
            });
        }
    }
}

impl DriverInner {
    fn check_usable(&self) -> StageResult<()> {
        if let Some(fault) = &*self.fault.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(fault.clone());
        }
        Ok(())
    }

    fn set_state(&self, new: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != new {
            *state = new;
            drop(state);
            self.emit_state(new);
        }
    }

    fn emit_state(&self, state: ConnectionState) {
        self.events.emit(Event::ConnectionChanged { state });
    }

    fn latch(&self, error: StageError, state: ConnectionState) {
        let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        if fault.is_none() {
            *fault = Some(error);
        }
        drop(fault);
        self.set_state(state);
    }

    /// Send one command and block until its acknowledgement.
    ///
    /// Returns the payload lines read before the `ok`. An `error` line
    /// becomes `Motion` (the link stays healthy); silence becomes
    /// `Timeout` and poisons the connection; an I/O failure becomes
    /// `Transport` and requires re-probing.
    async fn command(&self, cmd: &str, timeout: Duration) -> StageResult<Vec<String>> {
        self.check_usable()?;
        let mut transport = self.transport.lock().await;

        if let Err(e) = transport.write_line(cmd).await {
            self.latch(e.clone(), ConnectionState::Disconnected);
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let mut payload = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let err = StageError::Timeout(format!("no response to {cmd} within {timeout:?}"));
                self.latch(err.clone(), ConnectionState::Error);
                return Err(err);
            }
            match transport.read_line(remaining).await {
                Ok(line) => match protocol::classify(&line) {
                    AckLine::Ok => return Ok(payload),
                    AckLine::Error(msg) => return Err(StageError::Motion(msg)),
                    AckLine::Busy => continue,
                    AckLine::Data => payload.push(line),
                },
                Err(StageError::Timeout(_)) => {
                    let err =
                        StageError::Timeout(format!("no response to {cmd} within {timeout:?}"));
                    self.latch(err.clone(), ConnectionState::Error);
                    return Err(err);
                }
                Err(e) => {
                    self.latch(e.clone(), ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutSettings;
    use crate::mock::SimStage;

    fn short_timeouts() -> TimeoutSettings {
        TimeoutSettings {
            command: Duration::from_millis(200),
            home: Duration::from_millis(500),
            wait_idle: Duration::from_millis(500),
        }
    }

    async fn connect(sim: SimStage) -> StageDriver {
        let identity = sim.identity();
        StageDriver::connect(Box::new(sim), identity, short_timeouts(), EventBus::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn jog_converts_feed_to_mm_per_min() {
        let sim = SimStage::new();
        let transcript = sim.transcript();
        let driver = connect(sim).await;

        driver.jog(0.5, 0.0, 0.0, 10.0).await.unwrap();

        let sent = transcript.lock().unwrap().clone();
        assert!(sent.iter().any(|l| l == "G1 X0.5000 F600.00"), "{sent:?}");
    }

    #[tokio::test]
    async fn jog_wraps_move_in_mode_switches() {
        let sim = SimStage::new();
        let transcript = sim.transcript();
        let driver = connect(sim).await;

        driver.jog(0.0, 0.0, -0.01, 4.0).await.unwrap();

        let sent = transcript.lock().unwrap().clone();
        let g91 = sent.iter().position(|l| l == "G91").unwrap();
        let mv = sent.iter().position(|l| l.starts_with("G1 Z")).unwrap();
        let g90 = sent.iter().rposition(|l| l == "G90").unwrap();
        assert!(g91 < mv && mv < g90, "{sent:?}");
    }

    #[tokio::test]
    async fn jog_restores_absolute_mode_when_move_fails() {
        let sim = SimStage::new();
        sim.fail_command("G1", "Printer halted");
        let transcript = sim.transcript();
        let driver = connect(sim).await;

        let err = driver.jog(1.0, 0.0, 0.0, 5.0).await.unwrap_err();
        assert!(matches!(err, StageError::Motion(_)));

        let sent = transcript.lock().unwrap().clone();
        let mv = sent.iter().position(|l| l.starts_with("G1 ")).unwrap();
        let g90_after = sent.iter().skip(mv).any(|l| l == "G90");
        assert!(g90_after, "absolute mode not restored: {sent:?}");
        // link stays healthy after an acknowledged failure
        assert_eq!(driver.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn zero_jog_sends_nothing() {
        let sim = SimStage::new();
        let transcript = sim.transcript();
        let driver = connect(sim).await;
        let before = transcript.lock().unwrap().len();

        driver.jog(0.0, 0.0, 0.0, 5.0).await.unwrap();
        assert_eq!(transcript.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn timeout_poisons_connection_and_queued_calls() {
        let sim = SimStage::new();
        sim.silence_command("M400");
        let driver = connect(sim).await;

        let err = driver.wait_idle().await.unwrap_err();
        assert!(matches!(err, StageError::Timeout(_)));
        assert_eq!(driver.state(), ConnectionState::Error);

        // every further call fails fast with the latched fault
        let err = driver.jog(1.0, 0.0, 0.0, 5.0).await.unwrap_err();
        assert!(matches!(err, StageError::Timeout(_)));
    }

    #[tokio::test]
    async fn second_operation_fails_with_busy() {
        let sim = SimStage::new();
        let driver = connect(sim).await;

        let op = driver.try_begin("scan").unwrap();
        let err = driver.try_begin("autofocus").unwrap_err();
        assert_eq!(err, StageError::Busy("scan".to_string()));
        assert_eq!(driver.state(), ConnectionState::Busy);

        drop(op);
        assert_eq!(driver.state(), ConnectionState::Connected);
        driver.try_begin("autofocus").unwrap();
    }

    #[tokio::test]
    async fn position_parses_m114_report() {
        let sim = SimStage::new();
        sim.set_position(Position::new(1.5, -2.25, 0.1));
        let driver = connect(sim).await;

        let pos = driver.position().await.unwrap();
        assert_eq!(pos, Position::new(1.5, -2.25, 0.1));
    }

    #[tokio::test]
    async fn home_sends_z_before_xy() {
        let sim = SimStage::new();
        let transcript = sim.transcript();
        let driver = connect(sim).await;

        driver.home().await.unwrap();
        let sent = transcript.lock().unwrap().clone();
        let z = sent.iter().position(|l| l == "G28 Z").unwrap();
        let xy = sent.iter().position(|l| l == "G28 X Y").unwrap();
        assert!(z < xy);
    }

    #[tokio::test]
    async fn busy_keepalives_are_not_acks() {
        let sim = SimStage::new();
        sim.keepalives_before_ok("G28 Z", 3);
        let driver = connect(sim).await;
        driver.try_begin("home").unwrap().home_z().await.unwrap();
    }
}
