//! Mock hardware for testing without a stage or camera attached.
//!
//! `SimStage` is an in-memory rendition of the controller firmware: it
//! speaks the same line protocol through the [`Transport`] seam, tracks
//! position and positioning mode, and supports fault injection (error
//! replies, silence, busy keep-alives). `MockCamera` produces synthetic
//! frames, optionally sharpness-linked to the simulated Z so the whole
//! focus loop can run end-to-end in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;

use crate::camera::{Frame, FrameSource};
use crate::error::{StageError, StageResult};
use crate::stage::{BoardIdentity, Position};
use crate::transport::Transport;

const SIM_FIRMWARE: &str = "Marlin 2.1.2-sim";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FaultMode {
    /// Reply with an `error:` line.
    Error,
    /// Reply with nothing at all.
    Silence,
}

struct FaultRule {
    prefix: String,
    mode: FaultMode,
    message: String,
}

struct SimShared {
    position: Position,
    relative: bool,
    homed: bool,
}

/// In-memory controller simulator implementing [`Transport`].
pub struct SimStage {
    machine_name: String,
    machine_uuid: Option<String>,
    shared: Arc<StdMutex<SimShared>>,
    /// Mirror of the current position, updated after every command;
    /// handed to focus-linked cameras.
    position_cell: Arc<StdMutex<Position>>,
    transcript: Arc<StdMutex<Vec<String>>>,
    faults: Arc<StdMutex<Vec<FaultRule>>>,
    /// (command prefix, remaining keep-alive lines before the ok)
    keepalives: Arc<StdMutex<Vec<(String, usize)>>>,
    rx: VecDeque<String>,
}

impl SimStage {
    pub fn new() -> Self {
        Self::with_identity("MicroStageController", Some("a3a4637a-68c4-4340-9fda-847b4fe0d3fc"))
    }

    pub fn with_identity(machine_name: &str, machine_uuid: Option<&str>) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            machine_uuid: machine_uuid.map(str::to_string),
            shared: Arc::new(StdMutex::new(SimShared {
                position: Position::new(0.0, 0.0, 0.0),
                relative: false,
                homed: false,
            })),
            position_cell: Arc::new(StdMutex::new(Position::new(0.0, 0.0, 0.0))),
            transcript: Arc::new(StdMutex::new(Vec::new())),
            faults: Arc::new(StdMutex::new(Vec::new())),
            keepalives: Arc::new(StdMutex::new(Vec::new())),
            rx: VecDeque::new(),
        }
    }

    /// Identity this simulator reports via `M115`.
    pub fn identity(&self) -> BoardIdentity {
        BoardIdentity {
            firmware_name: SIM_FIRMWARE.to_string(),
            machine_name: Some(self.machine_name.clone()),
            machine_uuid: self.machine_uuid.clone(),
        }
    }

    /// Every line written by the driver, in order.
    pub fn transcript(&self) -> Arc<StdMutex<Vec<String>>> {
        self.transcript.clone()
    }

    /// Shared position cell; focus-linked cameras read it live.
    pub fn position_handle(&self) -> Arc<StdMutex<Position>> {
        // Hand out a live view through a dedicated cell kept in sync on
        // every command; simpler than exposing SimShared.
        self.position_cell.clone()
    }

    pub fn position(&self) -> Position {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).position
    }

    pub fn is_homed(&self) -> bool {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).homed
    }

    pub fn set_position(&self, position: Position) {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .position = position;
        *self
            .position_cell
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = position;
    }

    /// Reply to commands starting with `prefix` with an `error:` line.
    pub fn fail_command(&self, prefix: &str, message: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FaultRule {
                prefix: prefix.to_string(),
                mode: FaultMode::Error,
                message: message.to_string(),
            });
    }

    /// Swallow commands starting with `prefix` without any reply.
    pub fn silence_command(&self, prefix: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FaultRule {
                prefix: prefix.to_string(),
                mode: FaultMode::Silence,
                message: String::new(),
            });
    }

    /// Emit `count` busy keep-alive lines before acknowledging `prefix`.
    pub fn keepalives_before_ok(&self, prefix: &str, count: usize) {
        self.keepalives
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.to_string(), count));
    }

    fn handle(&mut self, line: &str) {
        let cmd = line.trim();

        let fault = {
            let faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            faults
                .iter()
                .find(|r| cmd.starts_with(&r.prefix))
                .map(|r| (r.mode, r.message.clone()))
        };
        if let Some((mode, message)) = fault {
            match mode {
                FaultMode::Error => self.rx.push_back(format!("error:{message}")),
                FaultMode::Silence => {}
            }
            return;
        }

        {
            let mut keepalives = self.keepalives.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = keepalives.iter_mut().find(|(p, n)| cmd.starts_with(p.as_str()) && *n > 0) {
                let n = entry.1;
                entry.1 = 0;
                for _ in 0..n {
                    self.rx.push_back("echo:busy: processing".to_string());
                }
            }
        }

        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        match cmd.split_whitespace().next().unwrap_or("") {
            "G90" => shared.relative = false,
            "G91" => shared.relative = true,
            "G0" | "G1" => {
                let mut dx = 0.0;
                let mut dy = 0.0;
                let mut dz = 0.0;
                for word in cmd.split_whitespace().skip(1) {
                    let (axis, value) = word.split_at(1);
                    let value: f64 = value.parse().unwrap_or(0.0);
                    match axis {
                        "X" => dx = value,
                        "Y" => dy = value,
                        "Z" => dz = value,
                        _ => {}
                    }
                }
                if shared.relative {
                    shared.position.x += dx;
                    shared.position.y += dy;
                    shared.position.z += dz;
                } else {
                    if cmd.contains('X') {
                        shared.position.x = dx;
                    }
                    if cmd.contains('Y') {
                        shared.position.y = dy;
                    }
                    if cmd.contains('Z') {
                        shared.position.z = dz;
                    }
                }
            }
            "G28" => {
                let axes: Vec<&str> = cmd.split_whitespace().skip(1).collect();
                if axes.is_empty() || axes.contains(&"X") {
                    shared.position.x = 0.0;
                }
                if axes.is_empty() || axes.contains(&"Y") {
                    shared.position.y = 0.0;
                }
                if axes.is_empty() || axes.contains(&"Z") {
                    shared.position.z = 0.0;
                }
                shared.homed = true;
            }
            "M114" => {
                let p = shared.position;
                self.rx.push_back(format!(
                    "X:{:.4} Y:{:.4} Z:{:.4} E:0.0000 Count X:0 Y:0 Z:0",
                    p.x, p.y, p.z
                ));
            }
            "M115" => {
                let uuid = self
                    .machine_uuid
                    .as_deref()
                    .map(|u| format!(" UUID:{u}"))
                    .unwrap_or_default();
                self.rx.push_back(format!(
                    "FIRMWARE_NAME:{SIM_FIRMWARE} MACHINE_TYPE:3-axis MACHINE_NAME:{}{uuid}",
                    self.machine_name
                ));
            }
            "M211" => {
                self.rx
                    .push_back("Min:  X:0.00 Y:0.00 Z:0.00".to_string());
                self.rx
                    .push_back("Max:  X:100.00 Y:100.00 Z:25.00".to_string());
            }
            // M400, M110 and anything else: accept silently.
            _ => {}
        }
        let pos = shared.position;
        drop(shared);
        *self
            .position_cell
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = pos;
        self.rx.push_back("ok".to_string());
    }
}

impl Default for SimStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SimStage {
    async fn write_line(&mut self, line: &str) -> StageResult<()> {
        self.transcript
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.trim().to_string());
        self.handle(line);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> StageResult<String> {
        if let Some(line) = self.rx.pop_front() {
            return Ok(line);
        }
        // Nothing pending and nothing ever will be: simulate silence.
        tokio::time::sleep(timeout).await;
        Err(StageError::Timeout(format!(
            "no line from {} within {timeout:?}",
            self.describe()
        )))
    }

    async fn drain(&mut self) -> StageResult<()> {
        self.rx.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "sim:stage".to_string()
    }
}

/// Synthetic frame source.
///
/// In plain mode it renders a gradient-plus-sine test pattern with a
/// little noise. Linked to a position cell it scales the pattern's
/// contrast by a triangular profile around `best_z`, so focus metrics
/// peak exactly where the simulated best focal plane sits.
pub struct MockCamera {
    width: u32,
    height: u32,
    noise: u8,
    focus: Option<FocusLink>,
    uniform: Option<u8>,
    failing: Arc<StdMutex<bool>>,
    frames_served: Arc<StdMutex<u64>>,
}

struct FocusLink {
    position: Arc<StdMutex<Position>>,
    best_z: f64,
    depth_mm: f64,
}

impl MockCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            noise: 2,
            focus: None,
            uniform: None,
            failing: Arc::new(StdMutex::new(false)),
            frames_served: Arc::new(StdMutex::new(0)),
        }
    }

    /// Sharpness-linked camera: contrast falls off linearly to zero as
    /// |z - best_z| approaches `depth_mm`. Noiseless so metric sweeps
    /// are exactly unimodal.
    pub fn focus_linked(
        position: Arc<StdMutex<Position>>,
        best_z: f64,
        depth_mm: f64,
        width: u32,
        height: u32,
    ) -> Self {
        let mut cam = Self::new(width, height);
        cam.noise = 0;
        cam.focus = Some(FocusLink {
            position,
            best_z,
            depth_mm,
        });
        cam
    }

    /// Featureless frames; every focus score degenerates to the same value.
    pub fn uniform(width: u32, height: u32, value: u8) -> Self {
        let mut cam = Self::new(width, height);
        cam.noise = 0;
        cam.uniform = Some(value);
        cam
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn frames_served(&self) -> u64 {
        *self.frames_served.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn render(&self) -> Frame {
        let (w, h) = (self.width, self.height);
        if let Some(value) = self.uniform {
            return Frame::new(w, h, vec![value; (w * h) as usize]);
        }

        let contrast = match &self.focus {
            Some(link) => {
                let z = link
                    .position
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .z;
                (1.0 - (z - link.best_z).abs() / link.depth_mm).max(0.0)
            }
            None => 1.0,
        };

        let mut rng = rand::thread_rng();
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let ramp = 0.5 * (x as f64 / w as f64 + y as f64 / h as f64);
                let texture = contrast * 0.35 * (0.7 * (x + y) as f64).sin();
                let mut value = ((ramp * 0.4 + 0.3 + texture) * 255.0).clamp(0.0, 255.0) as i32;
                if self.noise > 0 {
                    value += rng.gen_range(-(self.noise as i32)..=self.noise as i32);
                }
                data.push(value.clamp(0, 255) as u8);
            }
        }
        Frame::new(w, h, data)
    }
}

#[async_trait]
impl FrameSource for MockCamera {
    async fn capture(&self) -> Result<Frame> {
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            bail!("mock camera configured to fail");
        }
        *self
            .frames_served
            .lock()
            .unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::protocol;

    #[tokio::test]
    async fn sim_tracks_relative_and_absolute_moves() {
        let mut sim = SimStage::new();
        sim.write_line("G91").await.unwrap();
        sim.write_line("G1 X1.0000 Z-0.5000 F600.00").await.unwrap();
        sim.write_line("G90").await.unwrap();
        sim.write_line("G1 X10.0000 F600.00").await.unwrap();
        assert_eq!(sim.position(), Position::new(10.0, 0.0, -0.5));

        assert!(!sim.is_homed());
        sim.write_line("G28 Z").await.unwrap();
        assert!(sim.is_homed());
        assert_eq!(sim.position().z, 0.0);
    }

    #[tokio::test]
    async fn sim_identifies_itself() {
        let mut sim = SimStage::new();
        sim.write_line("M115").await.unwrap();
        let payload = sim.read_line(Duration::from_millis(10)).await.unwrap();
        let ok = sim.read_line(Duration::from_millis(10)).await.unwrap();
        let identity = protocol::parse_identity(&payload).unwrap();
        assert!(identity.is_family("marlin"));
        assert_eq!(protocol::classify(&ok), protocol::AckLine::Ok);
    }

    #[tokio::test]
    async fn focus_linked_camera_peaks_at_best_z() {
        let cell = Arc::new(StdMutex::new(Position::new(0.0, 0.0, 0.0)));
        let cam = MockCamera::focus_linked(cell.clone(), 0.0, 0.5, 64, 64);
        let metric = crate::focus::metric::FocusMetric::LaplacianVariance;

        let sharp = metric.score(&cam.capture().await.unwrap());
        cell.lock().unwrap().z = 0.4;
        let blurry = metric.score(&cam.capture().await.unwrap());
        assert!(sharp > blurry, "sharp={sharp} blurry={blurry}");
    }

    #[tokio::test]
    async fn failing_camera_reports_capture_error() {
        let cam = MockCamera::new(32, 32);
        cam.set_failing(true);
        assert!(cam.capture().await.is_err());
    }
}
