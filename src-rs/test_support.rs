//! In-process stand-ins for the OS surfaces and the oracle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgba, RgbaImage};

use crate::capture::DesktopSource;
use crate::config::{AgentConfig, TimingConfig};
use crate::coords::CoordinateSpace;
use crate::error::{CaptureError, InjectionError, OracleError};
use crate::frame::Frame;
use crate::input::{InputEvent, InputSink};
use crate::oracle::{DecisionOracle, OracleRequest};
use crate::overlay::{HeadlessPresenter, OverlayStyle, OverlaySurface, Presenter};

pub type Shared<T> = Arc<Mutex<Vec<T>>>;

/// Defaults with every delay zeroed and a small frame target.
pub fn test_config() -> AgentConfig {
    let mut cfg = AgentConfig::default();
    cfg.timing = TimingConfig::immediate();
    cfg.frame.width = 160;
    cfg.frame.height = 90;
    cfg
}

pub fn headless_overlay(width: u32, height: u32) -> OverlaySurface {
    let spawned = OverlaySurface::spawn(
        CoordinateSpace::new(width, height),
        OverlayStyle::default(),
        |_, _| Box::new(HeadlessPresenter::new()),
    );
    match spawned {
        Ok(surface) => surface,
        Err(err) => panic!("headless overlay failed to start: {err:#}"),
    }
}

/// Headless presenter that counts how often it is asked to raise.
#[derive(Debug, Default, Clone)]
pub struct CountingPresenter {
    raises: Arc<AtomicUsize>,
}

impl CountingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raises(&self) -> usize {
        self.raises.load(Ordering::SeqCst)
    }
}

impl Presenter for CountingPresenter {
    fn show(&mut self) {}
    fn present(&mut self, _buffer: &RgbaImage) {}
    fn raise(&mut self) {
        self.raises.fetch_add(1, Ordering::SeqCst);
    }
    fn close(&mut self) {}
}

/// Desktop that renders a fixed image.
pub struct SyntheticDesktop {
    image: RgbaImage,
    fail_after: Option<usize>,
    captures: usize,
}

impl SyntheticDesktop {
    pub fn solid(width: u32, height: u32, color: Rgba<u8>) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, color),
            fail_after: None,
            captures: 0,
        }
    }

    pub fn gradient(width: u32, height: u32) -> Self {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        Self {
            image,
            fail_after: None,
            captures: 0,
        }
    }

    pub fn failing() -> Self {
        Self::solid(8, 8, Rgba([0, 0, 0, 255])).fail_after(0)
    }

    /// Succeeds `n` times, then reports the capture surface as gone.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl DesktopSource for SyntheticDesktop {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.fail_after.is_some_and(|n| self.captures >= n) {
            return Err(CaptureError::Unavailable("synthetic desktop went away".to_string()));
        }
        self.captures += 1;
        Ok(Frame::new(self.image.clone()))
    }

    fn screen_size(&self) -> Result<(u32, u32), CaptureError> {
        Ok(self.image.dimensions())
    }
}

/// Sink that records every injected event.
#[derive(Default)]
pub struct RecordingSink {
    events: Shared<InputEvent>,
    pointer: Option<(i32, i32)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pointer(mut self, at: (i32, i32)) -> Self {
        self.pointer = Some(at);
        self
    }

    pub fn events(&self) -> Shared<InputEvent> {
        Arc::clone(&self.events)
    }
}

impl InputSink for RecordingSink {
    fn send(&mut self, events: &[InputEvent]) -> Result<(), InjectionError> {
        self.events
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .extend_from_slice(events);
        Ok(())
    }

    fn pointer_position(&self) -> Option<(i32, i32)> {
        self.pointer
    }
}

/// Sink whose `n`th `send` call (1-based) is rejected. Other calls record.
pub struct FailingSink {
    fail_on: usize,
    calls: usize,
    events: Shared<InputEvent>,
}

impl FailingSink {
    pub fn failing_call(n: usize) -> Self {
        Self {
            fail_on: n,
            calls: 0,
            events: Shared::default(),
        }
    }

    pub fn events(&self) -> Shared<InputEvent> {
        Arc::clone(&self.events)
    }
}

impl InputSink for FailingSink {
    fn send(&mut self, events: &[InputEvent]) -> Result<(), InjectionError> {
        self.calls += 1;
        if self.calls == self.fail_on {
            let event = events.first().map(InputEvent::describe).unwrap_or_default();
            return Err(InjectionError::Rejected {
                event,
                message: "synthetic rejection".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .extend_from_slice(events);
        Ok(())
    }

    fn pointer_position(&self) -> Option<(i32, i32)> {
        None
    }
}

enum Scripted {
    Text(String),
    Fail(String),
}

/// Oracle that replays canned responses and records what it was asked.
pub struct ScriptedOracle {
    script: VecDeque<Scripted>,
    repeat: Option<String>,
    requests: Shared<OracleRequest>,
    timeouts: Shared<Duration>,
}

impl ScriptedOracle {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: responses.into_iter().map(|r| Scripted::Text(r.into())).collect(),
            repeat: None,
            requests: Shared::default(),
            timeouts: Shared::default(),
        }
    }

    /// Returns `response` forever once the script runs out.
    pub fn repeating(response: impl Into<String>) -> Self {
        let mut oracle = Self::new(Vec::<String>::new());
        oracle.repeat = Some(response.into());
        oracle
    }

    pub fn then_text(mut self, response: impl Into<String>) -> Self {
        self.script.push_back(Scripted::Text(response.into()));
        self
    }

    pub fn then_transport_error(mut self, message: impl Into<String>) -> Self {
        self.script.push_back(Scripted::Fail(message.into()));
        self
    }

    pub fn requests(&self) -> Shared<OracleRequest> {
        Arc::clone(&self.requests)
    }

    pub fn timeouts(&self) -> Shared<Duration> {
        Arc::clone(&self.timeouts)
    }
}

impl DecisionOracle for ScriptedOracle {
    fn decide(&mut self, request: &OracleRequest, timeout: Duration) -> Result<String, OracleError> {
        self.requests
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(request.clone());
        self.timeouts
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(timeout);
        match self.script.pop_front() {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Fail(message)) => Err(OracleError::Transport(message)),
            None => self.repeat.clone().ok_or(OracleError::Empty),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
