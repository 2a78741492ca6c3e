//! The perceive → decide → validate → act → re-perceive cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::action::{accept_decision, ActionDescriptor, Decision};
use crate::annotations::AnnotationStore;
use crate::capture::DesktopSource;
use crate::compositor::{FrameCompositor, GroundTruth};
use crate::config::{AgentConfig, LoopRecovery};
use crate::error::{AgentError, OracleError};
use crate::executor::{annotation_primitives, ActionExecutor, ActionOutcome, TimingPolicy};
use crate::files::timestamp_iso;
use crate::history::{ActionHistory, HistoryEntry, SignatureHistory};
use crate::input::InputSink;
use crate::oracle::{DecisionOracle, OracleRequest};
use crate::overlay::OverlaySurface;
use crate::run_log::{CycleRecord, RunLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Capturing,
    AwaitingDecision,
    Validating,
    Executing,
    Recapturing,
    Terminated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Terminated {
        cycles: u32,
        last_justification: Option<String>,
    },
    Failed {
        reason: String,
        last_justification: Option<String>,
        last_raw_output: Option<String>,
        cycles: u32,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    pub fn cycles(&self) -> u32 {
        match self {
            Self::Terminated { cycles, .. } | Self::Failed { cycles, .. } => *cycles,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopPolicy {
    pub max_cycles: u32,
    pub oracle_attempts: u32,
    pub oracle_timeout: Duration,
    pub retry_delay: Duration,
    pub history_len: usize,
    pub oracle_history: usize,
    pub signature_window: usize,
    pub repeat_threshold: usize,
    pub recovery: LoopRecovery,
    pub labels_in_request: usize,
}

impl LoopPolicy {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            max_cycles: cfg.policy.max_cycles,
            oracle_attempts: cfg.policy.oracle_attempts.max(1),
            oracle_timeout: cfg.oracle.timeout(),
            retry_delay: Duration::from_millis(cfg.timing.retry_delay_ms),
            history_len: cfg.policy.history_len,
            oracle_history: cfg.policy.oracle_history,
            signature_window: cfg.policy.signature_window,
            repeat_threshold: cfg.policy.repeat_threshold,
            recovery: cfg.policy.recovery,
            labels_in_request: cfg.oracle.annotations_in_request,
        }
    }
}

/// Mutable state carried between cycles.
#[derive(Debug)]
pub struct AgentState {
    pub phase: Phase,
    pub cycle: u32,
    pub history: ActionHistory,
    pub signatures: SignatureHistory,
    pub last_justification: Option<String>,
    pub last_raw_output: Option<String>,
    pub loops_contained: u32,
    previous_png: Option<Vec<u8>>,
}

impl AgentState {
    fn new(policy: &LoopPolicy) -> Self {
        Self {
            phase: Phase::Capturing,
            cycle: 0,
            history: ActionHistory::new(policy.history_len),
            signatures: SignatureHistory::new(policy.signature_window),
            last_justification: None,
            last_raw_output: None,
            loops_contained: 0,
            previous_png: None,
        }
    }
}

/// Everything the loop drives. The loop owns all of it for the run.
pub struct AgentParts {
    pub desktop: Box<dyn DesktopSource>,
    pub sink: Box<dyn InputSink>,
    pub oracle: Box<dyn DecisionOracle>,
    pub overlay: OverlaySurface,
    pub store: AnnotationStore,
}

/// Result of a single `act` pass.
#[derive(Debug)]
pub struct ActReport {
    pub decision: Decision,
    pub outcome: ActionOutcome,
    pub truth: GroundTruth,
}

pub struct AgentLoop {
    policy: LoopPolicy,
    desktop: Box<dyn DesktopSource>,
    oracle: Box<dyn DecisionOracle>,
    overlay: OverlaySurface,
    store: AnnotationStore,
    executor: ActionExecutor,
    compositor: FrameCompositor,
    run_log: Option<RunLog>,
    abort: Arc<AtomicBool>,
    state: AgentState,
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

impl AgentLoop {
    pub fn new(parts: AgentParts, cfg: &AgentConfig) -> Self {
        let policy = LoopPolicy::from_config(cfg);
        let coords = parts.overlay.coords();
        let executor = ActionExecutor::new(coords, TimingPolicy::from(&cfg.timing), parts.sink);
        let state = AgentState::new(&policy);
        Self {
            policy,
            desktop: parts.desktop,
            oracle: parts.oracle,
            overlay: parts.overlay,
            store: parts.store,
            executor,
            compositor: FrameCompositor::new(cfg.frame.width, cfg.frame.height),
            run_log: None,
            abort: Arc::new(AtomicBool::new(false)),
            state,
        }
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Setting the flag stops the run before the next cycle starts.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(cycle = self.state.cycle, ?phase, "phase");
        self.state.phase = phase;
    }

    /// Shows the overlay with the stored annotations and no HUD.
    fn prime_overlay(&mut self) {
        self.overlay.show();
        let primitives = annotation_primitives(&self.store, self.overlay.style());
        self.overlay.present(primitives, None);
        self.overlay.wait_latest();
        self.overlay.assert_topmost();
    }

    fn capture(&mut self, step: u32) -> Result<(GroundTruth, Option<String>), AgentError> {
        let truth = self.compositor.capture(self.desktop.as_mut(), &self.overlay)?;
        let dumped = match &self.run_log {
            Some(log) => match log.write_frame(step, &truth.png) {
                Ok(path) => Some(path.display().to_string()),
                Err(err) => {
                    warn!(step, error = %format!("{err:#}"), "failed to dump frame");
                    None
                }
            },
            None => None,
        };
        Ok((truth, dumped))
    }

    fn record(&mut self, record: &CycleRecord) {
        if let Some(log) = self.run_log.as_mut() {
            if let Err(err) = log.append(record) {
                warn!(cycle = record.cycle, error = %format!("{err:#}"), "failed to append cycle record");
            }
        }
    }

    /// Asks the oracle until a response validates or the attempt bound is
    /// hit. Each attempt gets a proportionally longer timeout.
    fn decide(&mut self, goal: &str, current_png: &[u8], record: &mut CycleRecord) -> Result<Decision, AgentError> {
        let request = OracleRequest::new(
            goal,
            self.state.history.recent(self.policy.oracle_history),
            &self.store,
            self.policy.labels_in_request,
            self.state.previous_png.clone(),
            current_png.to_vec(),
        );
        let attempts = self.policy.oracle_attempts;
        let mut last_err = AgentError::Oracle(OracleError::Empty);
        for attempt in 1..=attempts {
            record.attempts = attempt;
            self.set_phase(Phase::AwaitingDecision);
            let timeout = self.policy.oracle_timeout * attempt;
            let result = match self.oracle.decide(&request, timeout) {
                Ok(raw) => {
                    self.set_phase(Phase::Validating);
                    let accepted = accept_decision(&raw, &self.store).map_err(AgentError::from);
                    self.state.last_raw_output = Some(raw);
                    accepted
                }
                Err(err) => Err(AgentError::from(err)),
            };
            match result {
                Ok(decision) => return Ok(decision),
                Err(err) => {
                    warn!(cycle = record.cycle, attempt, attempts, error = %err, "oracle attempt rejected");
                    record.validation = err.to_string();
                    last_err = err;
                    if attempt < attempts {
                        pause(self.policy.retry_delay);
                    }
                }
            }
        }
        Err(last_err)
    }

    fn fail(&mut self, reason: String) -> RunOutcome {
        self.set_phase(Phase::Failed);
        error!(cycle = self.state.cycle, %reason, "run failed");
        RunOutcome::Failed {
            reason,
            last_justification: self.state.last_justification.clone(),
            last_raw_output: self.state.last_raw_output.clone(),
            cycles: self.state.cycle,
        }
    }

    /// Drives cycles until `done`, a fatal error, the cycle budget or an
    /// abort request.
    pub fn run(&mut self, goal: &str) -> RunOutcome {
        let started_at = timestamp_iso();
        info!(goal, oracle = %self.oracle.describe(), "run started");
        let outcome = self.run_cycles(goal);
        let summary = json!({
            "goal": goal,
            "oracle": self.oracle.describe(),
            "started_at": started_at,
            "finished_at": timestamp_iso(),
            "outcome": outcome,
            "loops_contained": self.state.loops_contained,
            "annotations": self.store.len(),
        });
        self.write_summary(&summary);
        info!(success = outcome.is_success(), cycles = outcome.cycles(), "run finished");
        outcome
    }

    fn write_summary(&self, summary: &Value) {
        if let Some(log) = &self.run_log {
            if let Err(err) = log.write_summary(summary) {
                warn!(error = %format!("{err:#}"), "failed to write run summary");
            }
        }
    }

    fn run_cycles(&mut self, goal: &str) -> RunOutcome {
        self.prime_overlay();
        self.set_phase(Phase::Capturing);
        let (mut current, mut current_path) = match self.capture(1) {
            Ok(captured) => captured,
            Err(err) => return self.fail(err.to_string()),
        };

        loop {
            if self.abort.load(Ordering::SeqCst) {
                return self.fail("aborted".to_string());
            }
            if self.state.cycle >= self.policy.max_cycles {
                return self.fail("cycle budget exhausted".to_string());
            }
            self.state.cycle += 1;
            let cycle = self.state.cycle;
            let mut record = CycleRecord::new(cycle);
            record.frame = current_path.take();

            let decision = match self.decide(goal, &current.png, &mut record) {
                Ok(decision) => decision,
                Err(err) => {
                    record.error = Some(err.to_string());
                    self.record(&record);
                    let reason = format!(
                        "no valid action after {} attempts: {err}",
                        self.policy.oracle_attempts
                    );
                    return self.fail(reason);
                }
            };
            record.validation = "ok".to_string();
            record.action = Some(decision.action.clone());
            record.justification = Some(decision.justification.clone());
            info!(cycle, tool = decision.action.tool(), justification = %decision.justification, "decision accepted");

            self.set_phase(Phase::Executing);
            let outcome = match self.executor.execute(&decision, &mut self.store, &mut self.overlay) {
                Ok(outcome) => outcome,
                Err(err) => {
                    record.error = Some(err.to_string());
                    self.record(&record);
                    return self.fail(err.to_string());
                }
            };
            self.state.last_justification = Some(decision.justification.clone());
            record.execution = Some(outcome.clone());

            if decision.action == ActionDescriptor::Done {
                self.record(&record);
                self.set_phase(Phase::Terminated);
                return RunOutcome::Terminated {
                    cycles: cycle,
                    last_justification: self.state.last_justification.clone(),
                };
            }

            pause(outcome.post_delay);
            self.overlay.wait_latest();
            self.overlay.assert_topmost();

            self.set_phase(Phase::Recapturing);
            let (next, next_path) = match self.capture(cycle + 1) {
                Ok(captured) => captured,
                Err(err) => {
                    record.error = Some(err.to_string());
                    self.record(&record);
                    return self.fail(err.to_string());
                }
            };
            self.state.history.push(HistoryEntry::new(
                decision.action.tool(),
                decision.justification.clone(),
                outcome.history_message.clone(),
                outcome.success,
            ));
            let signature = decision.action.signature();
            self.state.signatures.push(signature.clone());
            record.signature = Some(signature.clone());

            if self.state.signatures.is_looping(self.policy.repeat_threshold) {
                record.loop_detected = true;
                match self.policy.recovery {
                    LoopRecovery::ClearHistory => {
                        warn!(cycle, %signature, "repeated action detected; clearing history");
                        self.state.history.clear();
                        self.state.signatures.clear();
                        self.state.loops_contained += 1;
                    }
                    LoopRecovery::Ignore => {
                        warn!(cycle, %signature, "repeated action detected");
                    }
                    LoopRecovery::Fail => {
                        self.record(&record);
                        return self.fail(format!("repeated action loop: {signature}"));
                    }
                }
            }
            self.record(&record);

            self.state.previous_png = Some(std::mem::take(&mut current.png));
            current = next;
            current_path = next_path;
            self.set_phase(Phase::Capturing);
        }
    }

    /// Validates and executes one raw action, then captures the result.
    pub fn act(&mut self, raw: &str) -> Result<ActReport, AgentError> {
        self.prime_overlay();
        let decision = accept_decision(raw, &self.store)?;
        let outcome = self.executor.execute(&decision, &mut self.store, &mut self.overlay)?;
        pause(outcome.post_delay);
        self.overlay.wait_latest();
        let (truth, _) = self.capture(1)?;
        Ok(ActReport {
            decision,
            outcome,
            truth,
        })
    }
}
