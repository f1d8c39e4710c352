//! The agent state machine.
//!
//! One [`Orchestrator`] owns the conversation, the run state, and the
//! execution engine. Input is queued with [`Orchestrator::submit`] and
//! drained by [`Orchestrator::run_pending`], one input at a time. Each input
//! starts an autonomous run: model call, action execution, and continuation
//! without fresh input until the reply carries a terminal marker, the
//! autonomous limit is reached, or the run is cancelled through a
//! [`CancelHandle`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::actions::ActionRunner;
use crate::context::ContextManager;
use crate::core::conversation::{Conversation, Message};
use crate::core::directive::OBSERVE_MARKER;
use crate::core::types::{AgentState, CancelToken, RunState};
use crate::io::config::AgentConfig;
use crate::io::model::{ChatModel, ChatRequest, call_with_retry};
use crate::io::prompt::system_prompt;
use crate::io::session::ExecutionEngine;
use crate::io::workspace::FsWorkspace;

/// Progress notifications emitted while a run is in flight.
#[derive(Debug, Clone, Copy)]
pub enum CycleEvent<'a> {
    State(AgentState),
    /// Full reply text of a completed model call.
    Reply(&'a str),
    /// One action outcome, as appended to the conversation.
    Outcome(&'a Message),
}

/// Reason why an autonomous run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The reply carried `[[FINISHED]]` or `[[CALL_USER]]`.
    Finished,
    /// Consecutive calls without fresh input reached the configured limit.
    LimitReached { limit: u32 },
    /// The run was interrupted.
    Cancelled,
}

/// Summary of one drained input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub input: String,
    pub cycles: u32,
    pub stop: LoopStop,
}

/// Cross-thread handle for interrupting the in-flight run.
#[derive(Clone)]
pub struct CancelHandle {
    cancel: CancelToken,
    busy: Arc<Mutex<bool>>,
    engine: Arc<ExecutionEngine>,
}

impl CancelHandle {
    /// Cancel the in-flight run: the model call is abandoned and execution
    /// waits are released. Returns false when nothing was in flight.
    pub fn interrupt(&self) -> bool {
        {
            let busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
            if !*busy {
                return false;
            }
            self.cancel.cancel();
        }
        self.engine.abort_all();
        info!("interrupt requested");
        true
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Orchestrator {
    config: AgentConfig,
    model: Box<dyn ChatModel>,
    merge_model: Option<Box<dyn ChatModel>>,
    engine: Arc<ExecutionEngine>,
    context: ContextManager,
    conversation: Conversation,
    state: RunState,
    agent_state: AgentState,
    pending: VecDeque<String>,
    cancel: CancelToken,
    busy: Arc<Mutex<bool>>,
    call_count: usize,
}

impl Orchestrator {
    pub fn new(
        config: AgentConfig,
        model: Box<dyn ChatModel>,
        workdir: impl Into<PathBuf>,
        conversation: Conversation,
    ) -> Self {
        let workdir = workdir.into();
        let engine = Arc::new(ExecutionEngine::new(&workdir, &config));
        let mut state = RunState::default();
        state.insert("workdir", Value::from(workdir.display().to_string()));
        Self {
            context: ContextManager::new(&config),
            config,
            model,
            merge_model: None,
            engine,
            conversation,
            state,
            agent_state: AgentState::Idle,
            pending: VecDeque::new(),
            cancel: CancelToken::new(),
            busy: Arc::new(Mutex::new(false)),
            call_count: 0,
        }
    }

    /// Replace the run state, e.g. with one restored from a snapshot.
    pub fn with_state(mut self, state: RunState) -> Self {
        self.state = state;
        self.state
            .insert("workdir", Value::from(self.workdir().display().to_string()));
        self
    }

    /// Use a separate transport for assisted merges.
    pub fn with_merge_model(mut self, model: Box<dyn ChatModel>) -> Self {
        self.merge_model = Some(model);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancel: self.cancel.clone(),
            busy: Arc::clone(&self.busy),
            engine: Arc::clone(&self.engine),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn agent_state(&self) -> AgentState {
        self.agent_state
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn model_echoes(&self) -> bool {
        self.model.echoes()
    }

    pub fn workdir(&self) -> PathBuf {
        self.engine.workdir()
    }

    /// Point execution and snapshots at another directory.
    pub fn set_workdir(&mut self, workdir: &Path) {
        self.engine.set_workdir(workdir);
        self.state
            .insert("workdir", Value::from(workdir.display().to_string()));
        info!(workdir = %workdir.display(), "working directory changed");
    }

    pub fn set_model(&mut self, model: &str) {
        self.config.model = model.to_string();
        info!(model, "model changed");
    }

    /// Truncate history to the system message and clear the run state.
    pub fn reset(&mut self) {
        self.conversation.reset();
        self.state.clear();
        self.state
            .insert("workdir", Value::from(self.workdir().display().to_string()));
        self.engine.reset();
        debug!("conversation reset");
    }

    /// Queue input; it runs after everything queued before it.
    pub fn submit(&mut self, input: impl Into<String>) {
        self.pending.push_back(input.into());
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop queued input, returning how much was dropped.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Drain queued input in arrival order.
    ///
    /// A cancelled run clears whatever is still queued.
    pub fn run_pending<F: FnMut(CycleEvent<'_>)>(&mut self, mut on_event: F) -> Vec<RunOutcome> {
        let mut outcomes = Vec::new();
        while let Some(input) = self.pending.pop_front() {
            let outcome = self.run_input(&input, &mut on_event);
            let cancelled = outcome.stop == LoopStop::Cancelled;
            outcomes.push(outcome);
            if cancelled {
                let dropped = self.clear_pending();
                if dropped > 0 {
                    warn!(dropped, "discarded queued input after interrupt");
                }
                break;
            }
        }
        outcomes
    }

    /// Run one input to completion (or cancellation).
    #[instrument(skip_all, fields(input_len = input.len()))]
    pub fn run_input<F: FnMut(CycleEvent<'_>)>(&mut self, input: &str, mut on_event: F) -> RunOutcome {
        self.set_busy(true);
        let mut next_input = Some(input);
        let mut cycles = 0u32;

        let stop = loop {
            if self.cancel.is_cancelled() {
                break LoopStop::Cancelled;
            }
            self.transition(AgentState::AwaitingModel, &mut on_event);
            let Some(reply) = self.call_model(next_input.take()) else {
                self.context.finish_cycle(&mut self.conversation, None);
                break LoopStop::Cancelled;
            };
            self.context.finish_cycle(&mut self.conversation, Some(&reply));
            cycles += 1;
            on_event(CycleEvent::Reply(&reply));

            self.transition(AgentState::ExecutingActions, &mut on_event);
            let merge_model = self.merge_model.as_deref().unwrap_or(self.model.as_ref());
            let runner = ActionRunner::new(&self.engine, merge_model, &self.config);
            let report = runner.run(&reply, &self.cancel, |message| {
                on_event(CycleEvent::Outcome(message));
            });
            self.conversation.extend(report.messages);

            if report.cancelled {
                break LoopStop::Cancelled;
            }
            if report.terminal {
                break LoopStop::Finished;
            }
            if cycles >= self.config.autonomous_running_limit {
                break LoopStop::LimitReached {
                    limit: self.config.autonomous_running_limit,
                };
            }
        };

        self.transition(AgentState::Terminating, &mut on_event);
        if self.set_busy(false) {
            debug!("cancellation consumed");
        }
        self.transition(AgentState::Idle, &mut on_event);
        info!(cycles, stop = ?stop, "run finished");
        RunOutcome {
            input: input.to_string(),
            cycles,
            stop,
        }
    }

    /// Prepare context and call the model; `None` when cancelled.
    fn call_model(&mut self, input: Option<&str>) -> Option<String> {
        let workspace = FsWorkspace::new(self.workdir(), self.config.visible_file_size_limit_kb);
        let messages = self
            .context
            .prepare(&mut self.conversation, &self.state, input, &workspace);
        let request = ChatRequest {
            model: self.config.model_for_call(self.call_count).to_string(),
            messages,
            temperature: self.config.temperature,
            stop: vec![OBSERVE_MARKER.to_string()],
        };
        self.call_count += 1;
        self.state
            .insert("call_count", Value::from(self.call_count as u64));
        debug!(model = %request.model, messages = request.messages.len(), "calling model");
        call_with_retry(self.model.as_ref(), &request, &self.cancel, &self.config.retry)
    }

    /// Flip the busy flag under the lock [`CancelHandle::interrupt`] holds.
    /// Going idle consumes any pending cancellation and reports whether there was one.
    fn set_busy(&self, busy: bool) -> bool {
        let mut flag = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        *flag = busy;
        !busy && self.cancel.take()
    }

    fn transition<F: FnMut(CycleEvent<'_>)>(&mut self, next: AgentState, on_event: &mut F) {
        if self.agent_state != next {
            debug!(from = ?self.agent_state, to = ?next, "state transition");
            self.agent_state = next;
            on_event(CycleEvent::State(next));
        }
    }
}

/// Build an orchestrator whose conversation starts from the rendered system prompt.
pub fn start(config: AgentConfig, model: Box<dyn ChatModel>, workdir: &Path) -> Result<Orchestrator> {
    let prompt = system_prompt(&config, workdir)?;
    Ok(Orchestrator::new(
        config,
        model,
        workdir,
        Conversation::new(prompt),
    ))
}
