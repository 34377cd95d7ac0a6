//! The pipeline interpreter.
//!
//! [`PipelineEngine::run`] walks one pipeline tree depth-first and
//! sequentially, executing leaf blocks through the configured
//! [`DevicePort`], iterating loop containers, and evaluating conditionals.
//! The shared cancellation token is checked before every node and around
//! every dispatched command; a stop request unwinds as
//! [`RunError::Stopped`] and terminates the run as
//! [`TerminalReason::Stopped`], never as a failure.
//!
//! Failure policy: an ordinary command block that fails marks its node
//! `Error` and the run continues with the next sibling. Everything else
//! that goes wrong (a loop body error, an image match that resolves
//! unsuccessfully or times out) unwinds to the root and ends the run as
//! `Failed`.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use rigline_channel::{ChannelError, DevicePort};
use rigline_types::{
    Block, BlockCatalog, BlockKind, BlockNode, Condition, ConditionalNode, LoopNode, NodeStatus, Pipeline, PipelineNode,
    RunEvent, SpecialKind, TerminalReason,
};

use crate::condition::evaluate_expression;
use crate::error::RunError;
use crate::resolve::{RunContext, resolve_template};
use crate::stats::StatsTracker;

/// Sleep duration when a sleep node carries none (or an invalid one).
const DEFAULT_SLEEP: Duration = Duration::from_millis(1000);
/// Match bound when a wait-for-image node carries none.
const DEFAULT_MATCH_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Interprets pipelines against one device port.
///
/// One engine instance executes at most one run at a time; a concurrent
/// `run` call is rejected with [`RunError::AlreadyRunning`].
pub struct PipelineEngine {
    port: Arc<dyn DevicePort>,
    is_running: AtomicBool,
}

/// Mutable per-run state threaded through the traversal.
struct RunState {
    catalog: BlockCatalog,
    tracker: StatsTracker,
    events: UnboundedSender<RunEvent>,
    cancel: CancellationToken,
    completed_steps: u64,
    total_steps: u64,
}

impl RunState {
    fn log(&self, line: impl Into<String>) {
        let _ = self.events.send(RunEvent::LogLine { line: line.into() });
    }

    fn emit_stats(&self) {
        let _ = self.events.send(RunEvent::Stats {
            snapshot: self.tracker.snapshot(),
        });
    }

    fn step_done(&mut self) {
        self.completed_steps += 1;
        let _ = self.events.send(RunEvent::Progress {
            completed: self.completed_steps,
            total: self.total_steps,
        });
    }
}

/// Clears the engine's running flag when a run exits by any path.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl PipelineEngine {
    /// Creates an engine that executes against the given port.
    pub fn new(port: Arc<dyn DevicePort>) -> Self {
        Self {
            port,
            is_running: AtomicBool::new(false),
        }
    }

    /// True while a run is active on this engine.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Interprets one pipeline to termination.
    ///
    /// The pipeline and catalog are treated as immutable snapshots for the
    /// duration of the run; the engine clones the catalog up front so a
    /// concurrently editing owner cannot change what this run sees.
    /// Observers receive log lines, stats snapshots, and progress over
    /// `events`, ending with exactly one `RunEvent::Completed`. The
    /// returned [`TerminalReason`] matches that final event.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        catalog: &BlockCatalog,
        events: UnboundedSender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<TerminalReason, RunError> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunError::AlreadyRunning);
        }
        let _guard = RunGuard { flag: &self.is_running };

        let context = RunContext::new();
        let mut state = RunState {
            catalog: catalog.clone(),
            tracker: StatsTracker::new(),
            events,
            cancel,
            completed_steps: 0,
            total_steps: pipeline.total_steps(),
        };

        tracing::info!(target: "rig_engine", pipeline = %pipeline.id, steps = state.total_steps, "run started");
        state.log(format!("pipeline '{}' started", pipeline.name));

        let outcome = self.execute_sequence(&pipeline.items, context, &mut state).await;
        let reason = match outcome {
            Ok(()) => {
                state.log(format!("pipeline '{}' completed successfully", pipeline.name));
                TerminalReason::Completed
            }
            Err(RunError::Stopped) => {
                state.log(format!("pipeline '{}' stopped by user", pipeline.name));
                TerminalReason::Stopped
            }
            Err(error) => {
                state.log(format!("pipeline '{}' failed: {error}", pipeline.name));
                TerminalReason::Failed {
                    reason: error.to_string(),
                }
            }
        };
        tracing::info!(target: "rig_engine", pipeline = %pipeline.id, reason = ?reason, "run finished");
        let _ = state.events.send(RunEvent::Completed { reason: reason.clone() });
        Ok(reason)
    }

    /// Executes one node sequence in order, checking cancellation at every
    /// node boundary. Boxed because loops and conditionals recurse back
    /// into their child sequences.
    fn execute_sequence<'a>(
        &'a self,
        nodes: &'a [PipelineNode],
        context: RunContext,
        state: &'a mut RunState,
    ) -> Pin<Box<dyn Future<Output = Result<(), RunError>> + Send + 'a>> {
        Box::pin(async move {
            let mut previous: Option<&str> = None;
            for node in nodes {
                if state.cancel.is_cancelled() {
                    return Err(RunError::Stopped);
                }
                match node {
                    PipelineNode::Block(block_node) => self.execute_block(block_node, &context, state).await?,
                    PipelineNode::Loop(loop_node) => self.execute_loop(loop_node, &context, state).await?,
                    PipelineNode::Conditional(conditional) => {
                        self.execute_conditional(conditional, &context, previous, state).await?
                    }
                }
                previous = Some(node.id());
            }
            Ok(())
        })
    }

    async fn execute_block(&self, node: &BlockNode, context: &RunContext, state: &mut RunState) -> Result<(), RunError> {
        let Some(block) = state.catalog.lookup(&node.block_id).cloned() else {
            tracing::warn!(target: "rig_engine", node = %node.id, block = %node.block_id, "unknown block reference");
            state.log(format!("block '{}' not found; skipping step", node.block_id));
            state.step_done();
            return Ok(());
        };

        match block.kind {
            BlockKind::Special(SpecialKind::Sleep) => self.execute_sleep(node, state).await,
            BlockKind::Special(SpecialKind::WaitForImage) => self.execute_wait_for_image(node, state).await,
            BlockKind::Special(SpecialKind::LogStart) => {
                let command = node.effective_log_command(&block).map(|command| {
                    let mut line = resolve_template(command, context);
                    if let Some(file_name) = node.effective_log_file_name(&block) {
                        line.push(' ');
                        line.push_str(&resolve_template(file_name, context));
                    }
                    line
                });
                self.execute_capture_command(node, &block, command, "log capture start", state).await
            }
            BlockKind::Special(SpecialKind::LogStop) => {
                let command = node
                    .effective_stop_command(&block)
                    .map(|command| resolve_template(command, context));
                self.execute_capture_command(node, &block, command, "log capture stop", state).await
            }
            BlockKind::Predefined | BlockKind::Custom => self.execute_command_block(node, &block, context, state).await,
        }
    }

    async fn execute_sleep(&self, node: &BlockNode, state: &mut RunState) -> Result<(), RunError> {
        state.tracker.begin(&node.id);
        state.emit_stats();

        let duration = node
            .sleep_duration_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SLEEP);
        state.log(format!("sleeping for {} ms", duration.as_millis()));

        // The wait itself is a suspension point: a stop request interrupts
        // it instead of running it out to the next node boundary.
        tokio::select! {
            _ = state.cancel.cancelled() => return Err(RunError::Stopped),
            _ = tokio::time::sleep(duration) => {}
        }

        state.tracker.end(&node.id, NodeStatus::Success);
        state.emit_stats();
        state.step_done();
        Ok(())
    }

    async fn execute_wait_for_image(&self, node: &BlockNode, state: &mut RunState) -> Result<(), RunError> {
        state.tracker.begin(&node.id);
        state.emit_stats();

        let Some(template) = node.image_template_path.as_deref().filter(|path| !path.is_empty()) else {
            // Misconfigured node: failed step, but the run carries on.
            state.log("wait-for-image has no template configured; step failed".to_string());
            state.tracker.end(&node.id, NodeStatus::Error);
            state.emit_stats();
            state.step_done();
            return Ok(());
        };

        let bound = node
            .match_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MATCH_TIMEOUT);
        state.log(format!("waiting up to {} ms for '{template}'", bound.as_millis()));

        match self.port.match_image(template, bound, &state.cancel).await {
            Ok(result) if result.success => {
                match result.confidence {
                    Some(confidence) => state.log(format!("matched '{template}' (confidence {confidence:.2})")),
                    None => state.log(format!("matched '{template}'")),
                }
                state.tracker.end(&node.id, NodeStatus::Success);
                state.emit_stats();
                state.step_done();
                Ok(())
            }
            Ok(result) => {
                let reason = result.message.unwrap_or_else(|| "template not found".to_string());
                state.tracker.end(&node.id, NodeStatus::Error);
                state.emit_stats();
                state.step_done();
                Err(RunError::ImageMatch {
                    node_id: node.id.clone(),
                    reason,
                })
            }
            Err(ChannelError::Stopped) => Err(RunError::Stopped),
            Err(error) => {
                state.tracker.end(&node.id, NodeStatus::Error);
                state.emit_stats();
                state.step_done();
                Err(RunError::ImageMatch {
                    node_id: node.id.clone(),
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Runs a log-capture command (start or stop) with ordinary soft-failure
    /// block semantics.
    async fn execute_capture_command(
        &self,
        node: &BlockNode,
        block: &Block,
        command: Option<String>,
        label: &str,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        state.tracker.begin(&node.id);
        state.emit_stats();

        let Some(command) = command else {
            state.log(format!("block '{}' has no {label} command configured; step failed", block.name));
            state.tracker.end(&node.id, NodeStatus::Error);
            state.emit_stats();
            state.step_done();
            return Ok(());
        };

        let status = match self.dispatch_logged(&command, state).await? {
            true => NodeStatus::Success,
            false => NodeStatus::Error,
        };
        state.tracker.end(&node.id, status);
        state.emit_stats();
        state.step_done();
        Ok(())
    }

    async fn execute_command_block(
        &self,
        node: &BlockNode,
        block: &Block,
        context: &RunContext,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        state.tracker.begin(&node.id);
        state.emit_stats();

        let mut failed = false;
        for template in &block.commands {
            if state.cancel.is_cancelled() {
                return Err(RunError::Stopped);
            }
            let command = resolve_template(template, context);
            if !self.dispatch_logged(&command, state).await? {
                // The block is already failed; its remaining commands are
                // skipped and the run moves on to the next sibling.
                failed = true;
                break;
            }
        }

        let status = if failed { NodeStatus::Error } else { NodeStatus::Success };
        state.tracker.end(&node.id, status);
        state.emit_stats();
        state.step_done();
        Ok(())
    }

    /// Dispatches one resolved command, logging it and its output.
    ///
    /// Returns `Ok(false)` for the recoverable failures (dispatch error or
    /// an output reporting an error); re-raises only cancellation.
    async fn dispatch_logged(&self, command: &str, state: &mut RunState) -> Result<bool, RunError> {
        state.log(format!("> {command}"));
        match self.port.dispatch(command, &state.cancel).await {
            Ok(output) => {
                let reported_error = output.to_lowercase().contains("error");
                state.log(output);
                if reported_error {
                    state.log("output reported an error; step failed".to_string());
                }
                Ok(!reported_error)
            }
            Err(ChannelError::Stopped) => Err(RunError::Stopped),
            Err(error) => {
                tracing::warn!(target: "rig_engine", %command, %error, "command dispatch failed");
                state.log(format!("command failed: {error}"));
                Ok(false)
            }
        }
    }

    async fn execute_loop(&self, node: &LoopNode, context: &RunContext, state: &mut RunState) -> Result<(), RunError> {
        let total = node.iterations();
        state.tracker.begin(&node.id);
        state.tracker.update_loop_progress(&node.id, 0, total);
        state.emit_stats();

        for iteration in 1..=total {
            if state.cancel.is_cancelled() {
                state.tracker.end(&node.id, NodeStatus::Error);
                state.emit_stats();
                return Err(RunError::Stopped);
            }
            state.tracker.update_loop_progress(&node.id, iteration, total);
            state.emit_stats();
            state.log(format!("loop '{}' iteration {iteration}/{total}", node.id));

            let iteration_context = context.for_iteration(iteration, total);
            if let Err(error) = self.execute_sequence(&node.children, iteration_context, state).await {
                // Loops are not soft-failure boundaries: a failing body
                // fails the loop and the whole run.
                state.tracker.end(&node.id, NodeStatus::Error);
                state.emit_stats();
                return Err(error);
            }
        }

        state.tracker.end(&node.id, NodeStatus::Success);
        state.emit_stats();
        Ok(())
    }

    async fn execute_conditional(
        &self,
        node: &ConditionalNode,
        context: &RunContext,
        previous_sibling: Option<&str>,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        state.tracker.begin(&node.id);

        let result = match &node.condition {
            Condition::LastStepSuccess => {
                // Nothing to inspect when no sibling ran before this node;
                // that reads as "no success observed".
                previous_sibling
                    .map(|id| state.tracker.terminal_status(id) == Some(NodeStatus::Success))
                    .unwrap_or(false)
            }
            Condition::Expression { expression } => match evaluate_expression(expression, context) {
                Ok(value) => value,
                Err(error) => {
                    state.log(format!("condition on '{}' is invalid ({error}); taking else branch", node.id));
                    false
                }
            },
        };
        state.tracker.record_condition(&node.id, result);
        state.emit_stats();
        state.log(format!("condition on '{}' evaluated to {result}", node.id));

        let branch = if result { &node.children } else { &node.else_children };
        match self.execute_sequence(branch, context.clone(), state).await {
            Ok(()) => {
                state.tracker.end(&node.id, NodeStatus::Success);
                state.emit_stats();
                Ok(())
            }
            Err(error) => {
                state.tracker.end(&node.id, NodeStatus::Error);
                state.emit_stats();
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use rigline_channel::ImageMatchResult;
    use rigline_types::ExecutionStats;
    use tokio::sync::mpsc::unbounded_channel;

    /// Scripted device port: records dispatched commands, can fail selected
    /// commands, and pops queued image-match outcomes.
    #[derive(Default)]
    struct FakePort {
        dispatched: StdMutex<Vec<String>>,
        timeout_commands_containing: Option<String>,
        error_output_commands_containing: Option<String>,
        match_outcomes: StdMutex<VecDeque<ImageMatchResult>>,
        match_calls: AtomicU32,
    }

    impl FakePort {
        fn dispatched(&self) -> Vec<String> {
            self.dispatched.lock().expect("dispatched lock").clone()
        }

        fn queue_match(&self, success: bool) {
            self.match_outcomes.lock().expect("match lock").push_back(ImageMatchResult {
                success,
                message: (!success).then(|| "template not found".to_string()),
                confidence: success.then_some(0.92),
            });
        }
    }

    #[async_trait]
    impl DevicePort for FakePort {
        async fn dispatch(&self, command: &str, cancel: &CancellationToken) -> Result<String, ChannelError> {
            if cancel.is_cancelled() {
                return Err(ChannelError::Stopped);
            }
            self.dispatched.lock().expect("dispatched lock").push(command.to_string());
            if let Some(needle) = &self.timeout_commands_containing
                && command.contains(needle.as_str())
            {
                return Err(ChannelError::Timeout {
                    after: Duration::from_secs(10),
                });
            }
            if let Some(needle) = &self.error_output_commands_containing
                && command.contains(needle.as_str())
            {
                return Ok("ERROR: device rejected the command".to_string());
            }
            Ok(format!("ok: {command}"))
        }

        async fn match_image(
            &self,
            _template_path: &str,
            _timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<ImageMatchResult, ChannelError> {
            if cancel.is_cancelled() {
                return Err(ChannelError::Stopped);
            }
            self.match_calls.fetch_add(1, Ordering::SeqCst);
            let queued = self.match_outcomes.lock().expect("match lock").pop_front();
            Ok(queued.unwrap_or(ImageMatchResult {
                success: true,
                message: None,
                confidence: Some(1.0),
            }))
        }
    }

    fn command_block(id: &str, commands: &[&str]) -> Block {
        Block {
            id: id.into(),
            name: id.into(),
            kind: BlockKind::Custom,
            commands: commands.iter().map(|c| (*c).to_string()).collect(),
            log_command: None,
            log_file_name: None,
            stop_command: None,
        }
    }

    fn special_block(id: &str, kind: SpecialKind) -> Block {
        Block {
            id: id.into(),
            name: id.into(),
            kind: BlockKind::Special(kind),
            commands: vec![],
            log_command: None,
            log_file_name: None,
            stop_command: None,
        }
    }

    fn block_node(id: &str, block_id: &str) -> PipelineNode {
        PipelineNode::Block(BlockNode {
            id: id.into(),
            block_id: block_id.into(),
            sleep_duration_ms: None,
            image_template_path: None,
            match_timeout_ms: None,
            log_command: None,
            log_file_name: None,
            stop_command: None,
        })
    }

    fn wait_node(id: &str, template: Option<&str>) -> PipelineNode {
        PipelineNode::Block(BlockNode {
            id: id.into(),
            block_id: "wait".into(),
            sleep_duration_ms: None,
            image_template_path: template.map(str::to_string),
            match_timeout_ms: Some(5_000),
            log_command: None,
            log_file_name: None,
            stop_command: None,
        })
    }

    fn pipeline(items: Vec<PipelineNode>) -> Pipeline {
        Pipeline {
            id: "p1".into(),
            name: "test pipeline".into(),
            items,
        }
    }

    async fn run_collect(
        port: Arc<FakePort>,
        pipeline: &Pipeline,
        catalog: &BlockCatalog,
        cancel: CancellationToken,
    ) -> (TerminalReason, Vec<RunEvent>) {
        let engine = PipelineEngine::new(port);
        let (tx, mut rx) = unbounded_channel();
        let reason = engine.run(pipeline, catalog, tx, cancel).await.expect("run");
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (reason, events)
    }

    fn final_stats(events: &[RunEvent]) -> ExecutionStats {
        events
            .iter()
            .rev()
            .find_map(|event| match event {
                RunEvent::Stats { snapshot } => Some(snapshot.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn catalog(blocks: Vec<Block>) -> BlockCatalog {
        BlockCatalog::from_blocks(blocks)
    }

    #[tokio::test]
    async fn all_successful_blocks_mark_every_node_success() {
        let catalog = catalog(vec![command_block("b1", &["first"]), command_block("b2", &["second"])]);
        let pipeline = pipeline(vec![block_node("n1", "b1"), block_node("n2", "b2")]);
        let port = Arc::new(FakePort::default());

        let (reason, events) = run_collect(port, &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        for id in ["n1", "n2"] {
            let record = stats.get(id).expect("node has stats");
            assert_eq!(record.status, NodeStatus::Success);
            assert!(record.ended_at.expect("ended") >= record.started_at);
        }
    }

    #[tokio::test]
    async fn pre_set_cancellation_stops_before_any_stats() {
        let catalog = catalog(vec![command_block("b1", &["first"])]);
        let pipeline = pipeline(vec![block_node("n1", "b1")]);
        let port = Arc::new(FakePort::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, cancel).await;
        assert_eq!(reason, TerminalReason::Stopped);
        assert!(events.iter().all(|event| !matches!(event, RunEvent::Stats { .. })));
        assert!(port.dispatched().is_empty());
    }

    #[tokio::test]
    async fn completed_loop_reports_final_iteration_counts() {
        let catalog = catalog(vec![command_block("b1", &["tick $(loop_index)"])]);
        let pipeline = pipeline(vec![PipelineNode::Loop(LoopNode {
            id: "loop".into(),
            loop_count: 3,
            children: vec![block_node("n1", "b1")],
        })]);
        let port = Arc::new(FakePort::default());

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        let loop_stats = stats.get("loop").expect("loop stats");
        assert_eq!(loop_stats.status, NodeStatus::Success);
        assert_eq!(loop_stats.current_iteration, Some(3));
        assert_eq!(loop_stats.total_iterations, Some(3));
        assert_eq!(port.dispatched(), vec!["tick 1", "tick 2", "tick 3"]);
    }

    #[tokio::test]
    async fn root_level_block_failure_does_not_abort_the_run() {
        let catalog = catalog(vec![
            command_block("ok", &["fine"]),
            command_block("bad", &["broken"]),
            command_block("ok2", &["after"]),
        ]);
        let pipeline = pipeline(vec![block_node("n1", "ok"), block_node("n2", "bad"), block_node("n3", "ok2")]);
        let port = Arc::new(FakePort {
            error_output_commands_containing: Some("broken".into()),
            ..Default::default()
        });

        let (reason, events) = run_collect(port, &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        assert_eq!(stats.get("n2").expect("failing node").status, NodeStatus::Error);
        assert_eq!(stats.get("n3").expect("trailing node").status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn loop_body_failure_aborts_after_current_iteration() {
        let catalog = catalog(vec![special_block("wait", SpecialKind::WaitForImage)]);
        let pipeline = pipeline(vec![PipelineNode::Loop(LoopNode {
            id: "loop".into(),
            loop_count: 5,
            children: vec![wait_node("n1", Some("templates/ready.png"))],
        })]);
        let port = Arc::new(FakePort::default());
        port.queue_match(true);
        port.queue_match(false);

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert!(matches!(reason, TerminalReason::Failed { .. }));

        let stats = final_stats(&events);
        let loop_stats = stats.get("loop").expect("loop stats");
        assert_eq!(loop_stats.status, NodeStatus::Error);
        assert_eq!(loop_stats.current_iteration, Some(2));
        assert_eq!(port.match_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn command_timeout_marks_block_error_and_run_continues() {
        let catalog = catalog(vec![command_block("flaky", &["flaky command"]), command_block("ok", &["after"])]);
        let pipeline = pipeline(vec![block_node("n1", "flaky"), block_node("n2", "ok")]);
        let port = Arc::new(FakePort {
            timeout_commands_containing: Some("flaky".into()),
            ..Default::default()
        });

        let (reason, events) = run_collect(port, &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        assert_eq!(stats.get("n1").expect("flaky node").status, NodeStatus::Error);
        assert_eq!(stats.get("n2").expect("trailing node").status, NodeStatus::Success);
    }

    #[tokio::test]
    async fn wait_for_image_failure_fails_the_whole_run() {
        let catalog = catalog(vec![special_block("wait", SpecialKind::WaitForImage), command_block("ok", &["after"])]);
        let pipeline = pipeline(vec![wait_node("n1", Some("templates/missing.png")), block_node("n2", "ok")]);
        let port = Arc::new(FakePort::default());
        port.queue_match(false);

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert!(matches!(reason, TerminalReason::Failed { .. }));

        let stats = final_stats(&events);
        assert_eq!(stats.get("n1").expect("wait node").status, NodeStatus::Error);
        // The trailing block never ran.
        assert!(stats.get("n2").is_none());
        assert!(port.dispatched().is_empty());
    }

    #[tokio::test]
    async fn missing_template_is_a_soft_failure() {
        let catalog = catalog(vec![special_block("wait", SpecialKind::WaitForImage), command_block("ok", &["after"])]);
        let pipeline = pipeline(vec![wait_node("n1", None), block_node("n2", "ok")]);
        let port = Arc::new(FakePort::default());

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        assert_eq!(stats.get("n1").expect("wait node").status, NodeStatus::Error);
        assert_eq!(stats.get("n2").expect("trailing node").status, NodeStatus::Success);
        assert_eq!(port.match_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conditional_follows_last_step_success() {
        let catalog = catalog(vec![
            command_block("ok", &["fine"]),
            command_block("then", &["then branch"]),
            command_block("else", &["else branch"]),
        ]);
        let pipeline = pipeline(vec![
            block_node("n1", "ok"),
            PipelineNode::Conditional(ConditionalNode {
                id: "cond".into(),
                condition: Condition::LastStepSuccess,
                children: vec![block_node("n2", "then")],
                else_children: vec![block_node("n3", "else")],
            }),
        ]);
        let port = Arc::new(FakePort::default());

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        assert_eq!(stats.get("cond").expect("conditional stats").condition_result, Some(true));
        let dispatched = port.dispatched();
        assert!(dispatched.contains(&"then branch".to_string()));
        assert!(!dispatched.contains(&"else branch".to_string()));
    }

    #[tokio::test]
    async fn conditional_takes_else_branch_after_a_failure() {
        let catalog = catalog(vec![
            command_block("bad", &["broken"]),
            command_block("then", &["then branch"]),
            command_block("else", &["else branch"]),
        ]);
        let pipeline = pipeline(vec![
            block_node("n1", "bad"),
            PipelineNode::Conditional(ConditionalNode {
                id: "cond".into(),
                condition: Condition::LastStepSuccess,
                children: vec![block_node("n2", "then")],
                else_children: vec![block_node("n3", "else")],
            }),
        ]);
        let port = Arc::new(FakePort {
            error_output_commands_containing: Some("broken".into()),
            ..Default::default()
        });

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        assert_eq!(stats.get("cond").expect("conditional stats").condition_result, Some(false));
        assert!(port.dispatched().contains(&"else branch".to_string()));
    }

    #[tokio::test]
    async fn expression_condition_selects_branch_per_iteration() {
        let catalog = catalog(vec![command_block("mark", &["hit $(loop_index)"])]);
        let pipeline = pipeline(vec![PipelineNode::Loop(LoopNode {
            id: "loop".into(),
            loop_count: 3,
            children: vec![PipelineNode::Conditional(ConditionalNode {
                id: "cond".into(),
                condition: Condition::Expression {
                    expression: "$(loop_index) == 2".into(),
                },
                children: vec![block_node("n1", "mark")],
                else_children: vec![],
            })],
        })]);
        let port = Arc::new(FakePort::default());

        let (reason, _) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);
        assert_eq!(port.dispatched(), vec!["hit 2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_observes_cancellation_mid_wait() {
        let catalog = catalog(vec![special_block("sleep", SpecialKind::Sleep)]);
        let pipeline = pipeline(vec![PipelineNode::Block(BlockNode {
            id: "n1".into(),
            block_id: "sleep".into(),
            sleep_duration_ms: Some(60_000),
            image_template_path: None,
            match_timeout_ms: None,
            log_command: None,
            log_file_name: None,
            stop_command: None,
        })]);
        let port = Arc::new(FakePort::default());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let (reason, _) = run_collect(port, &pipeline, &catalog, cancel).await;
        assert_eq!(reason, TerminalReason::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_run_is_rejected() {
        let catalog = catalog(vec![special_block("sleep", SpecialKind::Sleep)]);
        let pipeline = pipeline(vec![PipelineNode::Block(BlockNode {
            id: "n1".into(),
            block_id: "sleep".into(),
            sleep_duration_ms: Some(5_000),
            image_template_path: None,
            match_timeout_ms: None,
            log_command: None,
            log_file_name: None,
            stop_command: None,
        })]);
        let engine = Arc::new(PipelineEngine::new(Arc::new(FakePort::default())));
        let cancel = CancellationToken::new();

        let background = Arc::clone(&engine);
        let background_pipeline = pipeline.clone();
        let background_catalog = catalog.clone();
        let background_cancel = cancel.clone();
        let first = tokio::spawn(async move {
            let (tx, _rx) = unbounded_channel();
            background.run(&background_pipeline, &background_catalog, tx, background_cancel).await
        });
        tokio::task::yield_now().await;
        assert!(engine.is_running());

        let (tx, _rx) = unbounded_channel();
        let second = engine.run(&pipeline, &catalog, tx, cancel.clone()).await;
        assert!(matches!(second, Err(RunError::AlreadyRunning)));

        cancel.cancel();
        let first_reason = first.await.expect("join first run").expect("first run");
        assert_eq!(first_reason, TerminalReason::Stopped);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn progress_reaches_the_precomputed_total() {
        let catalog = catalog(vec![command_block("b1", &["one"]), command_block("b2", &["two"])]);
        let pipeline = pipeline(vec![
            block_node("n1", "b1"),
            PipelineNode::Loop(LoopNode {
                id: "loop".into(),
                loop_count: 2,
                children: vec![block_node("n2", "b2")],
            }),
        ]);
        assert_eq!(pipeline.total_steps(), 3);
        let port = Arc::new(FakePort::default());

        let (reason, events) = run_collect(port, &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let last_progress = events
            .iter()
            .rev()
            .find_map(|event| match event {
                RunEvent::Progress { completed, total } => Some((*completed, *total)),
                _ => None,
            })
            .expect("progress events emitted");
        assert_eq!(last_progress, (3, 3));
    }

    #[tokio::test]
    async fn unknown_block_reference_is_skipped_without_stats() {
        let catalog = catalog(vec![command_block("ok", &["fine"])]);
        let pipeline = pipeline(vec![block_node("ghost", "no_such_block"), block_node("n2", "ok")]);
        let port = Arc::new(FakePort::default());

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        assert!(stats.get("ghost").is_none());
        assert_eq!(stats.get("n2").expect("trailing node").status, NodeStatus::Success);
        assert!(events.iter().any(|event| matches!(
            event,
            RunEvent::LogLine { line } if line.contains("not found")
        )));
    }

    #[tokio::test]
    async fn log_capture_blocks_dispatch_their_configured_commands() {
        let mut start = special_block("log_start", SpecialKind::LogStart);
        start.log_command = Some("logcat --begin".into());
        start.log_file_name = Some("run-$(loop_index).log".into());
        let mut stop = special_block("log_stop", SpecialKind::LogStop);
        stop.stop_command = Some("logcat --end".into());
        let catalog = catalog(vec![start, stop]);

        let pipeline = pipeline(vec![block_node("n1", "log_start"), block_node("n2", "log_stop")]);
        let port = Arc::new(FakePort::default());

        let (reason, _) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);
        assert_eq!(port.dispatched(), vec!["logcat --begin run-1.log", "logcat --end"]);
    }

    #[tokio::test]
    async fn zero_iteration_loop_succeeds_immediately() {
        let catalog = catalog(vec![command_block("b1", &["never"])]);
        let pipeline = pipeline(vec![PipelineNode::Loop(LoopNode {
            id: "loop".into(),
            loop_count: 0,
            children: vec![block_node("n1", "b1")],
        })]);
        let port = Arc::new(FakePort::default());

        let (reason, events) = run_collect(Arc::clone(&port), &pipeline, &catalog, CancellationToken::new()).await;
        assert_eq!(reason, TerminalReason::Completed);

        let stats = final_stats(&events);
        let loop_stats = stats.get("loop").expect("loop stats");
        assert_eq!(loop_stats.status, NodeStatus::Success);
        assert_eq!(loop_stats.current_iteration, Some(0));
        assert_eq!(loop_stats.total_iterations, Some(0));
        assert!(port.dispatched().is_empty());
    }
}
