use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collaborator::{Action, Collaborator, DecisionRequest, ToolCallRequest};
use super::{ExhaustionReason, OrchestrationRun, RunState, Step, ToolCallStep};
use crate::budget::{BudgetCheckResult, StepBudget};
use crate::error::{RunError, ToolError};
use crate::snapshot::EngineSnapshot;
use crate::streaming::{format_duration, EventSink, RunReport, StreamEvent};
use crate::tools::ToolSpec;

/// Shared, read-only collaborators of one run.
#[derive(Clone)]
pub struct RunContext {
    pub snapshot: Arc<EngineSnapshot>,
    pub collaborator: Arc<dyn Collaborator>,
    pub tool_timeout: Duration,
    pub max_identical_calls: u32,
    pub events: EventSink,
    pub cancel: CancellationToken,
}

/// Drive `run` from `Init` to a terminal state and return its report.
///
/// The final event on the sink is always `run_finished`.
pub async fn drive(run: &mut OrchestrationRun, ctx: &RunContext) -> RunReport {
    let started = Instant::now();
    let mut budget = StepBudget::new(run.max_steps, ctx.max_identical_calls);
    run.max_steps = budget.limit();
    run.state = RunState::Stepping;
    info!(run_id = %run.run_id, max_steps = run.max_steps, "Run started");
    ctx.events.emit(StreamEvent::RunStarted {
        run_id: run.run_id.clone(),
        question: run.question.clone(),
        max_steps: run.max_steps,
        timestamp: run.started_at,
    });

    let tools = ctx.snapshot.registry.specs();
    let mut iteration = 0u32;

    while !run.state.is_terminal() {
        if ctx.cancel.is_cancelled() {
            run.state = RunState::Failed(RunError::Cancelled);
            break;
        }
        match budget.check() {
            BudgetCheckResult::Exhausted => {
                conclude_exhausted(
                    run,
                    ctx,
                    &tools,
                    ExhaustionReason::StepLimit {
                        limit: budget.limit(),
                    },
                )
                .await;
                break;
            }
            BudgetCheckResult::Warning { percent } => {
                warn!(run_id = %run.run_id, percent, "Step budget {}% consumed", percent);
            }
            BudgetCheckResult::Ok => {}
        }

        let action = {
            let request = DecisionRequest {
                run_id: &run.run_id,
                question: &run.question,
                transcript: &run.transcript,
                tools: &tools,
                runbooks: ctx.snapshot.catalog.list_summaries(),
                remaining_steps: budget.remaining(),
            };
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(RunError::Cancelled),
                decided = ctx.collaborator.decide(request) => {
                    decided.map_err(|e| RunError::CollaboratorUnavailable(e.to_string()))
                }
            }
        };

        let (reasoning, calls) = match action {
            Err(e) => {
                run.state = RunState::Failed(e);
                break;
            }
            Ok(Action::FinalAnswer(text)) => {
                run.final_text = Some(text);
                run.state = RunState::Completed;
                break;
            }
            Ok(Action::ToolCalls { reasoning, calls }) => (reasoning, calls),
        };

        let reasoning = reasoning.filter(|r| !r.trim().is_empty());
        if calls.is_empty() {
            // Nothing to run: the reasoning is as final as it gets
            run.final_text = Some(reasoning.unwrap_or_default());
            run.state = RunState::Completed;
            break;
        }
        if let Some(text) = reasoning {
            ctx.events.emit(StreamEvent::Reasoning {
                run_id: run.run_id.clone(),
                text: text.clone(),
            });
            run.transcript.push(Step::Reasoning { text });
        }

        let admitted = budget.admit(calls.len());
        if admitted < calls.len() {
            warn!(
                run_id = %run.run_id,
                requested = calls.len(),
                admitted,
                "Dropping tool calls beyond the remaining budget"
            );
        }
        let mut calls: Vec<ToolCallRequest> = calls.into_iter().take(admitted).collect();

        // Calls up to the limit still run; the run stops once they are recorded
        let mut repeated = None;
        if let Some(position) = budget
            .first_excess_repeat(calls.iter().map(|c| (c.tool.as_str(), &c.arguments)))
        {
            let stuck = &calls[position];
            warn!(run_id = %run.run_id, tool = %stuck.tool, "Collaborator is repeating an identical call");
            repeated = Some(ExhaustionReason::RepeatedCall {
                tool: stuck.tool.clone(),
                times: ctx.max_identical_calls,
            });
            calls.truncate(position);
        }
        if calls.is_empty() {
            if let Some(reason) = repeated.take() {
                conclude_exhausted(run, ctx, &tools, reason).await;
                break;
            }
        }

        iteration += 1;
        let mut pending = Vec::with_capacity(calls.len());
        for call in calls {
            let call_id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", run.tool_call_count() + pending.len() + 1));
            ctx.events.emit(StreamEvent::ToolInvoked {
                run_id: run.run_id.clone(),
                call_id: call_id.clone(),
                iteration,
                tool: call.tool.clone(),
                arguments: call.arguments.clone(),
            });
            budget.record_call(&call.tool, &call.arguments);
            pending.push((call_id, call));
        }

        let dispatched = pending
            .iter()
            .map(|(_, call)| dispatch(&ctx.snapshot, call, ctx.tool_timeout));
        let outcomes = tokio::select! {
            _ = ctx.cancel.cancelled() => None,
            outcomes = join_all(dispatched) => Some(outcomes),
        };
        let Some(outcomes) = outcomes else {
            info!(run_id = %run.run_id, "Run cancelled with tool calls in flight");
            run.state = RunState::Failed(RunError::Cancelled);
            break;
        };

        for ((call_id, call), (outcome, latency)) in pending.into_iter().zip(outcomes) {
            if let Err(e) = &outcome {
                debug!(run_id = %run.run_id, tool = %call.tool, "Tool call failed: {}", e);
            }
            let step = ToolCallStep {
                call_id,
                iteration,
                tool: call.tool,
                arguments: call.arguments,
                outcome,
                latency,
            };
            ctx.events.emit(StreamEvent::tool_result(&run.run_id, &step));
            run.transcript.push(Step::ToolCall(step));
        }

        if let Some(reason) = repeated {
            conclude_exhausted(run, ctx, &tools, reason).await;
            break;
        }
    }

    run.elapsed = started.elapsed();
    log_statistics(run);

    let report = RunReport::from_run(run);
    if let Some(text) = &run.final_text {
        ctx.events.emit(StreamEvent::FinalAnswer {
            run_id: run.run_id.clone(),
            text: text.clone(),
            partial: matches!(run.state, RunState::BudgetExhausted(_)),
        });
    }
    ctx.events.emit(StreamEvent::RunFinished {
        run_id: run.run_id.clone(),
        report: report.clone(),
    });
    report
}

async fn dispatch(
    snapshot: &EngineSnapshot,
    call: &ToolCallRequest,
    timeout: Duration,
) -> (Result<String, ToolError>, Duration) {
    let started = Instant::now();
    let outcome = match snapshot.registry.resolve(&call.tool) {
        Ok(tool) => tool.invoke(call.arguments.clone(), timeout).await,
        Err(e) => Err(e),
    };
    (outcome, started.elapsed())
}

/// Ask once more, with no budget left, for the best answer the transcript supports.
async fn conclude_exhausted(
    run: &mut OrchestrationRun,
    ctx: &RunContext,
    tools: &[ToolSpec],
    reason: ExhaustionReason,
) {
    info!(run_id = %run.run_id, "{}", reason);
    let request = DecisionRequest {
        run_id: &run.run_id,
        question: &run.question,
        transcript: &run.transcript,
        tools,
        runbooks: ctx.snapshot.catalog.list_summaries(),
        remaining_steps: 0,
    };
    let conclusion = tokio::select! {
        _ = ctx.cancel.cancelled() => None,
        decided = ctx.collaborator.decide(request) => Some(decided),
    };
    let Some(conclusion) = conclusion else {
        run.state = RunState::Failed(RunError::Cancelled);
        return;
    };
    let text = match conclusion {
        Ok(Action::FinalAnswer(text)) if !text.trim().is_empty() => text,
        Ok(_) => fallback_summary(run, &reason),
        Err(e) => {
            warn!(run_id = %run.run_id, "Could not obtain a concluding answer: {}", e);
            fallback_summary(run, &reason)
        }
    };
    run.final_text = Some(text);
    run.state = RunState::BudgetExhausted(reason);
}

fn fallback_summary(run: &OrchestrationRun, reason: &ExhaustionReason) -> String {
    let mut lines = vec![format!(
        "Diagnosis incomplete: {}. {} tool calls were made:",
        reason,
        run.tool_call_count()
    )];
    for call in run.tool_calls() {
        let status = match &call.outcome {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("failed ({})", e.kind()),
        };
        lines.push(format!("- {} {}: {}", call.tool, call.arguments, status));
    }
    lines.join("\n")
}

fn log_statistics(run: &OrchestrationRun) {
    let total: Duration = run.tool_calls().map(|c| c.latency).sum();
    let failed = run.tool_calls().filter(|c| c.outcome.is_err()).count();
    info!(
        run_id = %run.run_id,
        state = run.state.as_str(),
        tool_calls = run.tool_call_count(),
        failed,
        tool_time = %format_duration(total),
        elapsed = %format_duration(run.elapsed),
        "Run finished"
    );
    if let Some(slowest) = run.tool_calls().max_by_key(|c| c.latency) {
        debug!(
            run_id = %run.run_id,
            tool = %slowest.tool,
            latency = %format_duration(slowest.latency),
            "Slowest tool call"
        );
    }
}
