//! Director conversation driver.
//!
//! Runs one director thread through a bounded tool-calling loop against the
//! LLM backend. Agent-addressed tool calls are routed through the session
//! manager into nested agent runs; everything else gets an error result.
//! A normal exit (including hitting the iteration cap) finalizes the director
//! thread and cascades to its open agent threads. An LLM failure aborts
//! without finalizing.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::ConversationConfig;
use crate::conversation::arena::{ConversationRepo, ThreadArena};
use crate::conversation::sessions::{AgentSession, SessionManager};
use crate::conversation::thread::{ConversationThread, ThreadStatus};
use crate::error::{Error, LlmError};
use crate::llm::{
    AgentInvocation, ChatMessage, ConversationContext, ConversationRequest, ConversationResponse,
    ConversationRole, LlmBackend, ResolvedToolCall, RoleCapabilities, ToolCallKind,
    ToolDefinition, agent_tool_definition, not_implemented_result,
};
use crate::logs::{FetchLog, LogEntry};
use crate::mail::EmailEnvelope;
use crate::pipeline::{Agent, Catalog, Director};
use crate::trace::{SpanDescriptor, SpanKind, SpanOutcome, TraceRecorder};
use crate::workspace::{NewWorkspaceItem, Provenance, WorkspaceStore, tags};

/// Everything one email run shares across its director conversations.
pub struct RunContext<'a> {
    pub tenant: &'a str,
    pub repo: &'a ConversationRepo,
    pub catalog: &'a Catalog,
    pub tracer: &'a TraceRecorder,
    pub trace_id: &'a str,
    pub log: &'a FetchLog,
    pub account_id: &'a str,
    pub envelope: &'a EmailEnvelope,
}

/// Result of one director run.
#[derive(Debug, Clone)]
pub struct DirectorOutcome {
    pub thread_id: String,
    pub status: ThreadStatus,
    pub iterations: u32,
    /// Agent threads finalized by the cascade.
    pub cascaded: usize,
    /// The loop stopped because it reached the iteration cap.
    pub hit_cap: bool,
}

pub struct ConversationDriver {
    llm: Arc<dyn LlmBackend>,
    workspace: Arc<dyn WorkspaceStore>,
    sessions: SessionManager,
    config: ConversationConfig,
}

impl ConversationDriver {
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        workspace: Arc<dyn WorkspaceStore>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            llm,
            workspace,
            sessions: SessionManager::new(config.session_timeout_minutes),
            config,
        }
    }

    /// Create a director thread for the context's email and drive it to
    /// completion or failure.
    pub async fn run_director(
        &self,
        ctx: &RunContext<'_>,
        arena: &mut ThreadArena,
        director: &Director,
    ) -> Result<DirectorOutcome, Error> {
        let now = Utc::now();
        let mut thread = ConversationThread::new_director(director, ctx.envelope, ctx.trace_id, now);
        let thread_id = thread.id.clone();

        let Some(binding) = ctx
            .catalog
            .resolve_binding(&director.prompt_id, &director.model_config_id)
        else {
            let message = format!(
                "director {} has no resolvable prompt {} / model config {}",
                director.id, director.prompt_id, director.model_config_id
            );
            thread.fail(message.clone(), now);
            arena.insert(thread)?;
            self.persist(ctx, arena).await;
            ctx.log
                .record(
                    LogEntry::error("director_config_missing", message)
                        .account(ctx.account_id)
                        .email(&ctx.envelope.id)
                        .director(&director.id),
                )
                .await;
            return Ok(DirectorOutcome {
                thread_id,
                status: ThreadStatus::Failed,
                iterations: 0,
                cascaded: 0,
                hit_cap: false,
            });
        };

        thread.provider = Some(binding.model.provider.clone());
        thread.push_message(ChatMessage::system(binding.prompt.system.clone()));
        thread.push_message(ChatMessage::user(ctx.envelope.render_for_prompt()));
        arena.insert(thread)?;
        self.persist(ctx, arena).await;
        info!(tenant = ctx.tenant, thread_id = %thread_id, director_id = %director.id, email_id = %ctx.envelope.id, "Director run started");

        let tools: Vec<ToolDefinition> = ctx
            .catalog
            .agents_for(director)
            .into_iter()
            .map(agent_tool_definition)
            .collect();

        let mut iterations = 0u32;
        let mut hit_cap = false;
        loop {
            if iterations >= self.config.max_iterations {
                hit_cap = true;
                warn!(thread_id = %thread_id, max_iterations = self.config.max_iterations, "Director hit iteration cap");
                break;
            }
            iterations += 1;

            let request = ConversationRequest {
                messages: arena.require_mut(&thread_id)?.messages.clone(),
                model_config: binding.model.clone(),
                role: ConversationRole::Director,
                capabilities: RoleCapabilities::for_role(ConversationRole::Director),
                tools: tools.clone(),
                context: self.request_context(ctx, &thread_id, director, None),
            };

            let span_name = format!("{} #{iterations}", director.name);
            let response = match self.step(ctx, request, "", &span_name).await {
                Ok(response) => response,
                Err(e) => {
                    let message = format!("LLM step {iterations} failed: {e}");
                    arena.require_mut(&thread_id)?.fail(message.clone(), Utc::now());
                    self.persist(ctx, arena).await;
                    ctx.log
                        .record(
                            LogEntry::error("director_failed", message)
                                .account(ctx.account_id)
                                .email(&ctx.envelope.id)
                                .director(&director.id)
                                .detail(json!({ "thread_id": thread_id })),
                        )
                        .await;
                    return Ok(DirectorOutcome {
                        thread_id,
                        status: ThreadStatus::Failed,
                        iterations,
                        cascaded: 0,
                        hit_cap: false,
                    });
                }
            };

            let tool_calls = response.tool_calls.clone();
            arena
                .require_mut(&thread_id)?
                .push_message(ChatMessage::assistant(
                    response.assistant_message,
                    tool_calls.clone(),
                ));
            if tool_calls.is_empty() {
                break;
            }

            for call in &tool_calls {
                let resolved = ResolvedToolCall::resolve(call);
                if let Some(problem) = &resolved.argument_error {
                    warn!(thread_id = %thread_id, tool = %resolved.name, "{problem}");
                    arena
                        .require_mut(&thread_id)?
                        .record_error(format!("{}: {problem}", resolved.name), Utc::now());
                }
                let result = self
                    .dispatch(ctx, arena, director, &thread_id, &resolved)
                    .await?;
                arena
                    .require_mut(&thread_id)?
                    .push_message(ChatMessage::tool_result(&resolved.call_id, result.to_string()));
            }
            self.persist(ctx, arena).await;
        }

        self.finalize(ctx, arena, director, &thread_id, iterations, hit_cap)
            .await
    }

    /// Finalize, cascade, and write the director's output artifact.
    async fn finalize(
        &self,
        ctx: &RunContext<'_>,
        arena: &mut ThreadArena,
        director: &Director,
        thread_id: &str,
        iterations: u32,
        hit_cap: bool,
    ) -> Result<DirectorOutcome, Error> {
        let span = ctx
            .tracer
            .begin_span(
                ctx.trace_id,
                SpanDescriptor::new(SpanKind::StateUpdate, "finalize")
                    .annotate("thread_id", thread_id)
                    .annotate("director_id", director.id.as_str()),
            )
            .await;

        let cascaded = arena.finalize_director(thread_id, Utc::now())?;
        let output = arena
            .get(thread_id)
            .and_then(|t| t.last_assistant_content())
            .map(str::to_string);

        if let Some(content) = output {
            let item = NewWorkspaceItem::markdown(
                format!("{}: {}", director.name, ctx.envelope.subject),
                content,
            )
            .with_tag(tags::DIRECTOR_OUTPUT)
            .with_provenance(Provenance {
                email_id: Some(ctx.envelope.id.clone()),
                director_id: Some(director.id.clone()),
                agent_id: None,
                tool: Some("finalize".to_string()),
            });
            if let Err(e) = self.workspace.create(ctx.tenant, item).await {
                warn!(thread_id, error = %e, "Failed to write director output");
                arena
                    .require_mut(thread_id)?
                    .record_error(format!("workspace write failed: {e}"), Utc::now());
            }
        }
        self.persist(ctx, arena).await;

        ctx.tracer
            .end_span(
                ctx.trace_id,
                &span,
                SpanOutcome::ok()
                    .annotate("cascaded", cascaded)
                    .annotate("hit_cap", hit_cap),
            )
            .await;
        ctx.log
            .record(
                LogEntry::info(
                    "director_completed",
                    format!("Director {} finished after {iterations} iteration(s)", director.name),
                )
                .account(ctx.account_id)
                .email(&ctx.envelope.id)
                .director(&director.id)
                .detail(json!({
                    "thread_id": thread_id,
                    "iterations": iterations,
                    "cascaded": cascaded,
                    "hit_cap": hit_cap,
                })),
            )
            .await;

        Ok(DirectorOutcome {
            thread_id: thread_id.to_string(),
            status: ThreadStatus::Completed,
            iterations,
            cascaded,
            hit_cap,
        })
    }

    /// Execute one tool call and produce its result payload.
    async fn dispatch(
        &self,
        ctx: &RunContext<'_>,
        arena: &mut ThreadArena,
        director: &Director,
        thread_id: &str,
        call: &ResolvedToolCall,
    ) -> Result<Value, Error> {
        let span = ctx
            .tracer
            .begin_span(
                ctx.trace_id,
                SpanDescriptor::new(SpanKind::ToolCall, call.name.as_str())
                    .with_request(call.arguments.clone())
                    .annotate("thread_id", thread_id),
            )
            .await;

        let result = match &call.kind {
            ToolCallKind::Unsupported { name } => {
                debug!(thread_id, tool = %name, "Unsupported tool call");
                not_implemented_result()
            }
            ToolCallKind::Agent(invocation) => {
                let agent = ctx
                    .catalog
                    .agent(&invocation.agent_id)
                    .filter(|_| director.agent_ids.contains(&invocation.agent_id));
                match agent {
                    None => json!({ "error": "agent not found" }),
                    Some(agent) => {
                        let ensured = self.sessions.ensure_agent_thread(
                            arena,
                            ctx.catalog,
                            thread_id,
                            agent,
                            invocation.session_id.as_deref(),
                            Utc::now(),
                        );
                        match ensured {
                            Err(refusal) => {
                                info!(thread_id, agent_id = %agent.id, reason = %refusal.reason, "Agent session refused");
                                refusal.to_tool_result()
                            }
                            Ok(session) => {
                                self.run_agent(ctx, arena, director, agent, &session, invocation, &call.name, &span)
                                    .await?
                            }
                        }
                    }
                }
            }
        };

        let outcome = if result.get("error").is_some() {
            SpanOutcome::error(result["error"].as_str().unwrap_or("tool error"))
        } else {
            SpanOutcome::ok()
        };
        ctx.tracer
            .end_span(ctx.trace_id, &span, outcome.with_response(result.clone()))
            .await;
        Ok(result)
    }

    /// Run an agent's nested conversation. Agents get no tools.
    #[allow(clippy::too_many_arguments)]
    async fn run_agent(
        &self,
        ctx: &RunContext<'_>,
        arena: &mut ThreadArena,
        director: &Director,
        agent: &Agent,
        session: &AgentSession,
        invocation: &AgentInvocation,
        tool_name: &str,
        parent_span: &str,
    ) -> Result<Value, Error> {
        let thread_id = session.thread_id.as_str();
        let timeout_minutes = self.sessions.timeout_for(agent);
        arena
            .require_mut(thread_id)?
            .push_message(ChatMessage::user(invocation.message.clone()));

        let mut iterations = 0u32;
        while iterations < self.config.max_iterations {
            iterations += 1;
            let request = ConversationRequest {
                messages: arena.require_mut(thread_id)?.messages.clone(),
                model_config: session.binding.model.clone(),
                role: ConversationRole::Agent,
                capabilities: RoleCapabilities::for_role(ConversationRole::Agent),
                tools: Vec::new(),
                context: self.request_context(ctx, thread_id, director, Some(&agent.id)),
            };

            let span_name = format!("{} #{iterations}", agent.name);
            let response = match self.step(ctx, request, parent_span, &span_name).await {
                Ok(response) => response,
                Err(e) => {
                    let message = format!("agent LLM step {iterations} failed: {e}");
                    arena.require_mut(thread_id)?.fail(message.clone(), Utc::now());
                    warn!(thread_id, agent_id = %agent.id, error = %e, "Agent run failed");
                    return Ok(json!({
                        "error": "agent run failed",
                        "agent_id": agent.id,
                        "thread_id": thread_id,
                        "message": message,
                    }));
                }
            };

            let tool_calls = response.tool_calls.clone();
            let thread = arena.require_mut(thread_id)?;
            thread.push_message(ChatMessage::assistant(
                response.assistant_message,
                tool_calls.clone(),
            ));
            if tool_calls.is_empty() {
                break;
            }
            for call in &tool_calls {
                thread.push_message(ChatMessage::tool_result(
                    &call.id,
                    not_implemented_result().to_string(),
                ));
            }
        }

        let thread = arena.require_mut(thread_id)?;
        thread.touch(Utc::now(), timeout_minutes);
        let result = thread.last_assistant_content().unwrap_or_default().to_string();
        let session_id = thread.session_id.clone();

        if !result.is_empty() {
            let item = NewWorkspaceItem::markdown(format!("{}: {}", agent.name, ctx.envelope.subject), result.clone())
                .with_tag(tags::AGENT_OUTPUT)
                .with_provenance(Provenance {
                    email_id: Some(ctx.envelope.id.clone()),
                    director_id: Some(director.id.clone()),
                    agent_id: Some(agent.id.clone()),
                    tool: Some(tool_name.to_string()),
                });
            if let Err(e) = self.workspace.create(ctx.tenant, item).await {
                warn!(thread_id, error = %e, "Failed to write agent output");
                arena
                    .require_mut(thread_id)?
                    .record_error(format!("workspace write failed: {e}"), Utc::now());
            }
        }

        Ok(json!({
            "agent_id": agent.id,
            "session_id": session_id,
            "thread_id": thread_id,
            "result": result,
        }))
    }

    /// One LLM call raced against the step deadline, traced as a span.
    async fn step(
        &self,
        ctx: &RunContext<'_>,
        request: ConversationRequest,
        parent_span: &str,
        name: &str,
    ) -> Result<ConversationResponse, LlmError> {
        let mut descriptor = SpanDescriptor::new(SpanKind::LlmCall, name)
            .child_of(parent_span)
            .annotate("backend", self.llm.name())
            .annotate("model", request.model_config.model.as_str());
        if ctx.tracer.captures_payloads() {
            descriptor = descriptor.with_request(serde_json::to_value(&request)?);
        }
        let span = ctx.tracer.begin_span(ctx.trace_id, descriptor).await;

        let timeout = self.config.step_timeout;
        let result = match tokio::time::timeout(timeout, self.llm.run(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout { timeout }),
        };

        let outcome = match &result {
            Ok(response) => SpanOutcome::ok()
                .with_response(response.response.clone())
                .annotate("tool_calls", response.tool_calls.len())
                .annotate("input_tokens", response.usage.input_tokens)
                .annotate("output_tokens", response.usage.output_tokens),
            Err(e) => SpanOutcome::error(e.to_string()),
        };
        ctx.tracer.end_span(ctx.trace_id, &span, outcome).await;
        result
    }

    fn request_context(
        &self,
        ctx: &RunContext<'_>,
        thread_id: &str,
        director: &Director,
        agent_id: Option<&str>,
    ) -> ConversationContext {
        ConversationContext {
            tenant: ctx.tenant.to_string(),
            thread_id: thread_id.to_string(),
            trace_id: ctx.trace_id.to_string(),
            email_id: ctx.envelope.id.clone(),
            director_id: director.id.clone(),
            agent_id: agent_id.map(str::to_string),
        }
    }

    async fn persist(&self, ctx: &RunContext<'_>, arena: &ThreadArena) {
        if let Err(e) = ctx.repo.save(arena).await {
            warn!(tenant = ctx.tenant, error = %e, "Failed to persist conversations");
        }
    }
}
