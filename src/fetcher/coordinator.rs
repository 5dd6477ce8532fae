//! Fetch cycle coordinator.
//!
//! One cycle per tenant: for every account, refresh the token, list unread
//! envelopes, and route each envelope through filters and directors. A
//! tenant never has two cycles in flight; a request that finds one running
//! is logged as `cycle_skip` and dropped.
//!
//! Failure isolation:
//! - token refresh or listing failure, timeout, or panic aborts only that account
//! - an envelope that errors or panics is logged and the rest continue

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{FetcherConfig, OrchestratorConfig};
use crate::conversation::{ConversationDriver, ConversationRepo, RunContext};
use crate::error::{Error, ProviderError, StoreError};
use crate::fetcher::background::{BackgroundError, BackgroundTask, ErrorReporter};
use crate::fetcher::status::{CycleOutcome, CycleSummary, FetcherStatus};
use crate::fetcher::tenant::{TenantRegistry, TenantSession};
use crate::llm::LlmBackend;
use crate::logs::LogEntry;
use crate::mail::{Account, EmailEnvelope, FetchOptions, ProviderRegistry};
use crate::pipeline::{Catalog, Filter, FilterSet, select_triggers};
use crate::store::{Collection, Store};
use crate::trace::{SpanDescriptor, SpanKind, SpanOutcome, TraceKind, TraceSeed};
use crate::workspace::WorkspaceStore;

/// Per-account counters for one cycle.
#[derive(Debug, Default)]
struct AccountRun {
    fetched: usize,
    processed: usize,
    failed: usize,
    error: Option<String>,
}

/// Everything loaded once per cycle and shared by every envelope.
struct CycleInputs {
    accounts: Vec<Account>,
    catalog: Catalog,
    filters: FilterSet,
}

pub struct FetchCoordinator {
    registry: Arc<TenantRegistry>,
    providers: ProviderRegistry,
    driver: ConversationDriver,
    config: FetcherConfig,
    reporter: ErrorReporter,
}

impl FetchCoordinator {
    /// Build a coordinator. The receiver must be handed to
    /// `spawn_error_drain` so detached failures reach the fetch log.
    pub fn new(
        store: Arc<dyn Store>,
        workspace: Arc<dyn WorkspaceStore>,
        llm: Arc<dyn LlmBackend>,
        providers: ProviderRegistry,
        config: &OrchestratorConfig,
    ) -> (Arc<Self>, mpsc::Receiver<BackgroundError>) {
        let (reporter, rx) = ErrorReporter::channel();
        let registry = Arc::new(TenantRegistry::new(
            store,
            config.trace.clone(),
            config.retention.clone(),
        ));
        let coordinator = Arc::new(Self {
            registry,
            providers,
            driver: ConversationDriver::new(llm, workspace, config.conversation.clone()),
            config: config.fetcher.clone(),
            reporter,
        });
        (coordinator, rx)
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub async fn status(&self, tenant: &str) -> FetcherStatus {
        self.registry.get_or_create(tenant).await.status().await
    }

    pub async fn logs(&self, tenant: &str) -> Result<Vec<LogEntry>, StoreError> {
        self.registry.get_or_create(tenant).await.log().load().await
    }

    /// Enable the periodic loop: one cycle now, then one every interval.
    /// Starting an active tenant is a no-op.
    pub async fn start(self: &Arc<Self>, tenant: &str) -> FetcherStatus {
        let session = self.registry.get_or_create(tenant).await;
        session.touch().await;
        let Some(generation) = session.activate() else {
            debug!(tenant, "Fetcher already active");
            return session.status().await;
        };

        session
            .log()
            .record(LogEntry::info("fetcher_started", "Periodic fetching enabled").detail(json!({
                "interval_secs": self.config.interval.as_secs(),
            })))
            .await;

        let coordinator = Arc::clone(self);
        let loop_session = Arc::clone(&session);
        tokio::spawn(async move {
            coordinator.schedule_loop(loop_session, generation).await;
        });
        session.status().await
    }

    /// Disable the periodic loop. A cycle already running finishes.
    pub async fn stop(&self, tenant: &str) -> FetcherStatus {
        let session = self.registry.get_or_create(tenant).await;
        session.touch().await;
        if session.deactivate() {
            session.update_status(|s| s.next_cycle_at = None).await;
            session
                .log()
                .record(LogEntry::info("fetcher_stopped", "Periodic fetching disabled"))
                .await;
        }
        session.status().await
    }

    /// Run a cycle in a detached task and return immediately. Errors and
    /// panics go to the background error channel.
    pub fn trigger(self: &Arc<Self>, tenant: &str) {
        let coordinator = Arc::clone(self);
        let tenant = tenant.to_string();
        let cycle_tenant = tenant.clone();
        let handle = tokio::spawn(async move { coordinator.run_cycle(&cycle_tenant).await });

        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => reporter.report(BackgroundError::failed(
                    tenant,
                    BackgroundTask::ManualTrigger,
                    e.to_string(),
                )),
                Err(e) => reporter.report(BackgroundError::panicked(
                    tenant,
                    BackgroundTask::ManualTrigger,
                    e.to_string(),
                )),
            }
        });
    }

    async fn schedule_loop(&self, session: Arc<TenantSession>, generation: u64) {
        let tenant = session.tenant().to_string();
        info!(tenant = %tenant, interval_secs = self.config.interval.as_secs(), "Fetch loop started");

        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = session.stopped() => {}
            }
            if !session.is_current(generation) {
                info!(tenant = %tenant, "Fetch loop stopped");
                return;
            }

            let outcome = AssertUnwindSafe(self.run_cycle(&tenant)).catch_unwind().await;
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => self.reporter.report(BackgroundError::failed(
                    tenant.as_str(),
                    BackgroundTask::Schedule,
                    e.to_string(),
                )),
                Err(panic) => self.reporter.report(BackgroundError::panicked(
                    tenant.as_str(),
                    BackgroundTask::Schedule,
                    panic_message(panic.as_ref()),
                )),
            }
        }
    }

    /// Run one cycle for a tenant, or skip it if one is already in flight.
    pub async fn run_cycle(&self, tenant: &str) -> Result<CycleOutcome, Error> {
        let session = self.registry.get_or_create(tenant).await;
        session.touch().await;

        let Some(_guard) = session.try_begin_cycle() else {
            session
                .log()
                .record(LogEntry::info("cycle_skip", "A fetch cycle is already running"))
                .await;
            return Ok(CycleOutcome::Skipped);
        };

        let started = Utc::now();
        session
            .update_status(|s| s.last_cycle_started_at = Some(started))
            .await;
        info!(tenant, "Fetch cycle started");

        let result = self.run_accounts(&session).await;

        let finished = Utc::now();
        let interval = chrono::Duration::from_std(self.config.interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let active = session.is_active();
        session
            .update_status(|s| {
                s.last_cycle_finished_at = Some(finished);
                s.next_cycle_at = active.then(|| finished + interval);
            })
            .await;

        let summary = result?;
        session
            .log()
            .record(
                LogEntry::info(
                    "cycle_complete",
                    format!(
                        "Fetched {} message(s) across {} account(s)",
                        summary.fetched, summary.accounts
                    ),
                )
                .detail(json!({
                    "accounts": summary.accounts,
                    "failed_accounts": summary.failed_accounts,
                    "fetched": summary.fetched,
                    "processed": summary.processed,
                    "failed": summary.failed,
                    "duration_ms": (finished - started).num_milliseconds(),
                })),
            )
            .await;
        Ok(CycleOutcome::Completed(summary))
    }

    async fn load_inputs(&self, session: &TenantSession) -> Result<CycleInputs, StoreError> {
        let store = session.store();
        let accounts: Vec<Account> = store.load(Collection::Accounts).await?;
        let catalog = Catalog::load(store).await?;
        let filters: Vec<Filter> = store.load(Collection::Filters).await?;
        Ok(CycleInputs {
            accounts,
            catalog,
            filters: FilterSet::compile(&filters),
        })
    }

    async fn run_accounts(&self, session: &TenantSession) -> Result<CycleSummary, Error> {
        let inputs = self.load_inputs(session).await?;
        let mut summary = CycleSummary {
            accounts: inputs.accounts.len(),
            ..Default::default()
        };

        for account in &inputs.accounts {
            let run = self.run_account(session, account, &inputs).await;
            summary.fetched += run.fetched;
            summary.processed += run.processed;
            summary.failed += run.failed;
            if run.error.is_some() {
                summary.failed_accounts += 1;
            }

            let now = Utc::now();
            session
                .update_status(|s| {
                    let status = s.account_mut(account);
                    status.last_run_at = Some(now);
                    status.fetched = run.fetched;
                    status.processed = run.processed;
                    status.failed = run.failed;
                    match run.error {
                        Some(error) => status.last_error = Some(error),
                        None => {
                            status.last_error = None;
                            status.last_success_at = Some(now);
                        }
                    }
                })
                .await;
        }
        Ok(summary)
    }

    async fn run_account(
        &self,
        session: &TenantSession,
        account: &Account,
        inputs: &CycleInputs,
    ) -> AccountRun {
        let tracer = session.tracer();
        let trace_id = tracer
            .begin_trace(
                TraceSeed::new(TraceKind::FetchPass, session.tenant())
                    .account(&account.id)
                    .attribute("provider", account.provider.as_str()),
            )
            .await;

        let mut run = AccountRun::default();
        let fetched = AssertUnwindSafe(self.fetch_account(session, account, &trace_id))
            .catch_unwind()
            .await;
        let failure = match fetched {
            Ok(Ok(envelopes)) => Ok(envelopes),
            Ok(Err(e)) => Err((e.to_string(), false)),
            Err(panic) => Err((
                format!("provider panicked: {}", panic_message(panic.as_ref())),
                true,
            )),
        };
        let envelopes = match failure {
            Ok(envelopes) => envelopes,
            Err((message, panicked)) => {
                session
                    .log()
                    .record(
                        LogEntry::error("account_failed", message.clone())
                            .account(&account.id)
                            .detail(json!({ "provider": account.provider, "panicked": panicked })),
                    )
                    .await;
                tracer.end_trace(&trace_id).await;
                run.error = Some(message);
                return run;
            }
        };
        tracer.end_trace(&trace_id).await;

        run.fetched = envelopes.len();
        for envelope in &envelopes {
            let email_trace = tracer
                .begin_trace(
                    TraceSeed::new(TraceKind::EmailRun, session.tenant())
                        .account(&account.id)
                        .email(&envelope.id)
                        .attribute("subject", envelope.subject.as_str()),
                )
                .await;

            let outcome = AssertUnwindSafe(self.route_envelope(
                session,
                account,
                inputs,
                envelope,
                &email_trace,
            ))
            .catch_unwind()
            .await;

            match outcome {
                Ok(Ok(())) => run.processed += 1,
                Ok(Err(e)) => {
                    run.failed += 1;
                    session
                        .log()
                        .record(
                            LogEntry::error("email_failed", e.to_string())
                                .account(&account.id)
                                .email(&envelope.id),
                        )
                        .await;
                }
                Err(panic) => {
                    run.failed += 1;
                    session
                        .log()
                        .record(
                            LogEntry::error("email_panicked", panic_message(panic.as_ref()))
                                .account(&account.id)
                                .email(&envelope.id),
                        )
                        .await;
                }
            }
            tracer.end_trace(&email_trace).await;
        }

        session
            .log()
            .record(
                LogEntry::info(
                    "account_complete",
                    format!("{} of {} message(s) processed", run.processed, run.fetched),
                )
                .account(&account.id)
                .detail(json!({
                    "fetched": run.fetched,
                    "processed": run.processed,
                    "failed": run.failed,
                })),
            )
            .await;
        run
    }

    /// Refresh the token, persist new credentials, and list unread mail.
    async fn fetch_account(
        &self,
        session: &TenantSession,
        account: &Account,
        trace_id: &str,
    ) -> Result<Vec<EmailEnvelope>, Error> {
        let tracer = session.tracer();
        let adapter = self.providers.get(&account.provider)?;
        let timeout = self.config.provider_timeout;

        let span = tracer
            .begin_span(
                trace_id,
                SpanDescriptor::new(SpanKind::TokenRefresh, "ensure_valid_access_token")
                    .annotate("provider", account.provider.as_str()),
            )
            .await;
        let grant = match tokio::time::timeout(timeout, adapter.ensure_valid_access_token(account)).await {
            Ok(Ok(grant)) => match grant.error.clone() {
                Some(reason) => Err(ProviderError::TokenRefresh {
                    account_id: account.id.clone(),
                    reason,
                }),
                None => Ok(grant),
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::Timeout {
                operation: "token refresh".to_string(),
                timeout,
            }),
        };
        let grant = match grant {
            Ok(grant) => {
                tracer
                    .end_span(trace_id, &span, SpanOutcome::ok().annotate("updated", grant.updated))
                    .await;
                grant
            }
            Err(e) => {
                tracer
                    .end_span(trace_id, &span, SpanOutcome::error(e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        let mut account = account.clone();
        if grant.updated {
            if let Some(credentials) = grant.credentials.clone() {
                account.credentials = credentials;
                self.persist_credentials(session, &account).await;
            }
        }

        let options = FetchOptions {
            max: self.config.max_messages,
            unread_only: self.config.unread_only,
        };
        let span = tracer
            .begin_span(
                trace_id,
                SpanDescriptor::new(SpanKind::ProviderFetch, "fetch_unread")
                    .annotate("max", options.max),
            )
            .await;
        let listed = match tokio::time::timeout(
            timeout,
            adapter.fetch_unread(&account, &grant.access_token, options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation: "fetch unread".to_string(),
                timeout,
            }),
        };
        match listed {
            Ok(mut envelopes) => {
                envelopes.truncate(options.max);
                tracer
                    .end_span(
                        trace_id,
                        &span,
                        SpanOutcome::ok().annotate("count", envelopes.len()),
                    )
                    .await;
                debug!(tenant = session.tenant(), account_id = %account.id, count = envelopes.len(), "Listed unread mail");
                Ok(envelopes)
            }
            Err(e) => {
                tracer
                    .end_span(trace_id, &span, SpanOutcome::error(e.to_string()))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Write refreshed credentials back to the accounts collection. The
    /// in-memory token stays usable even if this fails.
    async fn persist_credentials(&self, session: &TenantSession, account: &Account) {
        let store = session.store();
        let result: Result<(), StoreError> = async {
            let mut accounts: Vec<Account> = store.load(Collection::Accounts).await?;
            if let Some(stored) = accounts.iter_mut().find(|a| a.id == account.id) {
                stored.credentials = account.credentials.clone();
                store.save(Collection::Accounts, &accounts).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                session
                    .log()
                    .record(LogEntry::info("token_refreshed", "Persisted refreshed credentials").account(&account.id))
                    .await;
            }
            Err(e) => {
                warn!(tenant = session.tenant(), account_id = %account.id, error = %e, "Failed to persist refreshed credentials");
                session
                    .log()
                    .record(
                        LogEntry::warn("token_persist_failed", e.to_string()).account(&account.id),
                    )
                    .await;
            }
        }
    }

    /// Filters, director selection, and one driver run per selected director.
    async fn route_envelope(
        &self,
        session: &TenantSession,
        account: &Account,
        inputs: &CycleInputs,
        envelope: &EmailEnvelope,
        trace_id: &str,
    ) -> Result<(), Error> {
        let tracer = session.tracer();

        let span = tracer
            .begin_span(
                trace_id,
                SpanDescriptor::new(SpanKind::FilterEvaluation, "filters")
                    .annotate("filters", inputs.filters.len()),
            )
            .await;
        let evaluations = inputs.filters.evaluate(envelope);
        let matched: Vec<&str> = evaluations
            .iter()
            .filter(|e| e.matched)
            .map(|e| e.filter.id.as_str())
            .collect();
        tracer
            .end_span(trace_id, &span, SpanOutcome::ok().annotate("matched", json!(matched)))
            .await;

        let span = tracer
            .begin_span(
                trace_id,
                SpanDescriptor::new(SpanKind::DirectorSelection, "select_triggers"),
            )
            .await;
        let selected = select_triggers(&evaluations);
        tracer
            .end_span(trace_id, &span, SpanOutcome::ok().annotate("selected", json!(selected)))
            .await;

        if selected.is_empty() {
            debug!(tenant = session.tenant(), email_id = %envelope.id, "No filter matched");
            return Ok(());
        }
        session
            .log()
            .record(
                LogEntry::info(
                    "directors_selected",
                    format!("{} director run(s) for \"{}\"", selected.len(), envelope.subject),
                )
                .account(&account.id)
                .email(&envelope.id)
                .detail(json!({ "directors": selected })),
            )
            .await;

        let repo = ConversationRepo::new(session.store().clone());
        let mut arena = repo.load().await?;
        let ctx = RunContext {
            tenant: session.tenant(),
            repo: &repo,
            catalog: &inputs.catalog,
            tracer,
            trace_id,
            log: session.log(),
            account_id: &account.id,
            envelope,
        };

        for director_id in &selected {
            let Some(director) = inputs.catalog.director(director_id) else {
                session
                    .log()
                    .record(
                        LogEntry::warn("director_not_found", format!("Filter targets unknown director {director_id}"))
                            .account(&account.id)
                            .email(&envelope.id)
                            .director(director_id),
                    )
                    .await;
                continue;
            };
            if !director.enabled {
                session
                    .log()
                    .record(
                        LogEntry::info("director_disabled", format!("Director {} is disabled", director.name))
                            .account(&account.id)
                            .email(&envelope.id)
                            .director(director_id),
                    )
                    .await;
                continue;
            }

            let outcome = self.driver.run_director(&ctx, &mut arena, director).await?;
            debug!(
                thread_id = %outcome.thread_id,
                status = %outcome.status,
                iterations = outcome.iterations,
                "Director run finished"
            );
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        error!("Panic with non-string payload");
        "panic with non-string payload".to_string()
    }
}
