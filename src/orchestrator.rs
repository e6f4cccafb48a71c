//! Workflow orchestration.
//!
//! Inspect, plan, then execute step by step. Every request holds its target's
//! FIFO lock for the whole run, so same-target requests never interleave and
//! each one starts from whatever state the previous one left behind. Requests
//! for different targets share nothing but the lock table and channel cache.
//!
//! No workflow position is persisted: rerunning an interrupted operation
//! re-inspects the target and the plan's settled states skip finished work.
//! Rotations keep no state change to observe, so their commands key their
//! progress on the caller's `rotation_tag` instead.
use crate::channel::{AdminChannel, ChannelRegistry, Connector};
use crate::config::{TargetProfile, WalletConfig};
use crate::engine::{DatabaseType, Dialect};
use crate::error::WalletError;
use crate::executor::{RetryPolicy, StepExecutor, StepOutcome};
use crate::inspect::WalletStateInspector;
use crate::plan::{self, Operation, OperationPlan};
use crate::report::{PlanOutcome, ReconciliationReporter, WorkflowResult};
use crate::util::now_epoch_ms;
use crate::wallet::{MasterKeyEntry, WalletState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Inbound request, from CLI flags or a JSON request file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowRequest {
    pub target: String,
    pub operation: Operation,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub force: bool,
}

/// Cooperative cancellation, checked before each step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// First-come, first-served lock for one target.
#[derive(Default)]
struct TicketLock {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

struct TargetGuard {
    lock: Arc<TicketLock>,
}

impl Drop for TargetGuard {
    fn drop(&mut self) {
        let mut tickets = self
            .lock
            .tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tickets.serving += 1;
        drop(tickets);
        self.lock.turn.notify_all();
    }
}

#[derive(Default)]
struct TargetLocks {
    locks: Mutex<HashMap<String, Arc<TicketLock>>>,
}

impl TargetLocks {
    fn acquire(&self, target: &str) -> TargetGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(target.to_string()).or_default())
        };
        let mut tickets = lock.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = tickets.next;
        tickets.next += 1;
        while tickets.serving != ticket {
            tickets = lock
                .turn
                .wait(tickets)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(tickets);
        TargetGuard { lock }
    }
}

/// Current state of one target, as reported by `tdew status`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub target: String,
    pub db_type: DatabaseType,
    pub state: WalletState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_keys: Option<Vec<MasterKeyEntry>>,
}

/// What a request needs once its target is resolved.
struct Session {
    dialect: Dialect,
    inspector: WalletStateInspector,
    channel: Arc<dyn AdminChannel>,
}

pub struct WorkflowOrchestrator {
    config: WalletConfig,
    registry: ChannelRegistry,
    locks: TargetLocks,
    retry: RetryPolicy,
}

impl WorkflowOrchestrator {
    pub fn new(config: WalletConfig, connector: Arc<dyn Connector>) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            config,
            registry: ChannelRegistry::new(connector),
            locks: TargetLocks::default(),
            retry,
        }
    }

    pub fn run(&self, request: &WorkflowRequest) -> WorkflowResult {
        self.run_with_cancel(request, &CancelToken::default())
    }

    /// Run `request` to completion or first failure, honoring `cancel`
    /// between steps. Always returns a result; failures are inside it.
    pub fn run_with_cancel(&self, request: &WorkflowRequest, cancel: &CancelToken) -> WorkflowResult {
        let started = now_epoch_ms();
        let span = tracing::info_span!(
            "workflow",
            target_name = request.target.as_str(),
            operation = request.operation.as_str()
        );
        let _entered = span.enter();

        if request.force && request.operation != Operation::Remove {
            tracing::warn!("force only applies to remove; ignoring it");
        }
        let force = request.force && request.operation == Operation::Remove;
        let mut outcome = PlanOutcome {
            operation: request.operation,
            params: BTreeMap::new(),
            before_state: None,
            goal: None,
            steps: Vec::new(),
            rejection: None,
            started_at_epoch_ms: started,
        };

        // Only configured targets get a lock entry.
        if let Err(err) = self.config.target(&request.target) {
            tracing::error!(error = %err, "target could not be resolved");
            outcome.rejection = Some(err);
            return ReconciliationReporter::rejected(&request.target, outcome);
        }
        let _guard = self.locks.acquire(&request.target);

        let session = match self.session(&request.target) {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(error = %err, "target could not be resolved");
                outcome.rejection = Some(err);
                return ReconciliationReporter::rejected(&request.target, outcome);
            }
        };
        outcome.params = match self.request_params(request) {
            Ok(params) => params,
            Err(err) => {
                outcome.rejection = Some(err);
                return ReconciliationReporter::rejected(&request.target, outcome);
            }
        };
        let channel = session.channel.as_ref();
        let executor = StepExecutor::new(
            session.dialect,
            &session.inspector,
            self.retry,
            self.config.step_timeout(),
        );
        let reporter = ReconciliationReporter::new(&session.inspector, self.retry);

        let observed = match executor.observe(channel, force) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = %err, "initial inspection failed");
                outcome.rejection = Some(err);
                return ReconciliationReporter::rejected(&request.target, outcome);
            }
        };
        outcome.before_state = Some(observed);

        let plan = match plan::build(request.operation, observed, &outcome.params, force) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(observed = observed.as_str(), error = %err, "no plan");
                outcome.rejection = Some(err);
                return self.finish(&reporter, &request.target, channel, outcome);
            }
        };
        outcome.goal = Some(plan.goal);
        tracing::info!(
            observed = observed.as_str(),
            goal = plan.goal.as_str(),
            steps = plan.steps.len(),
            "plan built"
        );

        for step in &plan.steps {
            if cancel.is_cancelled() {
                tracing::warn!(ordinal = step.ordinal, "workflow cancelled");
                outcome.steps.push(StepOutcome::cancelled(step));
                break;
            }
            let step_outcome = executor.execute(channel, step, plan.force);
            let proceed = step_outcome.outcome.is_ok();
            outcome.steps.push(step_outcome);
            if !proceed {
                break;
            }
        }
        self.finish(&reporter, &request.target, channel, outcome)
    }

    fn finish(
        &self,
        reporter: &ReconciliationReporter<'_>,
        target: &str,
        channel: &dyn AdminChannel,
        outcome: PlanOutcome,
    ) -> WorkflowResult {
        let result = reporter.summarize(target, channel, outcome);
        tracing::info!(
            status = result.status.as_str(),
            after = result.after_state.map_or("unknown", |state| state.as_str()),
            "workflow finished"
        );
        result
    }

    /// Dry run: inspect and plan without executing anything.
    pub fn plan(&self, request: &WorkflowRequest) -> Result<OperationPlan, WalletError> {
        let session = self.session(&request.target)?;
        let params = self.request_params(request)?;
        let force = request.force && request.operation == Operation::Remove;
        let executor = StepExecutor::new(
            session.dialect,
            &session.inspector,
            self.retry,
            self.config.step_timeout(),
        );
        let observed = executor.observe(session.channel.as_ref(), force)?;
        plan::build(request.operation, observed, &params, force)
    }

    /// Inspect `target`, optionally listing its master keys.
    pub fn status(&self, target: &str, with_keys: bool) -> Result<TargetStatus, WalletError> {
        let profile = self.config.target(target)?;
        let session = self.session(target)?;
        let channel = session.channel.as_ref();
        let (state, _) = self
            .retry
            .run("inspect", || session.inspector.inspect(channel));
        let state = state?;
        let master_keys = if with_keys {
            Some(session.inspector.inspect_keys(channel)?)
        } else {
            None
        };
        Ok(TargetStatus {
            target: target.to_string(),
            db_type: profile.db_type,
            state,
            master_keys,
        })
    }

    /// Connect to `target` and classify its keystore once, without retries.
    pub fn test_connection(&self, target: &str) -> Result<WalletState, WalletError> {
        let session = self.session(target)?;
        session.inspector.inspect(session.channel.as_ref())
    }

    /// Close every cached channel. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        let closed = self.registry.close_all();
        tracing::debug!(closed, "channels closed");
        closed
    }

    fn session(&self, target: &str) -> Result<Session, WalletError> {
        let profile: &TargetProfile = self.config.target(target)?;
        let dialect = profile.db_type.dialect()?;
        let inspector = WalletStateInspector::new(
            dialect,
            self.config.status_rules.as_deref(),
            self.config.connection_timeout(),
        )?;
        let channel = self.registry.get_or_connect(target, profile)?;
        Ok(Session {
            dialect,
            inspector,
            channel,
        })
    }

    /// Profile keystore defaults overlaid with the request's parameters.
    fn request_params(
        &self,
        request: &WorkflowRequest,
    ) -> Result<BTreeMap<String, String>, WalletError> {
        let profile = self.config.target(&request.target)?;
        let mut params = profile.keystore.as_params();
        params.extend(
            request
                .parameters
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        Ok(params)
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
