//! Agent coordinator: policy-gated direct messaging and bounded-concurrency
//! task batches, built on the event bus and the blackboard.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::blackboard::{Blackboard, UpdateArtifact};
use crate::error::CoordinatorError;
use crate::events::EventBus;

/// Workspace that receives direct-message audit artifacts.
const AUDIT_WORKSPACE: &str = "agent-coordination";

/// One permitted direct-messaging route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRoute {
    pub from: String,
    pub to: String,
}

/// Direct-messaging policy. With `default_allow` unset, only routes on the
/// allow-list may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingPolicy {
    pub default_allow: bool,
    pub allowed_routes: Vec<MessageRoute>,
}

impl Default for MessagingPolicy {
    fn default() -> Self {
        Self {
            default_allow: true,
            allowed_routes: Vec::new(),
        }
    }
}

impl MessagingPolicy {
    pub fn deny_by_default() -> Self {
        Self {
            default_allow: false,
            allowed_routes: Vec::new(),
        }
    }

    pub fn allow_route(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.allowed_routes.push(MessageRoute {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.default_allow
            || self
                .allowed_routes
                .iter()
                .any(|route| route.from == from && route.to == to)
    }
}

/// Envelope delivered to an agent inbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub id: String,
    pub run_id: Option<String>,
    pub correlation_id: Option<String>,
    pub from: String,
    pub to: String,
    pub message_type: String,
    pub payload: Value,
    pub sent_at: chrono::DateTime<chrono::Utc>,
}

/// Options for [`AgentCoordinator::send_direct_message`].
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    pub run_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// An async inbox handler. Use [`inbox_handler`] to adapt a closure.
pub type InboxHandler = Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapt an async closure into an [`InboxHandler`].
pub fn inbox_handler<F, Fut>(f: F) -> InboxHandler
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Handle returned by [`AgentCoordinator::subscribe_inbox`].
#[derive(Debug, Clone)]
pub struct InboxSubscription {
    agent_id: String,
    id: u64,
}

/// One task submitted to [`AgentCoordinator::coordinate_parallel`].
pub struct CoordinatedTask {
    pub task_id: String,
    future: BoxFuture<'static, Result<Value, anyhow::Error>>,
}

impl CoordinatedTask {
    pub fn new<F>(task_id: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
    {
        Self {
            task_id: task_id.into(),
            future: future.boxed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Fulfilled,
    Rejected,
}

/// Per-task result of a batch, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub value: Option<Value>,
    pub reason: Option<String>,
}

/// Options for [`AgentCoordinator::coordinate_parallel`].
#[derive(Debug, Clone)]
pub struct CoordinateOptions {
    /// Maximum tasks in flight at any instant.
    pub concurrency: usize,
    pub run_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl Default for CoordinateOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            run_id: None,
            correlation_id: None,
        }
    }
}

impl CoordinateOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }
}

/// The agent coordinator.
pub struct AgentCoordinator {
    bus: Arc<EventBus>,
    blackboard: Arc<Blackboard>,
    policy: RwLock<MessagingPolicy>,
    roster: RwLock<BTreeSet<String>>,
    inboxes: RwLock<HashMap<String, Vec<(u64, InboxHandler)>>>,
    next_inbox_id: AtomicU64,
}

impl AgentCoordinator {
    pub fn new(bus: Arc<EventBus>, blackboard: Arc<Blackboard>) -> Self {
        Self::with_policy(bus, blackboard, MessagingPolicy::default())
    }

    pub fn with_policy(
        bus: Arc<EventBus>,
        blackboard: Arc<Blackboard>,
        policy: MessagingPolicy,
    ) -> Self {
        Self {
            bus,
            blackboard,
            policy: RwLock::new(policy),
            roster: RwLock::new(BTreeSet::new()),
            inboxes: RwLock::new(HashMap::new()),
            next_inbox_id: AtomicU64::new(1),
        }
    }

    pub fn set_policy(&self, policy: MessagingPolicy) {
        *self.policy.write() = policy;
    }

    // -----------------------------------------------------------------------
    // Roster
    // -----------------------------------------------------------------------

    /// Add an agent. Returns whether it was new.
    pub fn register_agent(&self, agent_id: impl Into<String>) -> bool {
        self.roster.write().insert(agent_id.into())
    }

    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        self.roster.write().remove(agent_id)
    }

    /// Deduplicated roster, sorted.
    pub fn list_active_agents(&self) -> Vec<String> {
        self.roster.read().iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Direct messaging
    // -----------------------------------------------------------------------

    /// Fan-out subscription for one agent's inbox.
    pub fn subscribe_inbox(&self, agent_id: impl Into<String>, handler: InboxHandler) -> InboxSubscription {
        let agent_id = agent_id.into();
        let id = self.next_inbox_id.fetch_add(1, Ordering::Relaxed);
        self.inboxes
            .write()
            .entry(agent_id.clone())
            .or_default()
            .push((id, handler));
        InboxSubscription { agent_id, id }
    }

    pub fn unsubscribe_inbox(&self, subscription: &InboxSubscription) -> bool {
        let mut inboxes = self.inboxes.write();
        let Some(handlers) = inboxes.get_mut(&subscription.agent_id) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            inboxes.remove(&subscription.agent_id);
        }
        removed
    }

    /// Send a policy-checked direct message. A disallowed route fails with
    /// `route_not_allowed` before any delivery or event emission. An allowed
    /// one is handed to the target's inbox subscribers, mirrored as
    /// `agent:message:sent` / `agent:message:received` on the bus, and
    /// recorded as an immutable audit artifact on the blackboard.
    pub async fn send_direct_message(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: Value,
        options: MessageOptions,
    ) -> Result<AgentMessage, CoordinatorError> {
        if !self.policy.read().allows(from, to) {
            return Err(CoordinatorError::RouteNotAllowed {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let message = AgentMessage {
            id: Uuid::new_v4().to_string(),
            run_id: options.run_id,
            correlation_id: options.correlation_id,
            from: from.to_string(),
            to: to.to_string(),
            message_type: message_type.to_string(),
            payload,
            sent_at: chrono::Utc::now(),
        };

        let handlers: Vec<InboxHandler> = self
            .inboxes
            .read()
            .get(to)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(message.clone()).await;
        }

        let event_payload = json!({
            "message_id": message.id,
            "from": message.from,
            "to": message.to,
            "message_type": message.message_type,
            "run_id": message.run_id,
            "correlation_id": message.correlation_id,
        });
        self.bus
            .publish("agent:message:sent", event_payload.clone())
            .await?;
        self.bus
            .publish("agent:message:received", event_payload)
            .await?;

        self.blackboard
            .update_artifact(
                &format!("message-audit:{}", message.id),
                serde_json::to_value(&message).unwrap_or(Value::Null),
                from,
                "agent-message",
                UpdateArtifact::in_workspace(AUDIT_WORKSPACE).expecting(0),
            )
            .await?;

        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Parallel coordination
    // -----------------------------------------------------------------------

    /// Run `tasks` with at most `options.concurrency` in flight. The result
    /// vec is ordered by submission, not completion; each entry records the
    /// task's fulfillment or rejection. The whole batch is bracketed by
    /// `coordination:batch:start` / `coordination:batch:complete`.
    pub async fn coordinate_parallel(
        &self,
        tasks: Vec<CoordinatedTask>,
        options: CoordinateOptions,
    ) -> Result<Vec<TaskOutcome>, CoordinatorError> {
        let task_count = tasks.len();
        let batch_meta = json!({
            "task_count": task_count,
            "run_id": options.run_id,
            "correlation_id": options.correlation_id,
        });
        self.bus
            .publish("coordination:batch:start", batch_meta.clone())
            .await?;

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut handles = Vec::with_capacity(task_count);
        for task in tasks {
            let semaphore = Arc::clone(&semaphore);
            let future = task.future;
            handles.push((
                task.task_id,
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| anyhow::anyhow!("task pool closed"))?;
                    future.await
                }),
            ));
        }

        // Awaiting in submission order pins the result slots regardless of
        // which task finishes first.
        let mut outcomes = Vec::with_capacity(task_count);
        for (task_id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(value)) => TaskOutcome {
                    task_id,
                    status: TaskStatus::Fulfilled,
                    value: Some(value),
                    reason: None,
                },
                Ok(Err(reason)) => TaskOutcome {
                    task_id,
                    status: TaskStatus::Rejected,
                    value: None,
                    reason: Some(reason.to_string()),
                },
                Err(join_error) => TaskOutcome {
                    task_id,
                    status: TaskStatus::Rejected,
                    value: None,
                    reason: Some(format!("task aborted: {join_error}")),
                },
            };
            outcomes.push(outcome);
        }

        self.bus
            .publish("coordination:batch:complete", batch_meta)
            .await?;
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{handler, SubscribeOptions};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn coordinator(policy: MessagingPolicy) -> (Arc<AgentCoordinator>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let blackboard = Arc::new(Blackboard::new());
        let coordinator = Arc::new(AgentCoordinator::with_policy(
            Arc::clone(&bus),
            blackboard,
            policy,
        ));
        (coordinator, bus)
    }

    #[tokio::test]
    async fn test_roster_dedup_and_sort() {
        let (coordinator, _) = coordinator(MessagingPolicy::default());
        coordinator.register_agent("research");
        coordinator.register_agent("qa");
        assert!(!coordinator.register_agent("research"));

        assert_eq!(coordinator.list_active_agents(), vec!["qa", "research"]);

        assert!(coordinator.unregister_agent("qa"));
        assert!(!coordinator.unregister_agent("qa"));
        assert_eq!(coordinator.list_active_agents(), vec!["research"]);
    }

    #[tokio::test]
    async fn test_disallowed_route_never_delivers() {
        let (coordinator, bus) = coordinator(MessagingPolicy::deny_by_default());

        let inbox_hits = Arc::new(AtomicUsize::new(0));
        {
            let inbox_hits = Arc::clone(&inbox_hits);
            coordinator.subscribe_inbox(
                "qa",
                inbox_handler(move |_message| {
                    let inbox_hits = Arc::clone(&inbox_hits);
                    async move {
                        inbox_hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            );
        }

        let emitted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let emitted = Arc::clone(&emitted);
            bus.subscribe(
                "agent:message:*",
                handler(move |envelope| {
                    let emitted = Arc::clone(&emitted);
                    async move {
                        emitted.lock().push(envelope.event);
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        }

        let err = coordinator
            .send_direct_message("research", "qa", "handoff", json!({}), MessageOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "route_not_allowed");
        assert_eq!(inbox_hits.load(Ordering::SeqCst), 0);
        assert!(emitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_route_delivers_and_audits() {
        let (coordinator, bus) = coordinator(
            MessagingPolicy::deny_by_default().allow_route("research", "qa"),
        );

        let received: Arc<Mutex<Vec<AgentMessage>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let received = Arc::clone(&received);
            coordinator.subscribe_inbox(
                "qa",
                inbox_handler(move |message| {
                    let received = Arc::clone(&received);
                    async move {
                        received.lock().push(message);
                    }
                }),
            );
        }

        let emitted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let emitted = Arc::clone(&emitted);
            bus.subscribe(
                "agent:message:*",
                handler(move |envelope| {
                    let emitted = Arc::clone(&emitted);
                    async move {
                        emitted.lock().push(envelope.event);
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        }

        let message = coordinator
            .send_direct_message(
                "research",
                "qa",
                "handoff",
                json!({"finding": "f-1"}),
                MessageOptions {
                    run_id: Some("run-9".into()),
                    correlation_id: None,
                },
            )
            .await
            .unwrap();

        let inbox = received.lock();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, message.id);
        assert_eq!(inbox[0].payload["finding"], "f-1");

        assert_eq!(
            *emitted.lock(),
            vec!["agent:message:sent", "agent:message:received"]
        );

        let audit = coordinator
            .blackboard
            .get_artifact(AUDIT_WORKSPACE, &format!("message-audit:{}", message.id))
            .unwrap();
        assert_eq!(audit.version, 1);
        assert_eq!(audit.payload["from"], "research");
    }

    #[tokio::test]
    async fn test_policy_can_be_replaced_at_runtime() {
        let (coordinator, _) = coordinator(MessagingPolicy::deny_by_default());

        let err = coordinator
            .send_direct_message("a", "b", "t", json!({}), MessageOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "route_not_allowed");

        coordinator.set_policy(MessagingPolicy::deny_by_default().allow_route("a", "b"));
        coordinator
            .send_direct_message("a", "b", "t", json!({}), MessageOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_inbox_unsubscribe() {
        let (coordinator, _) = coordinator(MessagingPolicy::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let subscription = {
            let hits = Arc::clone(&hits);
            coordinator.subscribe_inbox(
                "qa",
                inbox_handler(move |_| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
        };

        coordinator
            .send_direct_message("a", "qa", "t", json!({}), MessageOptions::default())
            .await
            .unwrap();
        assert!(coordinator.unsubscribe_inbox(&subscription));
        assert!(!coordinator.unsubscribe_inbox(&subscription));
        coordinator
            .send_direct_message("a", "qa", "t", json!({}), MessageOptions::default())
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_coordinate_parallel_bounds_concurrency_and_keeps_order() {
        let (coordinator, _) = coordinator(MessagingPolicy::default());

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let task = |task_id: &str, duration_ms: u64| {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let id = task_id.to_string();
            CoordinatedTask::new(task_id, async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({ "task": id }))
            })
        };

        // Mixed durations: the last-submitted task finishes first.
        let outcomes = coordinator
            .coordinate_parallel(
                vec![task("task-1", 120), task("task-2", 60), task("task-3", 10)],
                CoordinateOptions::with_concurrency(2),
            )
            .await
            .unwrap();

        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
        let ids: Vec<&str> = outcomes.iter().map(|o| o.task_id.as_str()).collect();
        assert_eq!(ids, vec!["task-1", "task-2", "task-3"]);
        assert!(outcomes.iter().all(|o| o.status == TaskStatus::Fulfilled));
        assert_eq!(outcomes[2].value.as_ref().unwrap()["task"], "task-3");
    }

    #[tokio::test]
    async fn test_coordinate_parallel_rejection_is_isolated() {
        let (coordinator, _) = coordinator(MessagingPolicy::default());

        let outcomes = coordinator
            .coordinate_parallel(
                vec![
                    CoordinatedTask::new("ok", async { Ok(json!(1)) }),
                    CoordinatedTask::new("boom", async {
                        Err(anyhow::anyhow!("deliberate failure"))
                    }),
                ],
                CoordinateOptions::with_concurrency(2),
            )
            .await
            .unwrap();

        assert_eq!(outcomes[0].status, TaskStatus::Fulfilled);
        assert_eq!(outcomes[1].status, TaskStatus::Rejected);
        assert!(outcomes[1]
            .reason
            .as_deref()
            .unwrap()
            .contains("deliberate failure"));
    }

    #[tokio::test]
    async fn test_batch_events_bracket_execution() {
        let (coordinator, bus) = coordinator(MessagingPolicy::default());

        let emitted: Arc<Mutex<Vec<(String, i64)>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let emitted = Arc::clone(&emitted);
            bus.subscribe(
                "coordination:batch:*",
                handler(move |envelope| {
                    let emitted = Arc::clone(&emitted);
                    async move {
                        let count = envelope.payload["task_count"].as_i64().unwrap_or(-1);
                        emitted.lock().push((envelope.event, count));
                    }
                }),
                SubscribeOptions::default(),
            )
            .await
            .unwrap();
        }

        coordinator
            .coordinate_parallel(
                vec![CoordinatedTask::new("only", async { Ok(json!(null)) })],
                CoordinateOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            *emitted.lock(),
            vec![
                ("coordination:batch:start".to_string(), 1),
                ("coordination:batch:complete".to_string(), 1),
            ]
        );
    }
}
