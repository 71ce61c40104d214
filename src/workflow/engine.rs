//! The workflow engine.
//!
//! A set of persisted state machines subscribed to the event bus as one
//! durable consumer (`workflow-engine`, pattern `*`, replay on start).
//! Each delivered event is processed to completion before the next: first
//! every definition whose trigger matches spawns a new running instance,
//! then every other running instance whose current step matches advances
//! through its reducer. Instances and the append-only history are persisted
//! on every transition, and `configure_persistence` rebuilds the in-memory
//! caches after a restart — in-flight workflows survive the process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::events::{handler, EventBus, EventEnvelope, EventPattern, SubscribeOptions, SubscriptionId};
use crate::store::{DomainStore, WorkflowHistoryRecord, WorkflowInstanceRecord, WorkflowStatus};
use crate::workflow::definition::{ReducerRegistry, StepDefinition, WorkflowDefinition};

/// Durable consumer id of the engine's bus subscription.
pub const ENGINE_CONSUMER_ID: &str = "workflow-engine";

struct CompiledStep {
    step: StepDefinition,
    pattern: Option<EventPattern>,
}

/// A definition with its patterns compiled once at registration time.
struct CompiledDefinition {
    definition: WorkflowDefinition,
    trigger: EventPattern,
    steps: HashMap<String, CompiledStep>,
    initial_step_id: String,
}

impl CompiledDefinition {
    fn compile(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        let invalid = |message: String| WorkflowError::InvalidDefinition {
            definition_id: definition.id.clone(),
            message,
        };

        if definition.steps.is_empty() {
            return Err(invalid("definition has no steps".into()));
        }

        let mut steps = HashMap::new();
        for step in &definition.steps {
            let pattern = step
                .on_event
                .as_deref()
                .map(EventPattern::compile)
                .transpose()
                .map_err(|e| invalid(format!("step {}: {e}", step.id)))?;
            if steps
                .insert(
                    step.id.clone(),
                    CompiledStep {
                        step: step.clone(),
                        pattern,
                    },
                )
                .is_some()
            {
                return Err(invalid(format!("duplicate step id {:?}", step.id)));
            }
        }
        for step in &definition.steps {
            if let Some(next) = &step.next_step_id {
                if !steps.contains_key(next) {
                    return Err(invalid(format!(
                        "step {:?} points at unknown next step {next:?}",
                        step.id
                    )));
                }
            }
        }

        let trigger = EventPattern::compile(&definition.trigger_event)
            .map_err(|e| invalid(format!("trigger: {e}")))?;

        let initial_step_id = definition
            .initial_step_id()
            .ok_or_else(|| invalid("definition has no initial step".into()))?
            .to_string();
        if !steps.contains_key(&initial_step_id) {
            return Err(invalid(format!("unknown initial step {initial_step_id:?}")));
        }

        Ok(Self {
            definition,
            trigger,
            steps,
            initial_step_id,
        })
    }
}

/// The persisted-state-machine engine.
pub struct WorkflowEngine {
    bus: Arc<EventBus>,
    reducers: Arc<ReducerRegistry>,
    store: RwLock<Option<Arc<DomainStore>>>,
    definitions: RwLock<HashMap<(String, i64), Arc<CompiledDefinition>>>,
    instances: RwLock<HashMap<String, WorkflowInstanceRecord>>,
    subscription: Mutex<Option<SubscriptionId>>,
    /// One delivered event is processed to completion before the next, so
    /// no two transitions for the same instance race in-process.
    processing: tokio::sync::Mutex<()>,
}

impl WorkflowEngine {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_reducers(bus, Arc::new(ReducerRegistry::with_builtins()))
    }

    pub fn with_reducers(bus: Arc<EventBus>, reducers: Arc<ReducerRegistry>) -> Self {
        Self {
            bus,
            reducers,
            store: RwLock::new(None),
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            subscription: Mutex::new(None),
            processing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn reducers(&self) -> &Arc<ReducerRegistry> {
        &self.reducers
    }

    fn current_store(&self) -> Option<Arc<DomainStore>> {
        self.store.read().clone()
    }

    fn require_store(&self, operation: &'static str) -> Result<Arc<DomainStore>, WorkflowError> {
        self.current_store()
            .ok_or(WorkflowError::PersistenceNotConfigured { operation })
    }

    // -----------------------------------------------------------------------
    // Registration and hydration
    // -----------------------------------------------------------------------

    /// Add a definition to the in-memory table, optionally persisting its
    /// serialized steps. A definition already registered under the same
    /// `(id, version)` is left untouched.
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
        persist: bool,
    ) -> Result<(), WorkflowError> {
        let store = if persist {
            Some(self.require_store("register_definition")?)
        } else {
            None
        };

        let compiled = CompiledDefinition::compile(definition.clone())?;
        let key = (definition.id.clone(), definition.version);
        {
            let mut definitions = self.definitions.write();
            if definitions.contains_key(&key) {
                log::warn!(
                    "definition {} v{} already registered; keeping the existing one",
                    definition.id,
                    definition.version
                );
                return Ok(());
            }
            definitions.insert(key, Arc::new(compiled));
        }

        if let Some(store) = store {
            store
                .save_workflow_definition(
                    &definition.id,
                    definition.version,
                    &definition.name,
                    &definition.trigger_event,
                    serde_json::to_value(&definition).unwrap_or(json!(null)),
                )
                .await?;
        }
        Ok(())
    }

    /// Attach the domain store and hydrate persisted definitions plus all
    /// running instances. This is how in-flight workflows survive a restart.
    pub async fn configure_persistence(
        &self,
        store: Arc<DomainStore>,
    ) -> Result<(), WorkflowError> {
        *self.store.write() = Some(Arc::clone(&store));

        for record in store.list_workflow_definitions().await? {
            let key = (record.definition_id.clone(), record.version);
            if self.definitions.read().contains_key(&key) {
                continue;
            }
            match serde_json::from_value::<WorkflowDefinition>(record.payload.clone()) {
                Ok(definition) => match CompiledDefinition::compile(definition) {
                    Ok(compiled) => {
                        self.definitions.write().insert(key, Arc::new(compiled));
                    }
                    Err(e) => log::error!(
                        "persisted definition {} v{} failed to compile: {e}",
                        record.definition_id,
                        record.version
                    ),
                },
                Err(e) => log::error!(
                    "persisted definition {} v{} failed to deserialize: {e}",
                    record.definition_id,
                    record.version
                ),
            }
        }

        let mut instances = self.instances.write();
        for instance in store.list_running_instances().await? {
            instances.insert(instance.instance_id.clone(), instance);
        }
        log::debug!(
            "workflow engine hydrated: {} definitions, {} running instances",
            self.definitions.read().len(),
            instances.len()
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Subscribe to the bus as the durable `workflow-engine` consumer with
    /// replay, so events published while the engine was stopped are not
    /// lost.
    pub async fn start(self: &Arc<Self>) -> Result<(), WorkflowError> {
        self.require_store("start")?;
        if self.subscription.lock().is_some() {
            return Ok(());
        }

        let engine = Arc::clone(self);
        let id = self
            .bus
            .subscribe(
                "*",
                handler(move |envelope: EventEnvelope| {
                    let engine = Arc::clone(&engine);
                    async move { engine.handle_event(envelope).await }
                }),
                SubscribeOptions::durable_with_replay(ENGINE_CONSUMER_ID),
            )
            .await?;
        *self.subscription.lock() = Some(id);
        Ok(())
    }

    /// Unsubscribe from the bus. Persisted state is untouched.
    pub fn stop(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.bus.unsubscribe(id);
        }
    }

    /// Cached view of one instance.
    pub fn instance(&self, instance_id: &str) -> Option<WorkflowInstanceRecord> {
        self.instances.read().get(instance_id).cloned()
    }

    /// Cached running instances.
    pub fn running_instances(&self) -> Vec<WorkflowInstanceRecord> {
        self.instances
            .read()
            .values()
            .filter(|i| i.status == WorkflowStatus::Running)
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    async fn handle_event(&self, envelope: EventEnvelope) {
        let Some(store) = self.current_store() else {
            log::error!("workflow engine received an event without a configured store");
            return;
        };
        let _guard = self.processing.lock().await;

        let definitions: Vec<Arc<CompiledDefinition>> =
            self.definitions.read().values().cloned().collect();
        // Snapshot before spawning, so instances created by this event are
        // not advanced by it.
        let running: Vec<WorkflowInstanceRecord> = self
            .instances
            .read()
            .values()
            .filter(|i| i.status == WorkflowStatus::Running)
            .cloned()
            .collect();

        for definition in &definitions {
            if definition.trigger.matches(&envelope.event) {
                self.spawn_instance(&store, definition, &envelope).await;
            }
        }

        for instance in running {
            // The instance's own trigger event is excluded to avoid
            // double-processing on creation.
            if instance.trigger_event_id == envelope.event_id {
                continue;
            }
            let key = (instance.definition_id.clone(), instance.definition_version);
            let Some(definition) = self.definitions.read().get(&key).cloned() else {
                log::warn!(
                    "instance {} references unknown definition {} v{}",
                    instance.instance_id,
                    instance.definition_id,
                    instance.definition_version
                );
                continue;
            };
            self.advance_instance(&store, &definition, instance, &envelope)
                .await;
        }
    }

    async fn spawn_instance(
        &self,
        store: &DomainStore,
        definition: &CompiledDefinition,
        envelope: &EventEnvelope,
    ) {
        // Replayed trigger events must not spawn duplicates.
        let already_spawned = self.instances.read().values().any(|i| {
            i.trigger_event_id == envelope.event_id
                && i.definition_id == definition.definition.id
                && i.definition_version == definition.definition.version
        });
        if already_spawned {
            return;
        }

        let now = Utc::now();
        let instance = WorkflowInstanceRecord {
            instance_id: Uuid::new_v4().to_string(),
            definition_id: definition.definition.id.clone(),
            definition_version: definition.definition.version,
            status: WorkflowStatus::Running,
            current_step_id: Some(definition.initial_step_id.clone()),
            state: envelope.payload.clone(),
            trigger_event_id: envelope.event_id.clone(),
            started_at: now,
            updated_at: now,
            completed_at: None,
        };

        if let Err(e) = store.save_workflow_instance(&instance).await {
            log::error!(
                "could not persist new instance of {}: {e}",
                definition.definition.id
            );
            return;
        }
        self.record_history(
            store,
            &instance,
            "workflow_started",
            Some(&envelope.event_id),
            json!({ "event": envelope.event, "step": instance.current_step_id }),
        )
        .await;

        log::debug!(
            "started workflow {} v{} instance {} at step {:?}",
            definition.definition.id,
            definition.definition.version,
            instance.instance_id,
            instance.current_step_id
        );
        self.instances
            .write()
            .insert(instance.instance_id.clone(), instance);
    }

    async fn advance_instance(
        &self,
        store: &DomainStore,
        definition: &CompiledDefinition,
        instance: WorkflowInstanceRecord,
        envelope: &EventEnvelope,
    ) {
        let Some(current_step_id) = instance.current_step_id.clone() else {
            return;
        };
        let Some(current) = definition.steps.get(&current_step_id) else {
            log::warn!(
                "instance {} sits at unknown step {current_step_id:?}",
                instance.instance_id
            );
            return;
        };
        let matches = current
            .pattern
            .as_ref()
            .is_some_and(|p| p.matches(&envelope.event));
        if !matches {
            return;
        }

        let reducer = self.reducers.resolve(current.step.reducer.as_deref());
        let state = reducer(instance.state.clone(), &envelope.payload, envelope);

        let now = Utc::now();
        let mut updated = instance;
        updated.state = state;
        updated.updated_at = now;

        // Terminal when the matched step is flagged terminal or has no next
        // step; transitioning into a terminal step also completes.
        if current.step.terminal || current.step.next_step_id.is_none() {
            updated.status = WorkflowStatus::Completed;
            updated.completed_at = Some(now);
        } else if let Some(next_id) = &current.step.next_step_id {
            updated.current_step_id = Some(next_id.clone());
            let destination_terminal = definition
                .steps
                .get(next_id)
                .is_some_and(|s| s.step.terminal);
            if destination_terminal {
                updated.status = WorkflowStatus::Completed;
                updated.completed_at = Some(now);
            }
        }

        if let Err(e) = store.save_workflow_instance(&updated).await {
            log::error!(
                "could not persist transition of instance {}: {e}",
                updated.instance_id
            );
            return;
        }
        let transition = if updated.status == WorkflowStatus::Completed {
            "workflow_completed"
        } else {
            "step_transition"
        };
        self.record_history(
            store,
            &updated,
            transition,
            Some(&envelope.event_id),
            json!({
                "from": current_step_id,
                "to": updated.current_step_id,
                "status": updated.status.as_str(),
            }),
        )
        .await;

        log::debug!(
            "instance {} {transition}: {} -> {:?}",
            updated.instance_id,
            current_step_id,
            updated.current_step_id
        );
        self.instances
            .write()
            .insert(updated.instance_id.clone(), updated);
    }

    async fn record_history(
        &self,
        store: &DomainStore,
        instance: &WorkflowInstanceRecord,
        transition: &str,
        event_id: Option<&str>,
        payload: serde_json::Value,
    ) {
        let record = WorkflowHistoryRecord {
            entry_id: Uuid::new_v4().to_string(),
            instance_id: instance.instance_id.clone(),
            step_id: instance.current_step_id.clone(),
            transition: transition.to_string(),
            event_id: event_id.map(str::to_string),
            payload,
            recorded_at: Utc::now(),
        };
        if let Err(e) = store.append_workflow_history(&record).await {
            log::error!(
                "could not append history for instance {}: {e}",
                instance.instance_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabasePool;
    use crate::persistence::PersistenceManager;

    async fn stack() -> (Arc<EventBus>, Arc<DomainStore>) {
        let pool = Arc::new(SqliteDatabasePool::in_memory().unwrap());
        let manager = Arc::new(PersistenceManager::new(
            pool,
            concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"),
        ));
        manager.migrate().await.unwrap();
        let store = Arc::new(DomainStore::new(manager));
        let bus = Arc::new(EventBus::new());
        bus.configure_persistence(Arc::clone(&store));
        (bus, store)
    }

    fn provisioning_definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "workspace-provisioning",
            1,
            "Workspace provisioning",
            "workspace:created",
        )
        .step(
            StepDefinition::new("workspace-created")
                .on("workspace:member:added")
                .then("member-added"),
        )
        .step(
            StepDefinition::new("member-added")
                .on("workspace:artifact:updated")
                .then("artifact-seeded"),
        )
        .step(StepDefinition::new("artifact-seeded").terminal())
    }

    #[tokio::test]
    async fn test_persistence_preconditions() {
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(WorkflowEngine::new(bus));

        let err = engine
            .register_definition(provisioning_definition(), true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "persistence_not_configured");

        let err = engine.start().await.unwrap_err();
        assert_eq!(err.code(), "persistence_not_configured");
    }

    #[tokio::test]
    async fn test_definition_validation() {
        let (bus, store) = stack().await;
        let engine = Arc::new(WorkflowEngine::new(bus));
        engine.configure_persistence(store).await.unwrap();

        let empty = WorkflowDefinition::new("empty", 1, "Empty", "a:b");
        let err = engine.register_definition(empty, false).await.unwrap_err();
        assert_eq!(err.code(), "invalid_definition");

        let dangling = WorkflowDefinition::new("dangling", 1, "Dangling", "a:b")
            .step(StepDefinition::new("one").on("a:c").then("missing"));
        let err = engine
            .register_definition(dangling, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_definition");
    }

    #[tokio::test]
    async fn test_instance_runs_to_completion() {
        let (bus, store) = stack().await;
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&bus)));
        engine
            .configure_persistence(Arc::clone(&store))
            .await
            .unwrap();
        engine
            .register_definition(provisioning_definition(), true)
            .await
            .unwrap();
        engine.start().await.unwrap();

        bus.publish("workspace:created", json!({"workspace_id": "ws-1"}))
            .await
            .unwrap();

        let running = engine.running_instances();
        assert_eq!(running.len(), 1);
        assert_eq!(
            running[0].current_step_id.as_deref(),
            Some("workspace-created")
        );

        bus.publish("workspace:member:added", json!({"member": "ada"}))
            .await
            .unwrap();
        bus.publish("workspace:artifact:updated", json!({"artifact": "plan"}))
            .await
            .unwrap();

        let instance_id = running[0].instance_id.clone();
        let stored = store
            .get_workflow_instance(&instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        assert_eq!(stored.current_step_id.as_deref(), Some("artifact-seeded"));
        assert!(stored.completed_at.is_some());
        // The reducer merged event payloads into the state along the way.
        assert_eq!(stored.state["member"], "ada");
        assert_eq!(stored.state["artifact"], "plan");

        let history = store.list_workflow_history(&instance_id).await.unwrap();
        let transitions: Vec<&str> =
            history.iter().map(|h| h.transition.as_str()).collect();
        assert_eq!(
            transitions,
            vec!["workflow_started", "step_transition", "workflow_completed"]
        );
    }

    #[tokio::test]
    async fn test_instance_survives_engine_restart() {
        let (bus, store) = stack().await;

        // First engine lifetime: the trigger arrives, then the process goes
        // away.
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&bus)));
        engine
            .configure_persistence(Arc::clone(&store))
            .await
            .unwrap();
        engine
            .register_definition(provisioning_definition(), true)
            .await
            .unwrap();
        engine.start().await.unwrap();

        bus.publish("workspace:created", json!({"workspace_id": "ws-1"}))
            .await
            .unwrap();
        let instance_id = engine.running_instances()[0].instance_id.clone();
        engine.stop();
        drop(engine);

        // Second lifetime against the same store: definitions and the
        // running instance hydrate, then the remaining events arrive.
        let restarted = Arc::new(WorkflowEngine::new(Arc::clone(&bus)));
        restarted
            .configure_persistence(Arc::clone(&store))
            .await
            .unwrap();
        restarted.start().await.unwrap();
        assert_eq!(restarted.running_instances().len(), 1);

        bus.publish("workspace:member:added", json!({"member": "ada"}))
            .await
            .unwrap();
        bus.publish("workspace:artifact:updated", json!({"artifact": "plan"}))
            .await
            .unwrap();

        let stored = store
            .get_workflow_instance(&instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_trigger_event_not_double_processed() {
        let (bus, store) = stack().await;
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&bus)));
        engine
            .configure_persistence(Arc::clone(&store))
            .await
            .unwrap();

        // The first step's pattern also matches the trigger event.
        let definition = WorkflowDefinition::new("ping", 1, "Ping", "ping:start")
            .step(StepDefinition::new("waiting").on("ping:*").then("done"))
            .step(StepDefinition::new("done").terminal());
        engine.register_definition(definition, true).await.unwrap();
        engine.start().await.unwrap();

        bus.publish("ping:start", json!({})).await.unwrap();
        let running = engine.running_instances();
        assert_eq!(running.len(), 1);
        // Still waiting: the trigger did not advance its own instance.
        assert_eq!(running[0].current_step_id.as_deref(), Some("waiting"));

        bus.publish("ping:go", json!({})).await.unwrap();
        let stored = store
            .get_workflow_instance(&running[0].instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_events_published_while_stopped_are_replayed() {
        let (bus, store) = stack().await;
        let engine = Arc::new(WorkflowEngine::new(Arc::clone(&bus)));
        engine
            .configure_persistence(Arc::clone(&store))
            .await
            .unwrap();
        engine
            .register_definition(provisioning_definition(), true)
            .await
            .unwrap();

        // Nobody is subscribed yet; the trigger lands in the log only.
        bus.publish("workspace:created", json!({"workspace_id": "ws-1"}))
            .await
            .unwrap();
        assert!(engine.running_instances().is_empty());

        // start() replays from the checkpoint and catches up.
        engine.start().await.unwrap();
        assert_eq!(engine.running_instances().len(), 1);
    }
}
