use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, EvictionPolicy, KeepLoaded, MemoryConfig, ModelSlotConfig};
use crate::error::{Error, Result};
use crate::models::{Embedder, ModelFactory, ModelInstance, Reranker};

/// How often the idle sweeper wakes to look for stale on-demand slots.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

type LoadOutcome = Option<std::result::Result<(), Arc<Error>>>;

struct LoadedModel {
    instance: ModelInstance,
    loaded_at: Instant,
    loaded_at_unix: u64,
    last_used: Instant,
}

enum SlotState {
    Unloaded,
    /// A load is in flight; waiters park on the receiver and all observe
    /// the single outcome.
    Loading(watch::Receiver<LoadOutcome>),
    Loaded(LoadedModel),
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Unloaded => "unloaded",
            SlotState::Loading(_) => "loading",
            SlotState::Loaded(_) => "loaded",
        }
    }
}

struct Slot {
    config: ModelSlotConfig,
    state: SlotState,
    /// Outstanding handles; a slot in use is never evicted.
    in_use: usize,
}

struct Inner {
    slots: BTreeMap<String, Slot>,
    memory: MemoryConfig,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
    pub state: String,
    pub policy: KeepLoaded,
    pub memory_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub slots: BTreeMap<String, SlotStatus>,
    /// Sum of the estimates of loaded slots; estimates are the accounting
    /// unit, not resident set size.
    pub total_memory_mb: u64,
    pub max_memory_mb: u64,
}

// ---------------------------------------------------------------------------
// ModelManager
// ---------------------------------------------------------------------------

/// Owns the process-wide set of model slots and their lifecycle: lazy
/// single-flight loads, an LRU/FIFO memory budget, and idle eviction.
///
/// Cheaply cloneable; all clones share the same slot table.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Mutex<Inner>>,
    factory: Arc<dyn ModelFactory>,
    shut_down: Arc<AtomicBool>,
}

impl ModelManager {
    /// Build the slot table from configuration. The slot set is fixed for
    /// the life of the process; `reload` only updates parameters.
    pub fn new(config: &Config, factory: Arc<dyn ModelFactory>) -> Self {
        let slots = config
            .models
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    Slot {
                        config: cfg.clone(),
                        state: SlotState::Unloaded,
                        in_use: 0,
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots,
                memory: config.memory.clone(),
            })),
            factory,
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acquire a handle on a slot, loading the model if necessary.
    ///
    /// Concurrent callers during a load wait for the in-flight attempt; on
    /// failure they all receive the same error and the slot returns to
    /// unloaded. The handle blocks eviction of the slot until dropped.
    pub async fn acquire(&self, slot: &str) -> Result<ModelHandle> {
        enum Step {
            Ready(ModelHandle),
            Wait(watch::Receiver<LoadOutcome>),
            Load(watch::Sender<LoadOutcome>, Vec<(String, ModelInstance)>),
        }

        loop {
            let step = {
                let mut inner = self.inner.lock();
                let slot_ref = inner
                    .slots
                    .get(slot)
                    .ok_or_else(|| Error::UnknownSlot(slot.to_string()))?;
                if slot_ref.config.keep_loaded == KeepLoaded::Disabled {
                    return Err(Error::ModelDisabled(slot.to_string()));
                }

                if let SlotState::Loading(rx) = &slot_ref.state {
                    Step::Wait(rx.clone())
                } else if matches!(slot_ref.state, SlotState::Unloaded) {
                    // Budget decision happens under the lock; the load
                    // itself runs outside it.
                    let victims = plan_eviction(&mut inner, slot)?;
                    let (tx, rx) = watch::channel(None);
                    if let Some(slot_mut) = inner.slots.get_mut(slot) {
                        slot_mut.state = SlotState::Loading(rx);
                    }
                    Step::Load(tx, victims)
                } else {
                    let Some(slot_mut) = inner.slots.get_mut(slot) else {
                        continue;
                    };
                    let SlotState::Loaded(model) = &mut slot_mut.state else {
                        continue;
                    };
                    model.last_used = Instant::now();
                    let instance = model.instance.clone();
                    slot_mut.in_use += 1;
                    Step::Ready(ModelHandle {
                        manager: self.clone(),
                        slot: slot.to_string(),
                        instance,
                    })
                }
            };

            match step {
                Step::Ready(handle) => return Ok(handle),
                Step::Wait(mut rx) => loop {
                    let outcome = rx.borrow().clone();
                    if let Some(result) = outcome {
                        match result {
                            Ok(()) => break,
                            Err(shared) => return Err(shared.shared_clone()),
                        }
                    }
                    if rx.changed().await.is_err() {
                        return Err(Error::ModelLoadFailed {
                            slot: slot.to_string(),
                            reason: "load task aborted".to_string(),
                        });
                    }
                },
                Step::Load(tx, victims) => {
                    drop_victims(victims);
                    // Loads run to completion in their own task so that a
                    // cancelled caller cannot orphan the waiters.
                    let manager = self.clone();
                    let name = slot.to_string();
                    tokio::spawn(async move {
                        manager.run_load(&name, tx).await;
                    });
                }
            }
        }
    }

    async fn run_load(&self, slot: &str, tx: watch::Sender<LoadOutcome>) {
        let config = {
            let inner = self.inner.lock();
            match inner.slots.get(slot) {
                Some(s) => s.config.clone(),
                None => return,
            }
        };

        info!(slot, model = %config.name, "loading model");
        let factory = self.factory.clone();
        let name = slot.to_string();
        let loaded = tokio::task::spawn_blocking(move || factory.load(&name, &config))
            .await
            .map_err(|e| Error::Internal(format!("load task panicked: {e}")))
            .and_then(|r| r);

        let mut inner = self.inner.lock();
        let Some(slot_mut) = inner.slots.get_mut(slot) else {
            return;
        };
        match loaded {
            Ok(instance) => {
                let now = Instant::now();
                slot_mut.state = SlotState::Loaded(LoadedModel {
                    instance,
                    loaded_at: now,
                    loaded_at_unix: unix_now(),
                    last_used: now,
                });
                let _ = tx.send(Some(Ok(())));
            }
            Err(e) => {
                warn!(slot, error = %e, "model load failed");
                slot_mut.state = SlotState::Unloaded;
                let _ = tx.send(Some(Err(Arc::new(e))));
            }
        }
    }

    /// Load a slot without holding a handle. Returns the slot's memory
    /// estimate; loading an already-loaded slot is a no-op.
    pub async fn load(&self, slot: &str) -> Result<u64> {
        let _handle = self.acquire(slot).await?;
        let inner = self.inner.lock();
        inner
            .slots
            .get(slot)
            .map(|s| s.config.memory_estimate_mb)
            .ok_or_else(|| Error::UnknownSlot(slot.to_string()))
    }

    /// Unload a slot now. `always` slots are left alone; a slot that is in
    /// use or mid-load cannot be unloaded.
    pub fn unload(&self, slot: &str) -> Result<()> {
        let victim = {
            let mut inner = self.inner.lock();
            let slot_mut = inner
                .slots
                .get_mut(slot)
                .ok_or_else(|| Error::UnknownSlot(slot.to_string()))?;
            match &slot_mut.state {
                SlotState::Loaded(_) => {
                    if slot_mut.config.keep_loaded == KeepLoaded::Always {
                        warn!(slot, "refusing to unload 'always' slot");
                        return Ok(());
                    }
                    if slot_mut.in_use > 0 {
                        return Err(Error::DaemonBusy(format!("slot '{slot}' is in use")));
                    }
                    match std::mem::replace(&mut slot_mut.state, SlotState::Unloaded) {
                        SlotState::Loaded(model) => Some(model.instance),
                        _ => None,
                    }
                }
                SlotState::Loading(_) => {
                    return Err(Error::DaemonBusy(format!("slot '{slot}' is loading")))
                }
                SlotState::Unloaded => None,
            }
        };

        if victim.is_some() {
            info!(slot, "model unloaded");
        }
        Ok(())
    }

    /// Per-slot state plus memory accounting.
    pub fn status(&self) -> ManagerStatus {
        let inner = self.inner.lock();
        let now_unix = unix_now();

        let mut slots = BTreeMap::new();
        let mut total = 0u64;
        for (name, slot) in &inner.slots {
            let status = match &slot.state {
                SlotState::Loaded(model) => {
                    total += slot.config.memory_estimate_mb;
                    let idle = model.last_used.elapsed().as_secs();
                    SlotStatus {
                        state: slot.state.name().to_string(),
                        policy: slot.config.keep_loaded,
                        memory_mb: slot.config.memory_estimate_mb,
                        loaded_at: Some(model.loaded_at_unix),
                        last_used: Some(now_unix.saturating_sub(idle)),
                        idle_seconds: Some(idle),
                    }
                }
                _ => SlotStatus {
                    state: slot.state.name().to_string(),
                    policy: slot.config.keep_loaded,
                    memory_mb: slot.config.memory_estimate_mb,
                    loaded_at: None,
                    last_used: None,
                    idle_seconds: None,
                },
            };
            slots.insert(name.clone(), status);
        }

        ManagerStatus {
            slots,
            total_memory_mb: total,
            max_memory_mb: inner.memory.max_ram_mb,
        }
    }

    /// Apply a new configuration: idle timeouts, memory estimates, budget,
    /// and policies take effect immediately (a policy change to `disabled`
    /// unloads the slot). Model identity changes require a restart; new
    /// slot names are ignored.
    pub fn reload(&self, config: &Config) {
        let victims = {
            let mut inner = self.inner.lock();
            inner.memory = config.memory.clone();

            let mut victims = Vec::new();
            let names: Vec<String> = inner.slots.keys().cloned().collect();
            for name in &names {
                let Some(new_cfg) = config.models.get(name) else {
                    continue;
                };
                let Some(slot_mut) = inner.slots.get_mut(name) else {
                    continue;
                };
                if new_cfg.name != slot_mut.config.name {
                    warn!(
                        slot = %name,
                        "model identity change requires restart; keeping loaded model"
                    );
                }
                slot_mut.config.keep_loaded = new_cfg.keep_loaded;
                slot_mut.config.idle_timeout_seconds = new_cfg.idle_timeout_seconds;
                slot_mut.config.memory_estimate_mb = new_cfg.memory_estimate_mb;

                if new_cfg.keep_loaded == KeepLoaded::Disabled
                    && slot_mut.in_use == 0
                    && matches!(slot_mut.state, SlotState::Loaded(_))
                {
                    if let SlotState::Loaded(model) =
                        std::mem::replace(&mut slot_mut.state, SlotState::Unloaded)
                    {
                        victims.push((name.clone(), model.instance));
                    }
                }
            }

            for name in config.models.keys() {
                if !inner.slots.contains_key(name) {
                    warn!(slot = %name, "new slots require restart; ignoring");
                }
            }

            victims.extend(evict_until_fits(&mut inner, 0, None));
            victims
        };
        drop_victims(victims);
    }

    /// One sweep of the idle timeout: unload on-demand slots whose idle
    /// time reached their configured timeout. A timeout of 0 opts out.
    pub fn sweep_idle(&self) {
        let victims = {
            let mut inner = self.inner.lock();
            let mut victims = Vec::new();
            let names: Vec<String> = inner.slots.keys().cloned().collect();
            for name in names {
                let Some(slot_mut) = inner.slots.get_mut(&name) else {
                    continue;
                };
                if slot_mut.config.keep_loaded != KeepLoaded::OnDemand
                    || slot_mut.config.idle_timeout_seconds == 0
                    || slot_mut.in_use > 0
                {
                    continue;
                }
                let expired = match &slot_mut.state {
                    SlotState::Loaded(model) => {
                        model.last_used.elapsed().as_secs()
                            >= slot_mut.config.idle_timeout_seconds
                    }
                    _ => false,
                };
                if expired {
                    if let SlotState::Loaded(model) =
                        std::mem::replace(&mut slot_mut.state, SlotState::Unloaded)
                    {
                        victims.push((name, model.instance));
                    }
                }
            }
            victims
        };

        for (slot, _) in &victims {
            info!(slot = %slot, "idle timeout reached, unloading model");
        }
        drop_victims(victims);
    }

    /// Background actor that runs [`Self::sweep_idle`] periodically until
    /// the manager shuts down.
    pub fn spawn_idle_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if manager.shut_down.load(Ordering::SeqCst) {
                    break;
                }
                manager.sweep_idle();
            }
            debug!("idle sweeper stopped");
        })
    }

    /// Unload everything, including `always` slots, and stop the sweeper.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let victims = {
            let mut inner = self.inner.lock();
            let mut victims = Vec::new();
            for (name, slot) in inner.slots.iter_mut() {
                if let SlotState::Loaded(model) =
                    std::mem::replace(&mut slot.state, SlotState::Unloaded)
                {
                    victims.push((name.clone(), model.instance));
                }
            }
            victims
        };
        drop_victims(victims);
    }
}

// ---------------------------------------------------------------------------
// ModelHandle
// ---------------------------------------------------------------------------

/// A borrowed model. Dropping the handle releases the slot for eviction.
pub struct ModelHandle {
    manager: ModelManager,
    slot: String,
    instance: ModelInstance,
}

impl ModelHandle {
    pub fn instance(&self) -> &ModelInstance {
        &self.instance
    }

    pub fn embedder(&self) -> Result<Arc<dyn Embedder>> {
        match &self.instance {
            ModelInstance::Embedder(e) => Ok(e.clone()),
            ModelInstance::Reranker(_) => Err(Error::InvalidArgument(format!(
                "slot '{}' does not hold an embedder",
                self.slot
            ))),
        }
    }

    pub fn reranker(&self) -> Result<Arc<dyn Reranker>> {
        match &self.instance {
            ModelInstance::Reranker(r) => Ok(r.clone()),
            ModelInstance::Embedder(_) => Err(Error::InvalidArgument(format!(
                "slot '{}' does not hold a reranker",
                self.slot
            ))),
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        let mut inner = self.manager.inner.lock();
        if let Some(slot) = inner.slots.get_mut(&self.slot) {
            slot.in_use = slot.in_use.saturating_sub(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

/// Decide which slots to evict so that `for_slot` fits in the budget.
///
/// All-or-nothing: when even evicting every eligible slot cannot make
/// room, nothing is evicted and the load fails.
fn plan_eviction(inner: &mut Inner, for_slot: &str) -> Result<Vec<(String, ModelInstance)>> {
    let budget = inner.memory.max_ram_mb;
    let needed = inner
        .slots
        .get(for_slot)
        .map(|s| s.config.memory_estimate_mb)
        .unwrap_or(0);

    let in_budget: u64 = inner
        .slots
        .values()
        .filter(|s| !matches!(s.state, SlotState::Unloaded))
        .map(|s| s.config.memory_estimate_mb)
        .sum();

    if in_budget + needed <= budget {
        return Ok(Vec::new());
    }

    let candidates = eviction_candidates(inner, Some(for_slot));
    let freeable: u64 = candidates.iter().map(|(_, _, mb)| mb).sum();
    if in_budget + needed > budget + freeable {
        return Err(Error::MemoryBudgetExceeded {
            slot: for_slot.to_string(),
            needed_mb: needed,
            budget_mb: budget,
        });
    }

    let mut victims = Vec::new();
    let mut current = in_budget;
    for (name, _, mb) in candidates {
        if current + needed <= budget {
            break;
        }
        let Some(slot_mut) = inner.slots.get_mut(&name) else {
            continue;
        };
        if let SlotState::Loaded(model) =
            std::mem::replace(&mut slot_mut.state, SlotState::Unloaded)
        {
            current -= mb;
            victims.push((name, model.instance));
        }
    }
    Ok(victims)
}

/// Best-effort eviction after a reload shrank the budget.
fn evict_until_fits(
    inner: &mut Inner,
    needed: u64,
    exclude: Option<&str>,
) -> Vec<(String, ModelInstance)> {
    let budget = inner.memory.max_ram_mb;
    let mut current: u64 = inner
        .slots
        .values()
        .filter(|s| !matches!(s.state, SlotState::Unloaded))
        .map(|s| s.config.memory_estimate_mb)
        .sum();

    let mut victims = Vec::new();
    for (name, _, mb) in eviction_candidates(inner, exclude) {
        if current + needed <= budget {
            break;
        }
        let Some(slot_mut) = inner.slots.get_mut(&name) else {
            continue;
        };
        if let SlotState::Loaded(model) =
            std::mem::replace(&mut slot_mut.state, SlotState::Unloaded)
        {
            current -= mb;
            victims.push((name, model.instance));
        }
    }
    victims
}

/// Eligible eviction victims in eviction order: on-demand, loaded, not in
/// use; LRU orders by last use, FIFO by load time.
fn eviction_candidates(
    inner: &Inner,
    exclude: Option<&str>,
) -> Vec<(String, Instant, u64)> {
    let mut candidates: Vec<(String, Instant, u64)> = inner
        .slots
        .iter()
        .filter(|(name, slot)| {
            Some(name.as_str()) != exclude
                && slot.config.keep_loaded == KeepLoaded::OnDemand
                && slot.in_use == 0
        })
        .filter_map(|(name, slot)| match &slot.state {
            SlotState::Loaded(model) => {
                let key = match inner.memory.eviction_policy {
                    EvictionPolicy::Lru => model.last_used,
                    EvictionPolicy::Fifo => model.loaded_at,
                };
                Some((name.clone(), key, slot.config.memory_estimate_mb))
            }
            _ => None,
        })
        .collect();
    candidates.sort_by_key(|(_, key, _)| *key);
    candidates
}

fn drop_victims(victims: Vec<(String, ModelInstance)>) {
    for (slot, instance) in victims {
        debug!(slot = %slot, kind = instance.kind(), "releasing model instance");
        drop(instance);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
