//! In-memory capability registry.
//!
//! Readers never hold the lock while using a capability: every lookup runs
//! against an immutable [`CapabilitySet`] snapshot, and mutation swaps in a
//! new snapshot.  Registration called re-entrantly (for example from a
//! render callback that fires during resolution) therefore cannot disturb
//! an iteration already in progress.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use gl_domain::error::{Error, Result};
use gl_domain::trace::TraceEvent;

use crate::capability::{
    Capability, CapabilityDescriptor, ComponentCapability, ComponentDefinition, ToolCapability,
    ToolDefinition,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable view of the registry at one generation.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    entries: Vec<Capability>,
    index: HashMap<String, usize>,
    generation: u64,
}

impl CapabilitySet {
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Capabilities in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Insert or replace by name.  A replacement keeps the original position.
    fn upsert(&mut self, capability: Capability) -> bool {
        self.generation += 1;
        match self.index.get(capability.name()) {
            Some(&i) => {
                self.entries[i] = capability;
                true
            }
            None => {
                self.index
                    .insert(capability.name().to_owned(), self.entries.len());
                self.entries.push(capability);
                false
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Visible to lookups immediately.
    Applied { replaced: bool },
    /// The name is referenced by an active turn; the replacement is applied
    /// once every such turn has finished.
    Deferred,
}

#[derive(Default)]
struct RegistryInner {
    current: Arc<CapabilitySet>,
    /// name → number of active turns that resolved it.
    pins: HashMap<String, usize>,
    /// Replacements waiting for their name to be unpinned, in arrival order.
    deferred: Vec<Capability>,
}

#[derive(Default)]
pub struct CapabilityRegistry {
    inner: RwLock<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_component(&self, def: ComponentDefinition) -> Result<Registration> {
        Ok(self.register(Capability::component(def)?))
    }

    pub fn register_tool(&self, def: ToolDefinition) -> Result<Registration> {
        Ok(self.register(Capability::tool(def)?))
    }

    /// Register an already-compiled capability.
    pub fn register(&self, capability: Capability) -> Registration {
        let mut inner = self.inner.write();
        let name = capability.name().to_owned();

        if inner.pins.get(&name).copied().unwrap_or(0) > 0 {
            inner.deferred.retain(|c| c.name() != name);
            inner.deferred.push(capability);
            drop(inner);
            tracing::debug!(capability = %name, "registration deferred until active turns finish");
            TraceEvent::CapabilityRegistrationDeferred { name }.emit();
            return Registration::Deferred;
        }

        let kind = capability.kind().as_str();
        let replaced = Self::apply(&mut inner, capability);
        drop(inner);

        TraceEvent::CapabilityRegistered {
            kind,
            name,
            replaced,
        }
        .emit();
        Registration::Applied { replaced }
    }

    fn apply(inner: &mut RegistryInner, capability: Capability) -> bool {
        let mut next = (*inner.current).clone();
        let replaced = next.upsert(capability);
        inner.current = Arc::new(next);
        replaced
    }

    pub fn resolve(&self, name: &str) -> Result<Capability> {
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound(name.to_owned()))
    }

    pub fn resolve_component(&self, name: &str) -> Result<Arc<ComponentCapability>> {
        self.resolve(name)?
            .as_component()
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound(format!("component {name}")))
    }

    pub fn resolve_tool(&self, name: &str) -> Result<Arc<ToolCapability>> {
        self.resolve(name)?
            .as_tool()
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound(format!("tool {name}")))
    }

    /// All capabilities in registration order.
    pub fn list(&self) -> Vec<Capability> {
        self.snapshot().iter().cloned().collect()
    }

    /// Advertisement for the agent, in registration order.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.snapshot().iter().map(Capability::descriptor).collect()
    }

    pub fn snapshot(&self) -> Arc<CapabilitySet> {
        Arc::clone(&self.inner.read().current)
    }

    /// Increases on every applied mutation.
    pub fn generation(&self) -> u64 {
        self.inner.read().current.generation
    }

    pub fn deferred_count(&self) -> usize {
        self.inner.read().deferred.len()
    }

    /// Open a resolution scope for one turn.
    pub fn begin_turn(self: &Arc<Self>) -> TurnScope {
        TurnScope {
            registry: Arc::clone(self),
            snapshot: self.snapshot(),
            pinned: HashSet::new(),
        }
    }

    fn pin(&self, name: &str) {
        *self.inner.write().pins.entry(name.to_owned()).or_insert(0) += 1;
    }

    fn release(&self, names: &HashSet<String>) {
        let mut inner = self.inner.write();
        for name in names {
            if let Some(count) = inner.pins.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    inner.pins.remove(name);
                }
            }
        }

        let (ready, waiting): (Vec<Capability>, Vec<Capability>) =
            std::mem::take(&mut inner.deferred)
                .into_iter()
                .partition(|c| !inner.pins.contains_key(c.name()));
        inner.deferred = waiting;

        let mut applied = Vec::with_capacity(ready.len());
        for capability in ready {
            let kind = capability.kind().as_str();
            let name = capability.name().to_owned();
            let replaced = Self::apply(&mut inner, capability);
            applied.push((kind, name, replaced));
        }
        drop(inner);

        for (kind, name, replaced) in applied {
            tracing::debug!(capability = %name, "deferred registration applied");
            TraceEvent::CapabilityRegistered {
                kind,
                name,
                replaced,
            }
            .emit();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn scope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Name resolution for one turn.
///
/// Every name resolved through the scope is pinned: re-registering it is
/// deferred until the scope is dropped, so a turn never sees a capability
/// change underneath it.  A name missing from the scope's snapshot is
/// looked up again in the live registry when the registry has changed since,
/// so a capability registered mid-turn is still found.
pub struct TurnScope {
    registry: Arc<CapabilityRegistry>,
    snapshot: Arc<CapabilitySet>,
    pinned: HashSet<String>,
}

impl TurnScope {
    pub fn resolve(&mut self, name: &str) -> Result<Capability> {
        if self.snapshot.get(name).is_none()
            && self.registry.generation() != self.snapshot.generation()
        {
            self.snapshot = self.registry.snapshot();
        }
        let capability = self
            .snapshot
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound(name.to_owned()))?;
        if self.pinned.insert(name.to_owned()) {
            self.registry.pin(name);
        }
        Ok(capability)
    }

    pub fn resolve_component(&mut self, name: &str) -> Result<Arc<ComponentCapability>> {
        self.resolve(name)?
            .as_component()
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound(format!("component {name}")))
    }

    pub fn resolve_tool(&mut self, name: &str) -> Result<Arc<ToolCapability>> {
        self.resolve(name)?
            .as_tool()
            .cloned()
            .ok_or_else(|| Error::CapabilityNotFound(format!("tool {name}")))
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.pinned.contains(name)
    }
}

impl Drop for TurnScope {
    fn drop(&mut self) {
        self.registry.release(&self.pinned);
    }
}
