pub mod item;
pub mod scheduler;

pub use item::{
    Augmentations, DepSpec, ExtraResult, Phase, SymbolCondition, SymbolDef, SymbolFlags,
    SymbolHandler, SymbolId, SymbolItem, SymbolOutput, SymbolType, SymbolVerdict, PHASE_ORDER,
};
pub use scheduler::{run_phase, ItemState, SchedulerOpts};

use crate::error::ConfigError;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Dependency edges kept for one scheduled item after freeze.
#[derive(Debug, Default, Clone)]
pub struct NodePlan {
    /// (predecessor id, soft edge)
    pub predecessors: Vec<(SymbolId, bool)>,
    pub successors: Vec<SymbolId>,
}

/// The execution plan computed at freeze time: a deterministic order per
/// phase plus the dependency edges the scheduler observes at task time.
#[derive(Debug, Default)]
pub struct FrozenPlan {
    phases: [Vec<SymbolId>; 6],
    nodes: HashMap<SymbolId, NodePlan>,
    fingerprint: u64,
}

impl FrozenPlan {
    pub fn phase_order(&self, phase: Phase) -> &[SymbolId] {
        &self.phases[phase.index()]
    }

    pub fn node(&self, id: SymbolId) -> Option<&NodePlan> {
        self.nodes.get(&id)
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

/// Heap key giving the deterministic (priority desc, name asc) pop order.
struct ReadyKey {
    priority: i32,
    name: String,
    id: SymbolId,
}

impl PartialEq for ReadyKey {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.name == other.name
    }
}

impl Eq for ReadyKey {}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.name.cmp(&self.name))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The symbol registry. Items are registered while the cache is mutable;
/// `freeze` computes the execution plan, after which the cache is shared
/// read-only across tasks.
pub struct SymbolCache {
    items: Vec<SymbolItem>,
    by_name: HashMap<String, SymbolId>,
    pending_deps: Vec<(String, DepSpec)>,
    frozen: Option<FrozenPlan>,
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolCache {
    pub fn new() -> SymbolCache {
        SymbolCache {
            items: Vec::new(),
            by_name: HashMap::new(),
            pending_deps: Vec::new(),
            frozen: None,
        }
    }

    /// Register a symbol. Re-registering an existing name fails unless the
    /// prior registration was a scoreless callback and the new definition
    /// only extends its metadata (the virtual extension rule).
    pub fn register(&mut self, def: SymbolDef) -> Result<SymbolId, ConfigError> {
        if self.frozen.is_some() {
            return Err(ConfigError::Frozen(def.name));
        }

        if let Some(&existing_id) = self.by_name.get(&def.name) {
            let existing = &self.items[existing_id];
            let pure_extension = existing.stype == SymbolType::Callback
                && existing.weight == 0.0
                && def.handler.is_none();
            if !pure_extension {
                return Err(ConfigError::DuplicateSymbol(def.name));
            }
            let item = &mut self.items[existing_id];
            item.weight = def.weight;
            if def.description.is_some() {
                item.description = def.description;
            }
            item.one_shot = def.one_shot;
            log::debug!("extended callback symbol {} with score metadata", item.name);
            return Ok(existing_id);
        }

        let parent = match (&def.stype, &def.parent) {
            (SymbolType::Virtual, None) => return Err(ConfigError::MissingParent(def.name)),
            (SymbolType::Virtual, Some(parent_name)) => {
                match self.by_name.get(parent_name) {
                    Some(&pid) if self.items[pid].stype == SymbolType::Callback => Some(pid),
                    _ => {
                        return Err(ConfigError::InvalidParent {
                            name: def.name,
                            parent: parent_name.clone(),
                        })
                    }
                }
            }
            _ => None,
        };

        let id = self.items.len();
        self.by_name.insert(def.name.clone(), id);
        self.items.push(SymbolItem {
            id,
            name: def.name,
            stype: def.stype,
            flags: def.flags,
            priority: def.priority,
            weight: def.weight,
            one_shot: def.one_shot,
            group: def.group,
            description: def.description,
            parent,
            deps: def.deps,
            allowed_ids: def.allowed_ids,
            forbidden_ids: def.forbidden_ids,
            augmentations: def.augmentations,
            handler: def.handler,
            conditions: Vec::new(),
        });
        Ok(id)
    }

    /// Add a dependency edge by name. Unknown names stay pending until
    /// freeze; edges that never resolve are logged and dropped.
    pub fn register_dependency(&mut self, child: &str, parent: &str) {
        self.pending_deps
            .push((child.to_string(), DepSpec::parse(parent)));
    }

    /// Associate a short-circuit predicate with a symbol.
    pub fn register_condition(
        &mut self,
        name: &str,
        condition: Arc<dyn SymbolCondition>,
    ) -> Result<(), ConfigError> {
        if self.frozen.is_some() {
            return Err(ConfigError::Frozen(name.to_string()));
        }
        match self.by_name.get(name) {
            Some(&id) => {
                self.items[id].conditions.push(condition);
                Ok(())
            }
            None => Err(ConfigError::UnknownSymbol(name.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SymbolItem> {
        self.by_name.get(name).map(|&id| &self.items[id])
    }

    pub fn item(&self, id: SymbolId) -> &SymbolItem {
        &self.items[id]
    }

    /// Mutable access to a registered item for configuration overrides.
    /// Unavailable once frozen.
    pub fn item_by_name_mut(&mut self, name: &str) -> Option<&mut SymbolItem> {
        if self.frozen.is_some() {
            return None;
        }
        let id = *self.by_name.get(name)?;
        Some(&mut self.items[id])
    }

    pub fn items(&self) -> &[SymbolItem] {
        &self.items
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    pub fn plan(&self) -> Option<&FrozenPlan> {
        self.frozen.as_ref()
    }

    pub fn fingerprint(&self) -> u64 {
        self.frozen.as_ref().map(|p| p.fingerprint).unwrap_or(0)
    }

    /// Partition schedulable items into phases, resolve declared
    /// dependencies, topologically sort each phase and record the edges the
    /// scheduler observes. Cycles are diagnosed and their edges dropped.
    pub fn freeze(&mut self) {
        if self.frozen.is_some() {
            log::warn!("symbol cache already frozen");
            return;
        }

        // Fold post-registration dependency declarations into the items.
        let pending = std::mem::take(&mut self.pending_deps);
        for (child, dep) in pending {
            match self.by_name.get(&child) {
                Some(&id) => self.items[id].deps.push(dep),
                None => log::warn!("dependency declared for unknown symbol {child}, dropped"),
            }
        }

        let mut plan = FrozenPlan::default();
        // (from, to, soft) edges within each phase
        let mut edges: [Vec<(SymbolId, SymbolId, bool)>; 6] = Default::default();

        for item in &self.items {
            let phase = match item.stype.phase() {
                Some(p) if item.handler.is_some() => p,
                Some(_) => {
                    log::warn!("symbol {} has no callback and is not scheduled", item.name);
                    continue;
                }
                None => continue,
            };

            for dep in &item.deps {
                let target = match self.by_name.get(&dep.name) {
                    Some(&id) => id,
                    None => {
                        log::warn!(
                            "symbol {} depends on unknown symbol {}, edge dropped",
                            item.name,
                            dep.name
                        );
                        continue;
                    }
                };
                // A dependency on a virtual symbol is a dependency on the
                // callback that produces it.
                let target = match self.items[target].parent {
                    Some(parent) if self.items[target].stype == SymbolType::Virtual => parent,
                    _ => target,
                };
                let target_phase = match self.items[target].stype.phase() {
                    Some(p) => p,
                    None => {
                        log::warn!(
                            "symbol {} depends on unscheduled symbol {}, edge dropped",
                            item.name,
                            dep.name
                        );
                        continue;
                    }
                };

                match target_phase.index().cmp(&phase.index()) {
                    Ordering::Less => {
                        log::debug!(
                            "dependency {} -> {} satisfied by phase ordering",
                            self.items[target].name,
                            item.name
                        );
                    }
                    Ordering::Greater => {
                        log::error!(
                            "symbol {} depends on later-phase symbol {}, edge dropped",
                            item.name,
                            self.items[target].name
                        );
                    }
                    Ordering::Equal => {
                        edges[phase.index()].push((target, item.id, dep.soft));
                    }
                }
            }
        }

        for phase in PHASE_ORDER {
            let members: Vec<SymbolId> = self
                .items
                .iter()
                .filter(|i| i.stype.phase() == Some(phase) && i.handler.is_some())
                .map(|i| i.id)
                .collect();
            let kept = self.sort_phase(phase, &members, &mut edges[phase.index()], &mut plan);
            plan.phases[phase.index()] = kept;
        }

        plan.fingerprint = self.compute_fingerprint();
        log::info!(
            "symbol cache frozen: {} items, fingerprint {:016x}",
            self.items.len(),
            plan.fingerprint
        );
        self.frozen = Some(plan);
    }

    /// Kahn's algorithm over one phase with a (priority desc, name asc)
    /// ready heap. Returns the execution order; cycle edges are removed from
    /// `edges` and the surviving edges recorded in the plan.
    fn sort_phase(
        &self,
        phase: Phase,
        members: &[SymbolId],
        edges: &mut Vec<(SymbolId, SymbolId, bool)>,
        plan: &mut FrozenPlan,
    ) -> Vec<SymbolId> {
        let member_set: HashSet<SymbolId> = members.iter().copied().collect();
        let mut in_deg: HashMap<SymbolId, usize> =
            members.iter().map(|&id| (id, 0)).collect();
        for &(_, to, _) in edges.iter() {
            *in_deg.entry(to).or_insert(0) += 1;
        }

        let mut heap = BinaryHeap::new();
        for &id in members {
            if in_deg[&id] == 0 {
                heap.push(self.ready_key(id));
            }
        }

        let mut order = Vec::with_capacity(members.len());
        let mut done: HashSet<SymbolId> = HashSet::new();

        loop {
            while let Some(key) = heap.pop() {
                order.push(key.id);
                done.insert(key.id);
                for &(from, to, _) in edges.iter() {
                    if from == key.id {
                        let deg = in_deg.get_mut(&to).unwrap();
                        *deg -= 1;
                        if *deg == 0 {
                            heap.push(self.ready_key(to));
                        }
                    }
                }
            }

            if order.len() == members.len() {
                break;
            }

            // Remaining items participate in a cycle: drop the edges between
            // them and schedule the stragglers anyway.
            let remaining: Vec<SymbolId> = members
                .iter()
                .copied()
                .filter(|id| !done.contains(id))
                .collect();
            let names: Vec<&str> = remaining
                .iter()
                .map(|&id| self.items[id].name.as_str())
                .collect();
            log::warn!(
                "dependency cycle in {:?} phase involving [{}], cycle edges dropped",
                phase,
                names.join(", ")
            );
            let remaining_set: HashSet<SymbolId> = remaining.iter().copied().collect();
            edges.retain(|(from, to, _)| {
                !(remaining_set.contains(from) && remaining_set.contains(to) && !done.contains(to))
            });
            for &id in &remaining {
                heap.push(self.ready_key(id));
                in_deg.insert(id, 0);
            }
        }

        for &(from, to, soft) in edges.iter() {
            if member_set.contains(&from) && member_set.contains(&to) {
                plan.nodes.entry(to).or_default().predecessors.push((from, soft));
                plan.nodes.entry(from).or_default().successors.push(to);
            }
        }
        for &id in members {
            plan.nodes.entry(id).or_default();
        }

        order
    }

    fn ready_key(&self, id: SymbolId) -> ReadyKey {
        ReadyKey {
            priority: self.items[id].priority,
            name: self.items[id].name.clone(),
            id,
        }
    }

    /// Fingerprint of the frozen item set, in the manner of a config module
    /// hash: stable across runs for an identical registration set.
    fn compute_fingerprint(&self) -> u64 {
        let mut names: Vec<&SymbolItem> = self.items.iter().collect();
        names.sort_by(|a, b| a.name.cmp(&b.name));
        let mut hasher = DefaultHasher::new();
        for item in names {
            item.name.hash(&mut hasher);
            item.stype.hash(&mut hasher);
            item.priority.hash(&mut hasher);
            item.weight.to_bits().hash(&mut hasher);
            item.flags.hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl SymbolHandler for Noop {
        async fn run(&self, _task: &Task) -> anyhow::Result<SymbolOutput> {
            Ok(SymbolOutput::miss())
        }
    }

    fn filter(name: &str) -> SymbolDef {
        SymbolDef::new(name, SymbolType::Filter).with_handler(Arc::new(Noop))
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut cache = SymbolCache::new();
        cache.register(filter("A")).unwrap();
        let err = cache.register(filter("A")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSymbol(_)));
    }

    #[test]
    fn test_callback_extension_rule() {
        let mut cache = SymbolCache::new();
        cache
            .register(SymbolDef::new("CHECK", SymbolType::Callback).with_handler(Arc::new(Noop)))
            .unwrap();
        // second registration only sets score/description: allowed
        let id = cache
            .register(
                SymbolDef::new("CHECK", SymbolType::Callback)
                    .with_weight(3.0)
                    .with_description("scored"),
            )
            .unwrap();
        assert_eq!(cache.item(id).weight, 3.0);
        // but a third full registration is rejected
        assert!(cache
            .register(SymbolDef::new("CHECK", SymbolType::Filter).with_handler(Arc::new(Noop)))
            .is_err());
    }

    #[test]
    fn test_virtual_requires_callback_parent() {
        let mut cache = SymbolCache::new();
        cache.register(filter("PLAIN")).unwrap();
        let err = cache
            .register(SymbolDef::new("CHILD", SymbolType::Virtual).with_parent("PLAIN"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParent { .. }));

        cache
            .register(SymbolDef::new("CB", SymbolType::Callback).with_handler(Arc::new(Noop)))
            .unwrap();
        assert!(cache
            .register(SymbolDef::new("CHILD", SymbolType::Virtual).with_parent("CB"))
            .is_ok());
    }

    #[test]
    fn test_register_after_freeze_fails() {
        let mut cache = SymbolCache::new();
        cache.register(filter("A")).unwrap();
        cache.freeze();
        assert!(matches!(
            cache.register(filter("B")),
            Err(ConfigError::Frozen(_))
        ));
    }

    #[test]
    fn test_freeze_order_is_deterministic() {
        let build = || {
            let mut cache = SymbolCache::new();
            cache.register(filter("BETA")).unwrap();
            cache.register(filter("ALPHA")).unwrap();
            cache
                .register(filter("URGENT").with_priority(10))
                .unwrap();
            cache.freeze();
            cache
                .plan()
                .unwrap()
                .phase_order(Phase::Filter)
                .iter()
                .map(|&id| cache.item(id).name.clone())
                .collect::<Vec<_>>()
        };
        let order = build();
        assert_eq!(order, vec!["URGENT", "ALPHA", "BETA"]);
        assert_eq!(build(), order);
    }

    #[test]
    fn test_dependency_orders_execution() {
        let mut cache = SymbolCache::new();
        cache.register(filter("LATER").with_dependency("FIRST")).unwrap();
        cache.register(filter("FIRST")).unwrap();
        cache.freeze();
        let order: Vec<&str> = cache
            .plan()
            .unwrap()
            .phase_order(Phase::Filter)
            .iter()
            .map(|&id| cache.item(id).name.as_str())
            .collect();
        assert_eq!(order, vec!["FIRST", "LATER"]);
    }

    #[test]
    fn test_cycle_edges_dropped_with_warning() {
        let mut cache = SymbolCache::new();
        cache.register(filter("A").with_dependency("B")).unwrap();
        cache.register(filter("B").with_dependency("A")).unwrap();
        cache.register(filter("C")).unwrap();
        cache.freeze();
        let plan = cache.plan().unwrap();
        // all three still scheduled
        assert_eq!(plan.phase_order(Phase::Filter).len(), 3);
        // cycle edges are gone
        let a = cache.get("A").unwrap().id;
        let b = cache.get("B").unwrap().id;
        assert!(plan.node(a).unwrap().predecessors.is_empty());
        assert!(plan.node(b).unwrap().predecessors.is_empty());
    }

    #[test]
    fn test_cross_phase_dependency_satisfied_by_ordering() {
        let mut cache = SymbolCache::new();
        cache
            .register(
                SymbolDef::new("EARLY", SymbolType::Prefilter).with_handler(Arc::new(Noop)),
            )
            .unwrap();
        cache.register(filter("MAIN").with_dependency("EARLY")).unwrap();
        cache.freeze();
        let main = cache.get("MAIN").unwrap().id;
        // no runtime edge recorded: the phase ordering already guarantees it
        assert!(cache
            .plan()
            .unwrap()
            .node(main)
            .unwrap()
            .predecessors
            .is_empty());
    }

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let mut a = SymbolCache::new();
        a.register(filter("X").with_weight(1.0)).unwrap();
        a.freeze();
        let mut b = SymbolCache::new();
        b.register(filter("X").with_weight(1.0)).unwrap();
        b.freeze();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = SymbolCache::new();
        c.register(filter("X").with_weight(2.0)).unwrap();
        c.freeze();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
