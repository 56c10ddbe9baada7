// =============================================================================
// Matrixon Room Server - Event Graph Ordering
// =============================================================================
//
// Author: arkSong (arksong2018@gmail.com)
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Orders a batch of events so that every event comes after the events it
//   depends on, either through auth references or prev references.
//
// =============================================================================

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, HashMap},
    sync::Arc,
};

use matrixon_core::PduEvent;
use ruma::OwnedEventId;
use tracing::warn;

/// Which edges define the dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologicalOrder {
    ByAuthEvents,
    ByPrevEvents,
}

impl TopologicalOrder {
    fn edges<'a>(&self, event: &'a PduEvent) -> &'a [OwnedEventId] {
        match self {
            TopologicalOrder::ByAuthEvents => &event.auth_events,
            TopologicalOrder::ByPrevEvents => &event.prev_events,
        }
    }
}

/// Returns `events` dependencies first.
///
/// Only edges between events of the batch count. Ties are broken by depth,
/// then by event ID. Duplicate IDs are dropped. Events caught in a reference
/// cycle are appended at the end in (depth, ID) order.
pub fn reverse_topological_ordering(
    events: &[Arc<PduEvent>],
    order: TopologicalOrder,
) -> Vec<Arc<PduEvent>> {
    let mut by_id: BTreeMap<OwnedEventId, Arc<PduEvent>> = BTreeMap::new();
    for event in events {
        by_id
            .entry(event.event_id.clone())
            .or_insert_with(|| Arc::clone(event));
    }

    let mut pending_deps: HashMap<&OwnedEventId, usize> = HashMap::new();
    let mut dependents: HashMap<&OwnedEventId, Vec<&OwnedEventId>> = HashMap::new();
    for (id, event) in &by_id {
        let mut deps = 0;
        for dep in order.edges(event) {
            if let Some((dep_id, _)) = by_id.get_key_value(dep) {
                if dep_id != id {
                    deps += 1;
                    dependents.entry(dep_id).or_default().push(id);
                }
            }
        }
        pending_deps.insert(id, deps);
    }

    let mut ready: BinaryHeap<Reverse<(u64, &OwnedEventId)>> = pending_deps
        .iter()
        .filter(|(_, deps)| **deps == 0)
        .map(|(id, _)| Reverse((by_id[*id].depth, *id)))
        .collect();

    let mut sorted = Vec::with_capacity(by_id.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        sorted.push(Arc::clone(&by_id[id]));
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(deps) = pending_deps.get_mut(dependent) {
                *deps -= 1;
                if *deps == 0 {
                    ready.push(Reverse((by_id[*dependent].depth, *dependent)));
                }
            }
        }
    }

    if sorted.len() < by_id.len() {
        let mut stuck: Vec<_> = pending_deps
            .iter()
            .filter(|(_, deps)| **deps > 0)
            .map(|(id, _)| Arc::clone(&by_id[*id]))
            .collect();
        stuck.sort_by(|a, b| (a.depth, &a.event_id).cmp(&(b.depth, &b.event_id)));
        warn!(
            cycle_len = stuck.len(),
            "⚠️ Reference cycle in event batch, appending in depth order"
        );
        sorted.extend(stuck);
    }

    sorted
}
