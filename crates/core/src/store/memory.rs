//! Process-local store.

use super::{
    apply_transaction, has_identifier, CanonicalRecord, StoreClient, StoreError, StoreOperation,
    StoreResult,
};
use crate::retry::CallContext;
use chrono::{SecondsFormat, Utc};
use fhir::{Bundle, Entity, LogicalId, ResourceType};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MemoryState {
    records: Vec<CanonicalRecord>,
    next_id: u64,
    faults: HashMap<StoreOperation, VecDeque<StoreError>>,
    calls: HashMap<StoreOperation, usize>,
}

/// In-memory canonical store.
///
/// Logical ids are assigned sequentially (`"1"`, `"2"`, ...). Uniqueness of business
/// identifiers is not enforced, so duplicates can be seeded deliberately.
///
/// Faults queued with [`InMemoryStore::inject_faults`] are returned, in order, by the next
/// calls of that operation before the operation runs normally again.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues errors to be returned by the next calls of `operation`.
    pub fn inject_faults(
        &self,
        operation: StoreOperation,
        faults: impl IntoIterator<Item = StoreError>,
    ) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .extend(faults);
    }

    /// Number of calls made for `operation`, including failed ones.
    pub fn calls(&self, operation: StoreOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Total calls across every operation.
    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Snapshot of every stored record of `resource_type`.
    pub fn records(&self, resource_type: ResourceType) -> Vec<CanonicalRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect()
    }

    /// Counts the call, checks the context and pops any injected fault.
    fn begin(&self, ctx: &CallContext, operation: StoreOperation) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_insert(0) += 1;
        ctx.check()?;
        if let Some(fault) = state.faults.get_mut(&operation).and_then(VecDeque::pop_front) {
            return Err(fault);
        }
        Ok(state)
    }

    fn write(state: &mut MemoryState, entity: &Entity, id: LogicalId) -> StoreResult<CanonicalRecord> {
        let resource_type = entity.resource_type();
        let position = state
            .records
            .iter()
            .position(|r| r.resource_type == resource_type && r.id == id);
        let version = position
            .and_then(|i| state.records[i].version.as_deref())
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(1, |v| v + 1);

        let mut stored = entity.clone();
        stored.set_id(Some(id));
        stored.stamp_meta(
            &version.to_string(),
            &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        let record = CanonicalRecord::from_entity(stored)?;
        match position {
            Some(i) => state.records[i] = record.clone(),
            None => state.records.push(record.clone()),
        }
        Ok(record)
    }
}

impl StoreClient for InMemoryStore {
    fn search_by_identifier(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        system: &str,
        value: &str,
    ) -> StoreResult<Vec<CanonicalRecord>> {
        let state = self.begin(ctx, StoreOperation::Search)?;
        Ok(state
            .records
            .iter()
            .filter(|r| r.resource_type == resource_type && has_identifier(&r.entity, system, value))
            .cloned()
            .collect())
    }

    fn read(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord> {
        let state = self.begin(ctx, StoreOperation::Read)?;
        state
            .records
            .iter()
            .find(|r| r.resource_type == resource_type && &r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                resource_type,
                id: id.to_string(),
            })
    }

    fn create(&self, ctx: &CallContext, entity: &Entity) -> StoreResult<CanonicalRecord> {
        let mut state = self.begin(ctx, StoreOperation::Create)?;
        state.next_id += 1;
        let id = LogicalId::new(state.next_id.to_string())
            .map_err(|e| StoreError::permanent(e.to_string()))?;
        Self::write(&mut state, entity, id)
    }

    fn update(
        &self,
        ctx: &CallContext,
        entity: &Entity,
        id: &LogicalId,
    ) -> StoreResult<CanonicalRecord> {
        let mut state = self.begin(ctx, StoreOperation::Update)?;
        Self::write(&mut state, entity, id.clone())
    }

    fn delete(
        &self,
        ctx: &CallContext,
        resource_type: ResourceType,
        id: &LogicalId,
    ) -> StoreResult<()> {
        let mut state = self.begin(ctx, StoreOperation::Delete)?;
        let before = state.records.len();
        state
            .records
            .retain(|r| !(r.resource_type == resource_type && &r.id == id));
        if state.records.len() == before {
            return Err(StoreError::NotFound {
                resource_type,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn transaction(&self, ctx: &CallContext, bundle: &Bundle) -> StoreResult<Bundle> {
        drop(self.begin(ctx, StoreOperation::Transaction)?);
        apply_transaction(self, ctx, bundle)
    }
}
