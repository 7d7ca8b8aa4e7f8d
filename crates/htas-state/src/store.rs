//! StateStore — redb-backed coordination store for the HTAS loops.
//!
//! Provides typed, versioned access to profiles, placements, intents,
//! pending demand, pool state, alerts and tombstones. Each value column
//! holds a JSON-encoded `Versioned<T>`. A conditional write runs as a
//! single redb write transaction (read the stored version, compare,
//! write), and redb serializes write transactions, so the compare and the
//! write cannot interleave with another writer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::snapshot::ClusterSnapshot;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Def = TableDefinition<'static, &'static str, &'static [u8]>;

const EVENT_CAPACITY: usize = 1024;

/// Alerts retained; raising one more drops the oldest.
pub const MAX_ALERTS: usize = 256;

/// Which table a [`StoreEvent`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Profiles,
    Placements,
    Intents,
    Pending,
    Pools,
    Alerts,
    Tombstones,
}

/// Announced after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub table: TableKind,
    pub key: String,
    pub deleted: bool,
}

/// Precondition of a write.
#[derive(Debug, Clone, Copy)]
enum Expect {
    Any,
    Absent,
    Version(u64),
}

impl Expect {
    fn from_option(expected: Option<u64>) -> Self {
        expected.map_or(Expect::Absent, Expect::Version)
    }

    fn check(self, key: &str, found: Option<u64>) -> StateResult<()> {
        let ok = match self {
            Expect::Any => true,
            Expect::Absent => found.is_none(),
            Expect::Version(v) => found == Some(v),
        };
        if ok {
            return Ok(());
        }
        let expected = match self {
            Expect::Version(v) => Some(v),
            _ => None,
        };
        Err(StateError::Conflict {
            key: key.to_string(),
            expected,
            found,
        })
    }
}

/// Decodes only the envelope version of a stored record.
#[derive(serde::Deserialize)]
struct VersionOnly {
    version: u64,
}

#[derive(Serialize)]
struct VersionedRef<'a, T> {
    version: u64,
    value: &'a T,
}

/// Thread-safe coordination store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for tests and simulation).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [PROFILES, PLACEMENTS, INTENTS, PENDING, POOLS, ALERTS, TOMBSTONES] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Watch committed writes. Slow receivers observe `Lagged` and should
    /// fall back to a full snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, table: TableKind, key: &str, deleted: bool) {
        // No receivers is fine.
        let _ = self.events.send(StoreEvent {
            table,
            key: key.to_string(),
            deleted,
        });
    }

    // ── Generic versioned access ───────────────────────────────────

    fn get_in<T: DeserializeOwned>(&self, def: Def, key: &str) -> StateResult<Option<Versioned<T>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: Versioned<T> =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_in<T: DeserializeOwned>(&self, def: Def) -> StateResult<Vec<Versioned<T>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(read_all(&txn, def)?.into_values().collect())
    }

    /// Write `value` under `key` if the stored version satisfies `expect`.
    /// Returns the new version.
    fn write_in<T: Serialize>(
        &self,
        def: Def,
        kind: TableKind,
        key: &str,
        expect: Expect,
        value: &T,
    ) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let found = stored_version(&table, key)?;
            expect.check(key, found)?;
            version = found.map_or(1, |v| v + 1);
            let bytes = serde_json::to_vec(&VersionedRef { version, value })
                .map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.notify(kind, key, false);
        Ok(version)
    }

    /// Remove `key` if the stored version satisfies `expect`. Returns true
    /// if it existed.
    fn delete_in(&self, def: Def, kind: TableKind, key: &str, expect: Expect) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            if let Expect::Version(_) = expect {
                expect.check(key, stored_version(&table, key)?)?;
            }
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            self.notify(kind, key, true);
        }
        Ok(existed)
    }

    /// Read-modify-write with bounded retries on conflict.
    ///
    /// `f` returns false to leave the record untouched. `init` supplies a
    /// value when the key is absent; without it an absent key yields `None`.
    fn modify_in<T, F>(
        &self,
        def: Def,
        kind: TableKind,
        key: &str,
        attempts: u32,
        init: Option<&dyn Fn() -> T>,
        mut f: F,
    ) -> StateResult<Option<Versioned<T>>>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnMut(&mut T) -> bool,
    {
        let mut last_conflict = None;
        for _ in 0..attempts.max(1) {
            let (mut value, expect) = match self.get_in::<T>(def, key)? {
                Some(current) => (current.value, Expect::Version(current.version)),
                None => match init {
                    Some(init) => (init(), Expect::Absent),
                    None => return Ok(None),
                },
            };
            if !f(&mut value) {
                return Ok(None);
            }
            match self.write_in(def, kind, key, expect, &value) {
                Ok(version) => return Ok(Some(Versioned { version, value })),
                Err(e) if e.is_conflict() => {
                    debug!(%key, "conflict, retrying against a fresh read");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or_else(|| StateError::Conflict {
            key: key.to_string(),
            expected: None,
            found: None,
        }))
    }

    // ── Profiles ───────────────────────────────────────────────────

    pub fn get_profile(&self, name: &str) -> StateResult<Option<Versioned<NodeProfile>>> {
        self.get_in(PROFILES, name)
    }

    pub fn list_profiles(&self) -> StateResult<Vec<Versioned<NodeProfile>>> {
        self.list_in(PROFILES)
    }

    /// Conditionally write a profile: `expected` is the version read, or
    /// `None` to create it.
    pub fn put_profile(&self, profile: &NodeProfile, expected: Option<u64>) -> StateResult<u64> {
        self.write_in(
            PROFILES,
            TableKind::Profiles,
            &profile.instance_name,
            Expect::from_option(expected),
            profile,
        )
    }

    /// Read-modify-write a profile. Returns the written record, or `None`
    /// if the profile is absent or `f` declined to change it.
    pub fn modify_profile<F>(
        &self,
        name: &str,
        attempts: u32,
        f: F,
    ) -> StateResult<Option<Versioned<NodeProfile>>>
    where
        F: FnMut(&mut NodeProfile) -> bool,
    {
        self.modify_in(PROFILES, TableKind::Profiles, name, attempts, None, f)
    }

    /// Confirmed termination: delete the profile (if still at `expected`),
    /// tombstone the node and drop its placements, atomically.
    pub fn remove_node(&self, name: &str, expected: u64, now: u64) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let dropped: Vec<String>;
        {
            let mut profiles = txn.open_table(PROFILES).map_err(map_err!(Table))?;
            Expect::Version(expected).check(name, stored_version(&profiles, name)?)?;
            profiles.remove(name).map_err(map_err!(Write))?;

            let mut tombstones = txn.open_table(TOMBSTONES).map_err(map_err!(Table))?;
            let version = stored_version(&tombstones, name)?.map_or(1, |v| v + 1);
            let tombstone = Tombstone {
                node: name.to_string(),
                removed_at: now,
            };
            let bytes = serde_json::to_vec(&VersionedRef {
                version,
                value: &tombstone,
            })
            .map_err(map_err!(Serialize))?;
            tombstones
                .insert(name, bytes.as_slice())
                .map_err(map_err!(Write))?;

            let mut placements = txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
            let mut on_node = Vec::new();
            for entry in placements.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: Versioned<Placement> =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.node == name {
                    on_node.push(key.value().to_string());
                }
            }
            for key in &on_node {
                placements.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            dropped = on_node;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.notify(TableKind::Profiles, name, true);
        self.notify(TableKind::Tombstones, name, false);
        for key in &dropped {
            self.notify(TableKind::Placements, key, true);
        }
        debug!(node = %name, placements = dropped.len(), "node removed");
        Ok(())
    }

    // ── Placements ─────────────────────────────────────────────────

    pub fn get_placement(&self, pod: &str) -> StateResult<Option<Versioned<Placement>>> {
        self.get_in(PLACEMENTS, pod)
    }

    pub fn list_placements(&self) -> StateResult<Vec<Versioned<Placement>>> {
        self.list_in(PLACEMENTS)
    }

    /// Record a bind. Fails with a conflict if the pod already has a placement.
    pub fn create_placement(&self, placement: &Placement) -> StateResult<u64> {
        self.write_in(
            PLACEMENTS,
            TableKind::Placements,
            &placement.pod_id,
            Expect::Absent,
            placement,
        )
    }

    /// Move a placement to a restored pod, dropping the original key.
    pub fn reassign_placement(&self, from_pod: &str, to: &Placement) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version;
        {
            let mut table = txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
            table.remove(from_pod).map_err(map_err!(Write))?;
            version = stored_version(&table, &to.pod_id)?.map_or(1, |v| v + 1);
            let bytes = serde_json::to_vec(&VersionedRef { version, value: to })
                .map_err(map_err!(Serialize))?;
            table
                .insert(to.pod_id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.notify(TableKind::Placements, from_pod, true);
        self.notify(TableKind::Placements, &to.pod_id, false);
        Ok(version)
    }

    pub fn delete_placement(&self, pod: &str) -> StateResult<bool> {
        self.delete_in(PLACEMENTS, TableKind::Placements, pod, Expect::Any)
    }

    // ── Scaling intents ────────────────────────────────────────────

    pub fn get_intent(&self, pool: &str) -> StateResult<Option<Versioned<ScalingIntent>>> {
        self.get_in(INTENTS, pool)
    }

    pub fn list_intents(&self) -> StateResult<Vec<Versioned<ScalingIntent>>> {
        self.list_in(INTENTS)
    }

    /// Create the pool's intent. A conflict means one is already in flight.
    pub fn create_intent(&self, intent: &ScalingIntent) -> StateResult<u64> {
        let version = self.write_in(INTENTS, TableKind::Intents, &intent.pool, Expect::Absent, intent)?;
        debug!(pool = %intent.pool, delta = intent.delta, "intent created");
        Ok(version)
    }

    pub fn update_intent(&self, intent: &ScalingIntent, expected: u64) -> StateResult<u64> {
        self.write_in(
            INTENTS,
            TableKind::Intents,
            &intent.pool,
            Expect::Version(expected),
            intent,
        )
    }

    /// Delete the pool's intent if it is still at `expected`.
    pub fn delete_intent(&self, pool: &str, expected: u64) -> StateResult<bool> {
        self.delete_in(INTENTS, TableKind::Intents, pool, Expect::Version(expected))
    }

    // ── Pending demand ─────────────────────────────────────────────

    pub fn get_pending(&self, pool: &str) -> StateResult<Option<Versioned<PendingDemand>>> {
        self.get_in(PENDING, pool)
    }

    pub fn list_pending(&self) -> StateResult<Vec<Versioned<PendingDemand>>> {
        self.list_in(PENDING)
    }

    /// The packer is the only writer of pending demand.
    pub fn put_pending(&self, demand: &PendingDemand) -> StateResult<u64> {
        self.write_in(PENDING, TableKind::Pending, &demand.pool, Expect::Any, demand)
    }

    // ── Pool state ─────────────────────────────────────────────────

    pub fn get_pool_state(&self, pool: &str) -> StateResult<Option<Versioned<PoolState>>> {
        self.get_in(POOLS, pool)
    }

    /// Claim the pool's structural-change slot: succeeds only if the pool
    /// state is still at `seen` (the version the caller's snapshot held).
    /// Returns false when another loop changed the pool in the meantime.
    pub fn claim_pool_change(&self, pool: &str, seen: Option<u64>, now: u64) -> StateResult<bool> {
        let mut state = match self.get_pool_state(pool)? {
            Some(current) if Some(current.version) == seen => current.value,
            Some(_) => return Ok(false),
            None if seen.is_none() => PoolState::new(pool),
            None => return Ok(false),
        };
        state.last_change_at = Some(now);
        match self.write_in(POOLS, TableKind::Pools, pool, Expect::from_option(seen), &state) {
            Ok(_) => {
                debug!(%pool, "structural change claimed");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write the pool state, creating it if absent.
    pub fn modify_pool_state<F>(
        &self,
        pool: &str,
        attempts: u32,
        f: F,
    ) -> StateResult<Option<Versioned<PoolState>>>
    where
        F: FnMut(&mut PoolState) -> bool,
    {
        let init: &dyn Fn() -> PoolState = &|| PoolState::new(pool);
        self.modify_in(POOLS, TableKind::Pools, pool, attempts, Some(init), f)
    }

    // ── Alerts ─────────────────────────────────────────────────────

    /// Store `alert`, dropping the oldest ones beyond [`MAX_ALERTS`].
    pub fn raise_alert(&self, alert: &Alert) -> StateResult<()> {
        let key = alert.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let expired: Vec<String>;
        {
            let mut table = txn.open_table(ALERTS).map_err(map_err!(Table))?;
            let version = stored_version(&table, &key)?.map_or(1, |v| v + 1);
            let bytes = serde_json::to_vec(&VersionedRef { version, value: alert })
                .map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;

            // Keys start with the zero-padded raise time: iteration is oldest first.
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (k, _) = entry.map_err(map_err!(Read))?;
                keys.push(k.value().to_string());
            }
            let excess = keys.len().saturating_sub(MAX_ALERTS);
            expired = keys.into_iter().take(excess).collect();
            for k in &expired {
                table.remove(k.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.notify(TableKind::Alerts, &key, false);
        for k in &expired {
            self.notify(TableKind::Alerts, k, true);
        }
        if !expired.is_empty() {
            debug!(dropped = expired.len(), "oldest alerts expired");
        }
        Ok(())
    }

    /// All alerts, oldest first.
    pub fn list_alerts(&self) -> StateResult<Vec<Alert>> {
        Ok(self
            .list_in::<Alert>(ALERTS)?
            .into_iter()
            .map(Versioned::into_inner)
            .collect())
    }

    // ── Tombstones ─────────────────────────────────────────────────

    pub fn is_tombstoned(&self, node: &str) -> StateResult<bool> {
        Ok(self.get_in::<Tombstone>(TOMBSTONES, node)?.is_some())
    }

    pub fn list_tombstones(&self) -> StateResult<Vec<Tombstone>> {
        Ok(self
            .list_in::<Tombstone>(TOMBSTONES)?
            .into_iter()
            .map(Versioned::into_inner)
            .collect())
    }

    /// Forget a tombstone once the node object is gone from the orchestrator.
    pub fn clear_tombstone(&self, node: &str) -> StateResult<bool> {
        self.delete_in(TOMBSTONES, TableKind::Tombstones, node, Expect::Any)
    }

    // ── Snapshot ───────────────────────────────────────────────────

    /// Read every table in a single read transaction.
    pub fn snapshot(&self, now: u64) -> StateResult<ClusterSnapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let tombstones: BTreeMap<String, Versioned<Tombstone>> = read_all(&txn, TOMBSTONES)?;
        Ok(ClusterSnapshot {
            taken_at: now,
            profiles: read_all(&txn, PROFILES)?,
            placements: read_all(&txn, PLACEMENTS)?,
            intents: read_all(&txn, INTENTS)?,
            pending: read_all(&txn, PENDING)?,
            pools: read_all(&txn, POOLS)?,
            tombstones: tombstones.into_keys().collect(),
        })
    }
}

fn stored_version<T>(table: &T, key: &str) -> StateResult<Option<u64>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let v: VersionOnly =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(v.version))
        }
        None => Ok(None),
    }
}

fn read_all<T: DeserializeOwned>(
    txn: &ReadTransaction,
    def: Def,
) -> StateResult<BTreeMap<String, Versioned<T>>> {
    let table = txn.open_table(def).map_err(map_err!(Table))?;
    let mut results = BTreeMap::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let record: Versioned<T> =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.insert(key.value().to_string(), record);
    }
    Ok(results)
}
