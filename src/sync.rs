//! Sync engine: the single write path of the ledger.
//!
//! Every mutation lands in the local cache and, while disconnected, in
//! the outbox. When connectivity returns the engine drains the outbox in
//! enqueue order, remaps locally-assigned ids to store-assigned ones, and
//! refreshes the cache from the authoritative record set. Drains are
//! single-flight: a request arriving mid-drain sets a flag and the
//! current drain is followed by exactly one more cycle.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::cache;
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::SyncError;
use crate::ledger;
use crate::model::{
    generate_local_id, is_local_id, PaymentMethod, PaymentPatch, PaymentRecord, PaymentStatus,
};
use crate::outbox::{self, OutboxAction, OutboxEntry};
use crate::remote::RemoteStore;

/// The ledger collection name on the remote store.
pub const PAYMENTS: &str = "payments";

/// Lifecycle events for one drain cycle. UI listeners use these to show
/// the sync spinner and the pending badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Started { pending: i64 },
    Finished { remaining: i64 },
}

pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    status_tx: broadcast::Sender<SyncStatus>,
    drain_lock: Mutex<()>,
    rerun_requested: AtomicBool,
    syncing: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            db,
            remote,
            connectivity,
            status_tx,
            drain_lock: Mutex::new(()),
            rerun_requested: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Subscribe to drain lifecycle events. Each subscriber gets its own
    /// receiver; a slow or dropped one never affects the others.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Pending outbox entries across all collections.
    pub fn pending_count(&self) -> Result<i64, SyncError> {
        let conn = self.db.lock()?;
        outbox::len(&conn)
    }

    // -----------------------------------------------------------------------
    // Write paths
    // -----------------------------------------------------------------------

    /// Record a new sale. The authoritative total is computed here, once,
    /// and persisted as `price`.
    ///
    /// Online, the record goes straight to the remote store and the cache
    /// mirrors it under the store-assigned id. Offline (or when the store
    /// turns out to be unreachable), it gets a local id and a queued
    /// create; the call still succeeds immediately.
    pub async fn create_payment(&self, mut record: PaymentRecord) -> Result<PaymentRecord, SyncError> {
        match record.payment_status {
            PaymentStatus::Unpaid => {
                let totals = ledger::compute_totals(
                    &record.line_items,
                    record.sales_channel,
                    record.delivery_fee,
                    record.discount,
                    record.payment_method,
                );
                record.price = totals.final_total;
            }
            // A sale settled at entry goes through the same guards as a
            // later settlement: tender check, discount eligibility,
            // authoritative price.
            PaymentStatus::Paid => {
                let method = record.payment_method.ok_or_else(|| {
                    SyncError::Invalid("paid record has no payment method".to_string())
                })?;
                let tendered = record.amount_tendered;
                let mut unpaid = record.clone();
                unpaid.payment_status = PaymentStatus::Unpaid;
                record = ledger::mark_paid(&unpaid, method, tendered)?;
            }
            PaymentStatus::Voided => {
                return Err(SyncError::Invalid(
                    "a new record cannot start voided".to_string(),
                ))
            }
        }

        let local_id = generate_local_id(record.created_at);

        if self.connectivity.is_online() {
            record.id = None;
            let payload = record.to_value()?;
            let key = format!("create:{local_id}");
            match self.remote.create(PAYMENTS, &payload, &key).await {
                Ok(remote_id) => {
                    record.id = Some(remote_id.clone());
                    let conn = self.db.lock()?;
                    cache::put(&conn, PAYMENTS, &remote_id, &record.to_value()?)?;
                    return Ok(record);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "record store unreachable, queueing create");
                    self.connectivity.set_online(false);
                }
                Err(e) => return Err(e),
            }
        }

        record.id = Some(local_id.clone());
        let payload = record.to_value()?;
        let conn = self.db.lock()?;
        cache::put(&conn, PAYMENTS, &local_id, &payload)?;
        outbox::enqueue(&conn, OutboxAction::Create, PAYMENTS, &local_id, &payload)?;
        info!(id = %local_id, "payment recorded offline");
        Ok(record)
    }

    /// Apply a partial edit to an unpaid record. Present fields
    /// overwrite, omitted fields are retained, and the persisted total
    /// is recomputed from the merged inputs.
    ///
    /// Status changes are not accepted here: settling runs the tender
    /// and discount guards in `settle_payment`, voiding the actor and
    /// remote-id guards in `void_payment`. Once a record is paid, voiding
    /// is the only edit left.
    pub async fn update_payment(
        &self,
        id: &str,
        patch: &PaymentPatch,
    ) -> Result<PaymentRecord, SyncError> {
        if patch.payment_status.is_some() {
            return Err(SyncError::Invalid(
                "status changes go through settle or void, not a field patch".to_string(),
            ));
        }
        let current = self.load_cached(id)?;
        if current.payment_status != PaymentStatus::Unpaid {
            return Err(SyncError::Invalid(format!(
                "record {id} is {}; it can only be voided",
                current.payment_status.as_str()
            )));
        }
        let mut merged = current.merged(patch);
        let totals = ledger::compute_totals(
            &merged.line_items,
            merged.sales_channel,
            merged.delivery_fee,
            merged.discount,
            merged.payment_method,
        );
        merged.price = totals.final_total;
        self.push_updated(merged).await
    }

    /// Settle a record with the chosen method. Recomputes the total
    /// (discount eligibility depends on the method) and enforces
    /// sufficient tender for cash.
    pub async fn settle_payment(
        &self,
        id: &str,
        method: PaymentMethod,
        amount_tendered: Option<f64>,
    ) -> Result<PaymentRecord, SyncError> {
        let current = self.load_cached(id)?;
        let paid = ledger::mark_paid(&current, method, amount_tendered)?;
        self.push_updated(paid).await
    }

    /// Void a record. Requires a store-assigned id and a named actor.
    pub async fn void_payment(
        &self,
        id: &str,
        voided_by: &str,
        voided_at_ms: i64,
    ) -> Result<PaymentRecord, SyncError> {
        let current = self.load_cached(id)?;
        let voided = ledger::mark_voided(&current, voided_by, voided_at_ms)?;
        self.push_updated(voided).await
    }

    fn load_cached(&self, id: &str) -> Result<PaymentRecord, SyncError> {
        let conn = self.db.lock()?;
        match cache::get(&conn, PAYMENTS, id)? {
            Some(v) => PaymentRecord::from_value(&v),
            None => Err(SyncError::NotFound {
                collection: PAYMENTS.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Route a fully-merged record to the store.
    ///
    /// A record still carrying a local id has a pending create in the
    /// outbox; re-enqueueing replaces that payload and create precedence
    /// keeps the whole thing a single replayed create. A synced record
    /// updates in place, falling back to the queue when the store is
    /// unreachable.
    async fn push_updated(&self, record: PaymentRecord) -> Result<PaymentRecord, SyncError> {
        let id = record
            .id
            .clone()
            .ok_or_else(|| SyncError::Invalid("record has no id".to_string()))?;
        let payload = record.to_value()?;

        if !record.has_local_id() && self.connectivity.is_online() {
            match self.remote.update(PAYMENTS, &id, &payload).await {
                Ok(()) => {
                    let conn = self.db.lock()?;
                    cache::put(&conn, PAYMENTS, &id, &payload)?;
                    return Ok(record);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "record store unreachable, queueing update");
                    self.connectivity.set_online(false);
                }
                Err(e) => return Err(e),
            }
        }

        let conn = self.db.lock()?;
        cache::put(&conn, PAYMENTS, &id, &payload)?;
        outbox::enqueue(&conn, OutboxAction::Update, PAYMENTS, &id, &payload)?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// The current record set, from a single source: the remote store
    /// while online, the local cache otherwise. Never a mix of both. A
    /// transient remote failure downgrades to the cache.
    pub async fn current_records(&self) -> Result<Vec<PaymentRecord>, SyncError> {
        if self.connectivity.is_online() {
            match self.remote.list_all(PAYMENTS).await {
                Ok(docs) => return Ok(Self::parse_records(docs)),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "record store unreachable, reading from cache");
                    self.connectivity.set_online(false);
                }
                Err(e) => return Err(e),
            }
        }
        let conn = self.db.lock()?;
        Ok(Self::parse_records(cache::get_all(&conn, PAYMENTS)?))
    }

    fn parse_records(docs: Vec<Value>) -> Vec<PaymentRecord> {
        docs.iter()
            .filter_map(|doc| match PaymentRecord::from_value(doc) {
                Ok(rec) if !rec.deleted => Some(rec),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "skipping malformed payment record");
                    None
                }
            })
            .collect()
    }

    /// Ticket number for a record, ranked within the current record set.
    pub async fn ticket_number(&self, record: &PaymentRecord) -> Result<usize, SyncError> {
        let records = self.current_records().await?;
        Ok(ledger::ticket_number(&records, record))
    }

    // -----------------------------------------------------------------------
    // Drain cycle
    // -----------------------------------------------------------------------

    /// Drain the outbox. Single-flight: a concurrent call does not start
    /// a second cycle, it requests a follow-up and returns; the holder
    /// runs exactly one more cycle after its own, picking up whatever the
    /// interim writes queued.
    pub async fn drain(&self) -> Result<(), SyncError> {
        loop {
            let guard = match self.drain_lock.try_lock() {
                Ok(g) => g,
                Err(_) => {
                    self.rerun_requested.store(true, Ordering::SeqCst);
                    // The holder may have finished between the failed
                    // try_lock and the flag store, in which case nobody
                    // would service the request; retry once and drain
                    // ourselves if the lock is now free.
                    match self.drain_lock.try_lock() {
                        Ok(g) => g,
                        Err(_) => return Ok(()),
                    }
                }
            };
            self.rerun_requested.store(false, Ordering::SeqCst);
            let result = self.drain_cycle().await;
            drop(guard);
            result?;
            if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn drain_cycle(&self) -> Result<(), SyncError> {
        let entries = {
            let conn = self.db.lock()?;
            outbox::pending(&conn, PAYMENTS)?
        };

        self.syncing.store(true, Ordering::SeqCst);
        let _ = self.status_tx.send(SyncStatus::Started {
            pending: entries.len() as i64,
        });

        let replayed = self.replay_entries(entries).await;
        if replayed.is_ok() && self.connectivity.is_online() {
            self.refresh_cache().await?;
        }

        self.syncing.store(false, Ordering::SeqCst);
        let remaining = self.pending_count().unwrap_or(-1);
        let _ = self.status_tx.send(SyncStatus::Finished { remaining });
        info!(remaining, "sync cycle finished");
        replayed
    }

    /// Replay entries in enqueue order. A failing entry stays queued for
    /// the next reconnection and never blocks entries for other ids. A
    /// transient failure means the store is unreachable, so the cycle
    /// ends there; nothing behind it could succeed either.
    ///
    /// An entry whose payload was replaced while its replay was in
    /// flight is not removed: the surviving payload (re-keyed to the
    /// assigned remote id when the in-flight action was a create) drains
    /// in the follow-up cycle.
    async fn replay_entries(&self, entries: Vec<OutboxEntry>) -> Result<(), SyncError> {
        for entry in entries {
            match self.apply_entry(&entry).await {
                Ok(assigned_id) => {
                    let conn = self.db.lock()?;
                    let removed = outbox::remove_if_unchanged(
                        &conn,
                        &entry.collection,
                        &entry.record_id,
                        entry.generation,
                    )?;
                    if !removed {
                        if let Some(remote_id) = assigned_id {
                            if let Some(doc) = outbox::rekey_to_update(
                                &conn,
                                &entry.collection,
                                &entry.record_id,
                                &remote_id,
                            )? {
                                cache::put(&conn, &entry.collection, &remote_id, &doc)?;
                            }
                        }
                        info!(record_id = %entry.record_id, "payload replaced mid-flight, draining in follow-up");
                        self.rerun_requested.store(true, Ordering::SeqCst);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(record_id = %entry.record_id, error = %e, "store unreachable mid-drain");
                    self.connectivity.set_online(false);
                    return Ok(());
                }
                Err(e) => {
                    error!(record_id = %entry.record_id, error = %e, "entry failed, staying queued");
                }
            }
        }
        Ok(())
    }

    /// Returns the store-assigned id for a replayed create.
    async fn apply_entry(&self, entry: &OutboxEntry) -> Result<Option<String>, SyncError> {
        match entry.action {
            OutboxAction::Create => {
                let remote_id = self
                    .remote
                    .create(&entry.collection, &entry.payload, &entry.idempotency_key)
                    .await?;

                // Remap: the record now lives under the store-assigned
                // id; the local-id copy becomes a tombstone.
                let mut doc = entry.payload.clone();
                if let Value::Object(map) = &mut doc {
                    map.insert("id".to_string(), Value::String(remote_id.clone()));
                }
                let conn = self.db.lock()?;
                cache::put(&conn, &entry.collection, &remote_id, &doc)?;
                if entry.record_id != remote_id {
                    cache::mark_deleted(&conn, &entry.collection, &entry.record_id)?;
                }
                info!(local_id = %entry.record_id, remote_id = %remote_id, "queued create applied");
                Ok(Some(remote_id))
            }
            OutboxAction::Update => {
                self.remote
                    .update(&entry.collection, &entry.record_id, &entry.payload)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Overwrite non-pending cache state with the authoritative record
    /// set. Rows with a queued outbox entry keep their local copy; live
    /// rows with a store-assigned id that no longer exist remotely are
    /// tombstoned; local-id rows are pending creates and stay.
    async fn refresh_cache(&self) -> Result<(), SyncError> {
        let docs = match self.remote.list_all(PAYMENTS).await {
            Ok(docs) => docs,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "skipping cache refresh, store unreachable");
                self.connectivity.set_online(false);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let conn = self.db.lock()?;
        let pending_ids: std::collections::HashSet<String> = outbox::pending(&conn, PAYMENTS)?
            .into_iter()
            .map(|e| e.record_id)
            .collect();

        let mut remote_ids = std::collections::HashSet::new();
        for doc in &docs {
            if let Some(id) = doc.get("id").and_then(Value::as_str) {
                remote_ids.insert(id.to_string());
                if !pending_ids.contains(id) {
                    cache::put(&conn, PAYMENTS, id, doc)?;
                }
            }
        }
        for id in cache::live_ids(&conn, PAYMENTS)? {
            if !is_local_id(&id) && !remote_ids.contains(&id) && !pending_ids.contains(&id) {
                cache::mark_deleted(&conn, PAYMENTS, &id)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Background loop
    // -----------------------------------------------------------------------

    /// Watch connectivity and drain on every offline→online edge. Runs
    /// until the monitor is dropped; spawn it once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.connectivity.watch();
        if self.connectivity.is_online() {
            if let Err(e) = self.drain().await {
                error!(error = %e, "startup drain failed");
            }
        }
        while rx.changed().await.is_ok() {
            let online = *rx.borrow_and_update();
            if online {
                info!("connectivity restored, draining outbox");
                if let Err(e) = self.drain().await {
                    error!(error = %e, "drain after reconnect failed");
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
