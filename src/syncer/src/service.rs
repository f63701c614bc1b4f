// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The view syncer service.
//!
//! One `ViewSyncer` serves one client group. Its run loop consumes
//! replica-version-ready signals; client RPCs arrive concurrently. Every
//! mutation of the CVR snapshot, the client map, or the pipeline happens
//! under the single fair mutex, so no invariant-violating intermediate
//! state is observable across a suspension point.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use vp_base::now::NowFn;
use vp_cvr::{
    ConfigUpdater, CvrSnapshot, CvrStore, QueryUpdater, RowPatch, RowUpdate, VersionedRowPatch,
    CURSOR_PAGE_SIZE,
};
use vp_pipeline::{PipelineDriver, RowChange};
use vp_repr::{ClientGroupId, ClientId, CvrVersion, ErrorKind, QueryHash, QuerySpec, RowId};

use crate::client::{ClientHandler, DownstreamReceiver, Poker};
use crate::protocol::{DesiredQueryOp, ErrorBody, SyncContext};
use crate::SyncerError;

/// How long a service with no connected clients stays alive.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

struct Inner {
    store: Arc<dyn CvrStore>,
    pipeline: PipelineDriver,
    cvr: Option<CvrSnapshot>,
    clients: BTreeMap<ClientId, ClientHandler>,
    idle_deadline: Option<Instant>,
}

/// The per-client-group orchestrator.
pub struct ViewSyncer {
    client_group_id: ClientGroupId,
    keepalive: Duration,
    now: NowFn,
    state: Mutex<Inner>,
    stop_notify: Notify,
    activity: Arc<Notify>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ViewSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewSyncer")
            .field("client_group_id", &self.client_group_id)
            .finish_non_exhaustive()
    }
}

impl ViewSyncer {
    /// Creates the service for `client_group_id`.
    pub fn new(
        client_group_id: ClientGroupId,
        store: Arc<dyn CvrStore>,
        pipeline: PipelineDriver,
        now: NowFn,
    ) -> ViewSyncer {
        ViewSyncer {
            client_group_id,
            keepalive: DEFAULT_KEEPALIVE,
            now,
            state: Mutex::new(Inner {
                store,
                pipeline,
                cvr: None,
                clients: BTreeMap::new(),
                idle_deadline: None,
            }),
            stop_notify: Notify::new(),
            activity: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Overrides the idle timeout.
    pub fn with_keepalive(mut self, keepalive: Duration) -> ViewSyncer {
        self.keepalive = keepalive;
        self
    }

    /// The group this service owns.
    pub fn client_group_id(&self) -> &ClientGroupId {
        &self.client_group_id
    }

    /// Whether the service has stopped.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Requests a stop. The run loop exits after its current iteration.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    /// Drives the service until it stops: on a stop request, on the version
    /// stream ending, on the idle timeout firing, or on a fatal error.
    pub async fn run(&self, mut version_changes: mpsc::Receiver<()>) {
        {
            let mut inner = self.state.lock().await;
            if let Err(e) = self.ensure_loaded(&mut inner).await {
                error!(group = %self.client_group_id, %e, "view syncer failed to load cvr");
                self.fail_group(&mut inner, &e);
                self.stopped.store(true, Ordering::SeqCst);
                return;
            }
        }
        info!(group = %self.client_group_id, "view syncer running");

        loop {
            if self.stopped() {
                break;
            }
            let deadline = {
                let mut inner = self.state.lock().await;
                self.sweep_closed(&mut inner);
                if inner.clients.is_empty() {
                    if inner.idle_deadline.is_none() {
                        inner.idle_deadline = Some(Instant::now() + self.keepalive);
                        debug!(group = %self.client_group_id, "no clients; idle timer armed");
                    }
                } else {
                    inner.idle_deadline = None;
                }
                inner.idle_deadline
            };

            tokio::select! {
                _ = self.stop_notify.notified() => break,
                _ = self.activity.notified() => {}
                _ = idle_wait(deadline) => {
                    let inner = self.state.lock().await;
                    let expired = inner.clients.is_empty()
                        && inner.idle_deadline.is_some_and(|d| Instant::now() >= d);
                    if expired {
                        info!(group = %self.client_group_id, "idle timeout; stopping");
                        break;
                    }
                }
                signal = version_changes.recv() => match signal {
                    None => break,
                    Some(()) => {
                        if let Err(e) = self.process_signal().await {
                            error!(group = %self.client_group_id, %e, "view syncer failed");
                            let mut inner = self.state.lock().await;
                            self.fail_group(&mut inner, &e);
                            break;
                        }
                    }
                },
            }
        }

        version_changes.close();
        let mut inner = self.state.lock().await;
        inner.clients.clear();
        self.stopped.store(true, Ordering::SeqCst);
        info!(group = %self.client_group_id, "view syncer stopped");
    }

    /// Registers a new connection for `ctx.client_id`, applies its desired
    /// query changes, and returns the downstream channel. Any previous
    /// handler for the client is failed.
    pub async fn init_connection(
        &self,
        ctx: SyncContext,
        patch: Vec<DesiredQueryOp>,
    ) -> Result<DownstreamReceiver, SyncerError> {
        let mut inner = self.state.lock().await;
        let inner = &mut *inner;
        self.ensure_loaded(inner).await?;

        let base = CvrVersion::from_base_cookie(ctx.base_cookie.as_deref())?;
        let cvr = inner.cvr.as_ref().expect("loaded above");
        if base > cvr.version {
            return Err(SyncerError::ClientAhead {
                client_id: ctx.client_id.clone(),
                cookie: base.to_cookie(),
            });
        }

        let (handler, receiver) =
            ClientHandler::new(ctx.client_id.clone(), ctx.ws_id.clone(), ctx.base_cookie.as_deref())?;
        self.watch_for_disconnect(&handler);
        if let Some(old) = inner.clients.insert(ctx.client_id.clone(), handler) {
            old.fail(ErrorBody {
                kind: ErrorKind::StaleConnection,
                message: format!("client {} reconnected on {}", ctx.client_id, ctx.ws_id),
            });
        }
        info!(group = %self.client_group_id, client = %ctx.client_id, ws = %ctx.ws_id,
            "client connected");

        self.apply_desired_queries(inner, &ctx, &patch).await?;
        inner.idle_deadline = None;
        self.activity.notify_one();
        Ok(receiver)
    }

    /// Applies a desired-queries patch for an existing connection. Messages
    /// from a superseded websocket are dropped.
    pub async fn change_desired_queries(
        &self,
        ctx: SyncContext,
        patch: Vec<DesiredQueryOp>,
    ) -> Result<(), SyncerError> {
        let mut inner = self.state.lock().await;
        let inner = &mut *inner;
        self.ensure_loaded(inner).await?;

        match inner.clients.get(&ctx.client_id) {
            Some(handler) if handler.ws_id() == ctx.ws_id => {}
            _ => {
                // The old connection is already gone; nothing to report.
                debug!(group = %self.client_group_id, client = %ctx.client_id, ws = %ctx.ws_id,
                    "dropping message from stale connection");
                return Ok(());
            }
        }
        self.apply_desired_queries(inner, &ctx, &patch).await?;
        self.activity.notify_one();
        Ok(())
    }

    /// Reports liveness and, if the idle timer is armed, pushes it out.
    pub async fn keepalive(&self) -> bool {
        if self.stopped() {
            return false;
        }
        let mut inner = self.state.lock().await;
        if inner.idle_deadline.is_some() {
            inner.idle_deadline = Some(Instant::now() + self.keepalive);
        }
        self.activity.notify_one();
        true
    }

    async fn ensure_loaded(&self, inner: &mut Inner) -> Result<(), SyncerError> {
        if inner.cvr.is_none() {
            let cvr = inner.store.load(&self.client_group_id).await?;
            debug!(group = %self.client_group_id, version = %cvr.version, "cvr loaded");
            inner.cvr = Some(cvr);
        }
        Ok(())
    }

    async fn process_signal(&self) -> Result<(), SyncerError> {
        let mut inner = self.state.lock().await;
        let inner = &mut *inner;
        self.ensure_loaded(inner).await?;
        if !inner.pipeline.initialized() {
            inner.pipeline.init();
            let cvr = inner.cvr.as_ref().expect("loaded above");
            if let Some(replica_version) = &cvr.replica_version {
                let current = inner.pipeline.replica_version();
                if *replica_version != current {
                    return Err(SyncerError::Internal(format!(
                        "cvr was built against replica {replica_version}, found {current}"
                    )));
                }
            }
            self.hydrate_unchanged_queries(inner)?;
            self.sync_query_pipeline_set(inner).await?;
        } else {
            self.advance_pipelines(inner).await?;
        }
        Ok(())
    }

    /// Startup fast path: when the CVR is already at the pipeline's
    /// version, re-register every got query whose stored transformation
    /// hash still matches its spec, discarding the hydration output. This
    /// rebuilds pipeline state without touching the CVR.
    fn hydrate_unchanged_queries(&self, inner: &mut Inner) -> Result<(), SyncerError> {
        let Inner { cvr, pipeline, .. } = inner;
        let cvr = cvr.as_ref().expect("loaded");
        if cvr.version.state_version != pipeline.current_version() {
            return Ok(());
        }
        for query in cvr.queries.values() {
            let unchanged = query.got()
                && query.transformation_hash.as_deref()
                    == Some(query.spec.transformation_hash().as_str());
            if unchanged {
                let _ = pipeline.add_query(&query.id, &query.spec)?;
                debug!(group = %self.client_group_id, query = %query.id, "re-hydrated");
            }
        }
        Ok(())
    }

    /// Converges the pipeline's query set with the CVR's desired set, then
    /// brings every connected client up to date.
    ///
    /// Postcondition: the CVR's state version equals the pipeline's.
    async fn sync_query_pipeline_set(&self, inner: &mut Inner) -> Result<(), SyncerError> {
        let hydrated = inner.pipeline.added_queries();
        let cvr = inner.cvr.as_ref().expect("loaded");
        let desired: BTreeSet<QueryHash> = cvr.desired_queries().cloned().collect();
        let to_add: Vec<(QueryHash, QuerySpec)> = desired
            .iter()
            .filter(|hash| !hydrated.contains(*hash))
            .map(|hash| (hash.clone(), cvr.queries[hash].spec.clone()))
            .collect();
        let to_remove: Vec<QueryHash> = cvr
            .queries
            .keys()
            .filter(|hash| !desired.contains(*hash))
            .cloned()
            .collect();
        let state_lags = cvr.version.state_version < inner.pipeline.current_version();

        if !to_add.is_empty() || !to_remove.is_empty() || state_lags {
            self.add_and_remove_queries(inner, to_add, to_remove).await?;
        } else {
            self.catchup_all_behind(inner).await?;
        }
        debug_assert_eq!(
            inner.cvr.as_ref().expect("loaded").version.state_version,
            inner.pipeline.current_version(),
        );
        Ok(())
    }

    /// Hydrates `to_add`, removes `to_remove`, and delivers the resulting
    /// patches (plus catch-up for clients that were behind) in one poke per
    /// client.
    async fn add_and_remove_queries(
        &self,
        inner: &mut Inner,
        to_add: Vec<(QueryHash, QuerySpec)>,
        to_remove: Vec<QueryHash>,
    ) -> Result<(), SyncerError> {
        let Inner {
            store,
            pipeline,
            cvr: cvr_slot,
            clients,
            ..
        } = inner;
        let cvr = cvr_slot.as_ref().expect("loaded");
        debug!(group = %self.client_group_id, adding = to_add.len(), removing = to_remove.len(),
            "updating query pipeline set");

        let base_version = cvr.version.clone();

        // Hydrate first, so a query whose rows cannot be parsed is dropped
        // (failing its desirers) before anything about it is tracked.
        let mut hydrations: Vec<(QueryHash, Vec<RowChange>)> = Vec::new();
        let mut add_pairs: Vec<(QueryHash, String)> = Vec::new();
        for (hash, spec) in &to_add {
            let changes = pipeline.add_query(hash, spec)?;
            let (kept, poisoned) = split_poisoned(changes);
            if poisoned.is_empty() {
                add_pairs.push((hash.clone(), spec.transformation_hash()));
                hydrations.push((hash.clone(), kept));
            } else {
                pipeline.remove_query(hash);
                self.fail_query_desirers(cvr, clients, &poisoned);
            }
        }

        let mut updater =
            QueryUpdater::new(cvr, pipeline.current_version(), pipeline.replica_version())?;
        let query_patches = updater.track_queries(&add_pairs, &to_remove)?;
        let new_version = updater.updated_version().clone();

        let mut pokers: BTreeMap<ClientId, Poker> = clients
            .iter()
            .map(|(id, handler)| (id.clone(), handler.start_poke(new_version.clone())))
            .collect();
        for patch in &query_patches {
            for poker in pokers.values_mut() {
                poker.add_config_patch(patch);
            }
        }
        for hash in &to_remove {
            pipeline.remove_query(hash);
        }

        let staged = (|| {
            for (_, changes) in hydrations {
                process_changes(changes, &mut updater, &mut pokers, clients)?;
            }
            let del_patches = updater.delete_unreferenced_rows()?;
            push_row_patches(&del_patches, &mut pokers, clients);
            Ok(())
        })();
        match staged {
            Ok(()) => {}
            Err(e) if is_poke_failure(&e) => {
                self.abort_poke_cycle(pipeline, clients, pokers, &e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let new_cvr = updater.flush(store.as_ref(), &self.now).await?;
        debug_assert_eq!(new_cvr.consistency_check(), Ok(()));
        *cvr_slot = Some(new_cvr);
        let cvr = cvr_slot.as_ref().expect("just flushed");

        let excluded: BTreeSet<QueryHash> = add_pairs.into_iter().map(|(hash, _)| hash).collect();
        let failed =
            catchup_clients(cvr, pipeline, store, &mut pokers, &excluded, &base_version).await?;
        for (client_id, body) in failed {
            if let Some(handler) = clients.remove(&client_id) {
                handler.fail(body);
            }
        }
        end_pokes(pokers, clients);
        Ok(())
    }

    /// Pokes catch-up patches to every client behind the current CVR
    /// version. Used when the query pipeline set needed no changes.
    async fn catchup_all_behind(&self, inner: &mut Inner) -> Result<(), SyncerError> {
        let Inner {
            store,
            pipeline,
            cvr,
            clients,
            ..
        } = inner;
        let cvr = cvr.as_ref().expect("loaded");
        let target = cvr.version.clone();
        let mut pokers: BTreeMap<ClientId, Poker> = clients
            .iter()
            .filter(|(_, handler)| *handler.version() < target)
            .map(|(id, handler)| (id.clone(), handler.start_poke(target.clone())))
            .collect();
        if pokers.is_empty() {
            return Ok(());
        }
        let excluded = BTreeSet::new();
        let failed = catchup_clients(cvr, pipeline, store, &mut pokers, &excluded, &target).await?;
        for (client_id, body) in failed {
            if let Some(handler) = clients.remove(&client_id) {
                handler.fail(body);
            }
        }
        end_pokes(pokers, clients);
        Ok(())
    }

    /// The hot path: consumes one replica delta and pokes the resulting row
    /// patches to every connected client.
    async fn advance_pipelines(&self, inner: &mut Inner) -> Result<(), SyncerError> {
        let Inner {
            store,
            pipeline,
            cvr: cvr_slot,
            clients,
            ..
        } = inner;
        let Some(advancement) = pipeline.advance()? else {
            debug!(group = %self.client_group_id, "version signal with no queued delta");
            return Ok(());
        };
        let cvr = cvr_slot.as_ref().expect("loaded");
        debug!(group = %self.client_group_id, version = %advancement.version,
            changes = advancement.num_changes, "advancing pipelines");

        let (changes, poisoned) = split_poisoned(advancement.changes);
        if !poisoned.is_empty() {
            for hash in &poisoned {
                pipeline.remove_query(hash);
            }
            self.fail_query_desirers(cvr, clients, &poisoned);
            if changes.is_empty() {
                // Nothing deliverable in this delta; leave the CVR where it
                // is. The next clean delta advances it.
                return Ok(());
            }
        }

        let mut updater = QueryUpdater::new(
            cvr,
            advancement.version.clone(),
            pipeline.replica_version(),
        )?;
        let new_version = updater.updated_version().clone();
        let mut pokers: BTreeMap<ClientId, Poker> = clients
            .iter()
            .map(|(id, handler)| (id.clone(), handler.start_poke(new_version.clone())))
            .collect();

        match process_changes(changes, &mut updater, &mut pokers, clients) {
            Ok(()) => {}
            Err(e) if is_poke_failure(&e) => {
                self.abort_poke_cycle(pipeline, clients, pokers, &e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let new_cvr = updater.flush(store.as_ref(), &self.now).await?;
        debug_assert_eq!(new_cvr.consistency_check(), Ok(()));
        *cvr_slot = Some(new_cvr);
        end_pokes(pokers, clients);
        Ok(())
    }

    /// Validates and applies one desired-queries patch through a
    /// config-driven updater, then synchronizes the pipeline.
    async fn apply_desired_queries(
        &self,
        inner: &mut Inner,
        ctx: &SyncContext,
        patch: &[DesiredQueryOp],
    ) -> Result<(), SyncerError> {
        // Reject bad queries before anything is recorded.
        for op in patch {
            if let DesiredQueryOp::Put { ast, .. } = op {
                inner.pipeline.validate_query(ast)?;
            }
        }
        {
            let Inner { store, cvr, .. } = inner;
            let cvr_ref = cvr.as_ref().expect("loaded");
            let mut updater = ConfigUpdater::new(cvr_ref);
            updater.put_client(&ctx.client_id);
            for op in patch {
                match op {
                    DesiredQueryOp::Put { hash, ast } => {
                        updater
                            .put_desired_queries(&ctx.client_id, &[(hash.clone(), ast.clone())]);
                    }
                    DesiredQueryOp::Del { hash } => {
                        updater.delete_desired_queries(&ctx.client_id, &[hash.clone()]);
                    }
                    DesiredQueryOp::Clear => {
                        updater.clear_desired_queries(&ctx.client_id);
                    }
                }
            }
            // The returned patches are not pushed here: clients receive
            // them through catch-up, which reads the flushed state.
            let (new_cvr, _patches) = updater.flush(store.as_ref(), &self.now).await?;
            *cvr = Some(new_cvr);
        }
        if inner.pipeline.initialized() {
            self.sync_query_pipeline_set(inner).await?;
        }
        Ok(())
    }

    /// Fails every live client that desires one of `poisoned`: their view
    /// cannot advance past rows the replica produced malformed. Clients of
    /// other queries are untouched.
    fn fail_query_desirers(
        &self,
        cvr: &CvrSnapshot,
        clients: &mut BTreeMap<ClientId, ClientHandler>,
        poisoned: &BTreeSet<QueryHash>,
    ) {
        for hash in poisoned {
            warn!(group = %self.client_group_id, query = %hash,
                "query produced rows with invalid versions; failing its clients");
            let Some(query) = cvr.queries.get(hash) else {
                continue;
            };
            for (client_id, desire) in &query.desired_by {
                if desire.deleted {
                    continue;
                }
                if let Some(handler) = clients.remove(client_id) {
                    handler.fail(ErrorBody {
                        kind: ErrorKind::Internal,
                        message: format!("query {hash} produced a row with an invalid version"),
                    });
                }
            }
        }
    }

    /// Fails every in-flight poke and its client, abandons the staged
    /// update (the CVR is untouched), and drops the pipeline's query
    /// registrations so the next signal re-hydrates from a clean slate.
    fn abort_poke_cycle(
        &self,
        pipeline: &mut PipelineDriver,
        clients: &mut BTreeMap<ClientId, ClientHandler>,
        pokers: BTreeMap<ClientId, Poker>,
        e: &SyncerError,
    ) {
        warn!(group = %self.client_group_id, %e, "poke cycle failed");
        let body = e.to_body();
        for (client_id, poker) in pokers {
            drop(poker);
            if let Some(handler) = clients.remove(&client_id) {
                handler.fail(body.clone());
            }
        }
        for hash in pipeline.added_queries() {
            pipeline.remove_query(&hash);
        }
    }

    /// Closes every client with the given error; used on per-group
    /// failures.
    fn fail_group(&self, inner: &mut Inner, e: &SyncerError) {
        let body = e.to_body();
        for (_, handler) in std::mem::take(&mut inner.clients) {
            handler.fail(body.clone());
        }
    }

    fn sweep_closed(&self, inner: &mut Inner) {
        inner.clients.retain(|client_id, handler| {
            let closed = handler.is_closed();
            if closed {
                debug!(group = %self.client_group_id, client = %client_id, "client went away");
            }
            !closed
        });
    }

    /// Wakes the run loop when the client's receiver is dropped, so the
    /// idle timer can be armed without waiting for the next signal.
    fn watch_for_disconnect(&self, handler: &ClientHandler) {
        let activity = Arc::clone(&self.activity);
        let sender = handler.sender_handle();
        let client_id = handler.client_id().clone();
        vp_base::task::spawn(
            || format!("client-watch-{client_id}"),
            async move {
                sender.closed().await;
                activity.notify_one();
            },
        );
    }
}

async fn idle_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Whether `e` should fail the current poke cycle (pokes aborted, affected
/// clients closed, CVR left at its pre-cycle state, service kept alive)
/// rather than the whole group.
fn is_poke_failure(e: &SyncerError) -> bool {
    e.kind() == ErrorKind::Internal
}

/// Splits a change batch into deliverable changes and the set of queries
/// poisoned by rows with missing or empty version columns. Every change of
/// a poisoned query is dropped, so partially staged state never reaches the
/// CVR.
fn split_poisoned(changes: Vec<RowChange>) -> (Vec<RowChange>, BTreeSet<QueryHash>) {
    let mut poisoned = BTreeSet::new();
    for change in &changes {
        if let Some(row) = &change.row {
            if row.validate_version().is_err() {
                poisoned.insert(change.query_hash.clone());
            }
        }
    }
    if poisoned.is_empty() {
        return (changes, poisoned);
    }
    let kept = changes
        .into_iter()
        .filter(|change| !poisoned.contains(&change.query_hash))
        .collect();
    (kept, poisoned)
}

fn end_pokes(pokers: BTreeMap<ClientId, Poker>, clients: &mut BTreeMap<ClientId, ClientHandler>) {
    for (client_id, poker) in pokers {
        let version = poker.end();
        if let Some(handler) = clients.get_mut(&client_id) {
            handler.set_version(version);
        }
    }
}

/// Pushes row patches to every poker, failing (and removing) any client
/// whose rows cannot be represented for it.
fn push_row_patches(
    patches: &[VersionedRowPatch],
    pokers: &mut BTreeMap<ClientId, Poker>,
    clients: &mut BTreeMap<ClientId, ClientHandler>,
) {
    let ids: Vec<ClientId> = pokers.keys().cloned().collect();
    for client_id in ids {
        let poker = pokers.get_mut(&client_id).expect("key just listed");
        let mut failure = None;
        for patch in patches {
            if let Err(e) = poker.add_row_patch(patch) {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            pokers.remove(&client_id);
            if let Some(handler) = clients.remove(&client_id) {
                handler.fail(e.to_body());
            }
        }
    }
}

/// Folds a stream of pipeline row changes into per-row updates, feeding the
/// updater (and the pokers) one bounded page at a time.
fn process_changes(
    changes: Vec<RowChange>,
    updater: &mut QueryUpdater,
    pokers: &mut BTreeMap<ClientId, Poker>,
    clients: &mut BTreeMap<ClientId, ClientHandler>,
) -> Result<(), SyncerError> {
    let mut batch: BTreeMap<RowId, RowUpdate> = BTreeMap::new();
    for change in changes {
        let update = batch.entry(change.row_id).or_default();
        match change.row {
            Some(row) => {
                *update.ref_counts.entry(change.query_hash).or_insert(0) += 1;
                if update.contents.is_none() {
                    let (contents, version) = row.take_version()?;
                    update.contents = Some(contents);
                    update.version = Some(version);
                }
            }
            None => {
                *update.ref_counts.entry(change.query_hash).or_insert(0) -= 1;
            }
        }
        if batch.len() >= CURSOR_PAGE_SIZE {
            let patches = updater.received(&batch)?;
            push_row_patches(&patches, pokers, clients);
            batch.clear();
        }
    }
    if !batch.is_empty() {
        let patches = updater.received(&batch)?;
        push_row_patches(&patches, pokers, clients);
    }
    Ok(())
}

/// Streams catch-up patches to every poker whose client is behind
/// `to`. Row contents are materialized from the pipeline's snapshot.
///
/// Returns per-client failures for the caller to apply; storage errors fail
/// the group.
async fn catchup_clients(
    cvr: &CvrSnapshot,
    pipeline: &PipelineDriver,
    store: &Arc<dyn CvrStore>,
    pokers: &mut BTreeMap<ClientId, Poker>,
    excluded: &BTreeSet<QueryHash>,
    to: &CvrVersion,
) -> Result<Vec<(ClientId, ErrorBody)>, SyncerError> {
    let mut failed = Vec::new();
    let ids: Vec<ClientId> = pokers.keys().cloned().collect();
    for client_id in ids {
        let poker = pokers.get_mut(&client_id).expect("key just listed");
        if poker.base_version() >= to {
            continue;
        }
        match catchup_one(cvr, pipeline, store, poker, excluded, to).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Internal => {
                failed.push((client_id.clone(), e.to_body()));
                pokers.remove(&client_id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(failed)
}

async fn catchup_one(
    cvr: &CvrSnapshot,
    pipeline: &PipelineDriver,
    store: &Arc<dyn CvrStore>,
    poker: &mut Poker,
    excluded: &BTreeSet<QueryHash>,
    to: &CvrVersion,
) -> Result<(), SyncerError> {
    let from = poker.base_version().clone();
    let config = store.catchup_config_patches(&cvr.id, &from, to).await?;
    for patch in &config {
        poker.add_config_patch(patch);
    }
    let mut rows = store.catchup_row_patches(&cvr.id, &from, to, excluded);
    while let Some(record) = rows.next().await {
        let record = record?;
        let patch = match &record.ref_counts {
            None => VersionedRowPatch {
                version: record.patch_version.clone(),
                patch: RowPatch::Del {
                    id: record.id.clone(),
                },
            },
            Some(_) => {
                let row = pipeline
                    .get_row(&record.id.schema, &record.id.table, &record.id.key)
                    .ok_or_else(|| {
                        SyncerError::Internal(format!(
                            "row {:?} vanished during catch-up",
                            record.id
                        ))
                    })?;
                let (contents, row_version) = row.take_version()?;
                VersionedRowPatch {
                    version: record.patch_version.clone(),
                    patch: RowPatch::Put {
                        id: record.id.clone(),
                        contents,
                        row_version,
                    },
                }
            }
        };
        poker.add_row_patch(&patch)?;
    }
    Ok(())
}
