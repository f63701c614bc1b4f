// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client handlers and pokers.
//!
//! Each connected client has a [`ClientHandler`] owning the outbound,
//! order-preserving message channel. Pokes go through a [`Poker`], which
//! enforces the `pokeStart` / `pokePart`* / `pokeEnd` framing, filters
//! patches the client already holds, and coalesces patches into bounded
//! parts.

use tokio::sync::mpsc;
use tracing::debug;

use vp_cvr::{ConfigPatch, PatchOp, RowPatch, VersionedConfigPatch, VersionedRowPatch};
use vp_repr::{ClientId, CvrVersion};

use crate::protocol::{
    ClientPatch, Downstream, EntityPatch, ErrorBody, PokeEnd, PokePart, PokeStart, QueryPatch,
};
use crate::SyncerError;

/// The number of patches a poker stages before cutting a `pokePart` frame.
const PATCHES_PER_PART: usize = 2048;

/// The receiving half of a client's downstream channel. The final item
/// before the channel closes is `Err` exactly when the connection is being
/// killed.
pub type DownstreamReceiver = mpsc::UnboundedReceiver<Result<Downstream, ErrorBody>>;

/// The server side of one client connection.
#[derive(Debug)]
pub struct ClientHandler {
    client_id: ClientId,
    ws_id: String,
    version: CvrVersion,
    sender: mpsc::UnboundedSender<Result<Downstream, ErrorBody>>,
}

impl ClientHandler {
    /// Creates a handler whose acknowledged version starts at the client's
    /// base cookie, returning it with the client's receiving half.
    pub fn new(
        client_id: ClientId,
        ws_id: String,
        base_cookie: Option<&str>,
    ) -> Result<(ClientHandler, DownstreamReceiver), SyncerError> {
        let version = CvrVersion::from_base_cookie(base_cookie)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok((
            ClientHandler {
                client_id,
                ws_id,
                version,
                sender,
            },
            receiver,
        ))
    }

    /// The client this handler serves.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The websocket this handler was created for.
    pub fn ws_id(&self) -> &str {
        &self.ws_id
    }

    /// The latest version the client has acknowledged.
    pub fn version(&self) -> &CvrVersion {
        &self.version
    }

    /// Records that the client has been poked up to `version`.
    pub fn set_version(&mut self, version: CvrVersion) {
        debug_assert!(version >= self.version);
        self.version = version;
    }

    /// Whether the client has gone away (its receiver was dropped).
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// A handle on the outbound channel, for watching disconnection from a
    /// task that outlives this borrow.
    pub(crate) fn sender_handle(
        &self,
    ) -> mpsc::UnboundedSender<Result<Downstream, ErrorBody>> {
        self.sender.clone()
    }

    /// Begins a poke carrying the client from its current version to
    /// `version`. The `pokeStart` frame is sent immediately.
    pub fn start_poke(&self, version: CvrVersion) -> Poker {
        let poke_id = version.to_cookie();
        let base_cookie = if self.version == CvrVersion::min() {
            None
        } else {
            Some(self.version.to_cookie())
        };
        let start = PokeStart {
            poke_id: poke_id.clone(),
            base_cookie,
            cookie: poke_id.clone(),
        };
        let sender = self.sender.clone();
        // A send failure means the client is gone; the next sweep will
        // remove the handler.
        let _ = sender.send(Ok(Downstream::PokeStart(start)));
        Poker {
            client_id: self.client_id.clone(),
            sender,
            poke_id: poke_id.clone(),
            base_version: self.version.clone(),
            version,
            part: PokePart::new(poke_id),
            staged: 0,
        }
    }

    /// Kills the connection: delivers a terminal error and closes the
    /// channel.
    pub fn fail(&self, err: ErrorBody) {
        debug!(client = %self.client_id, kind = ?err.kind, "failing client: {}", err.message);
        let _ = self.sender.send(Err(err));
    }
}

/// An in-flight poke to one client.
///
/// Exactly one `pokeEnd` is sent, by [`Poker::end`]; a poker that is
/// dropped instead leaves the poke unterminated, which is only legal when
/// the connection is being killed.
#[derive(Debug)]
pub struct Poker {
    client_id: ClientId,
    sender: mpsc::UnboundedSender<Result<Downstream, ErrorBody>>,
    poke_id: String,
    base_version: CvrVersion,
    version: CvrVersion,
    part: PokePart,
    staged: usize,
}

impl Poker {
    /// The client being poked.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The version this poke delivers.
    pub fn version(&self) -> &CvrVersion {
        &self.version
    }

    /// The version the client held when the poke started.
    pub fn base_version(&self) -> &CvrVersion {
        &self.base_version
    }

    /// Stages a metadata patch. Patches at or below the client's base
    /// version are dropped; the client already has them.
    pub fn add_config_patch(&mut self, patch: &VersionedConfigPatch) {
        if patch.version <= self.base_version {
            return;
        }
        match &patch.patch {
            ConfigPatch::Client { op, client_id } => {
                self.part
                    .clients_patch
                    .get_or_insert_with(Vec::new)
                    .push(ClientPatch {
                        op: *op,
                        client_id: client_id.clone(),
                    });
            }
            ConfigPatch::GotQuery { op, hash, spec } => {
                self.part
                    .got_queries_patch
                    .get_or_insert_with(Vec::new)
                    .push(QueryPatch {
                        op: *op,
                        hash: hash.clone(),
                        ast: spec.clone(),
                    });
            }
            ConfigPatch::DesiredQuery {
                op,
                client_id,
                hash,
                spec,
            } => {
                self.part
                    .desired_queries_patches
                    .get_or_insert_with(Default::default)
                    .entry(client_id.clone())
                    .or_default()
                    .push(QueryPatch {
                        op: *op,
                        hash: hash.clone(),
                        ast: spec.clone(),
                    });
            }
        }
        self.bump_staged();
    }

    /// Stages a row patch. Fails if the row's contents cannot be
    /// represented on this client (e.g. an integer outside the safe
    /// range); the caller is expected to fail the connection.
    pub fn add_row_patch(&mut self, patch: &VersionedRowPatch) -> Result<(), SyncerError> {
        if patch.version <= self.base_version {
            return Ok(());
        }
        let entity = match &patch.patch {
            RowPatch::Put {
                id,
                contents,
                row_version: _,
            } => EntityPatch {
                op: PatchOp::Put,
                entity_type: format!("{}.{}", id.schema, id.table),
                entity_id: id.key.clone(),
                value: Some(contents.clone().into_json()?),
            },
            RowPatch::Del { id } => EntityPatch {
                op: PatchOp::Del,
                entity_type: format!("{}.{}", id.schema, id.table),
                entity_id: id.key.clone(),
                value: None,
            },
        };
        self.part
            .entities_patch
            .get_or_insert_with(Vec::new)
            .push(entity);
        self.bump_staged();
        Ok(())
    }

    fn bump_staged(&mut self) {
        self.staged += 1;
        if self.staged >= PATCHES_PER_PART {
            self.flush_part();
        }
    }

    fn flush_part(&mut self) {
        if self.part.is_empty() {
            return;
        }
        let part = std::mem::replace(&mut self.part, PokePart::new(self.poke_id.clone()));
        self.staged = 0;
        let _ = self.sender.send(Ok(Downstream::PokePart(part)));
    }

    /// Flushes any staged patches and closes the poke, returning the
    /// version the client now holds.
    pub fn end(mut self) -> CvrVersion {
        self.flush_part();
        let _ = self.sender.send(Ok(Downstream::PokeEnd(PokeEnd {
            poke_id: self.poke_id.clone(),
        })));
        self.version
    }
}

#[cfg(test)]
mod tests {
    use vp_repr::{Row, RowId, RowVersion, StateVersion};

    use super::*;

    fn version(state: &str, minor: u32) -> CvrVersion {
        CvrVersion {
            state_version: StateVersion::parse(state).unwrap(),
            minor_version: minor,
        }
    }

    fn row_put(state: &str, minor: u32, id: i64) -> VersionedRowPatch {
        VersionedRowPatch {
            version: version(state, minor),
            patch: RowPatch::Put {
                id: RowId::new("public", "issues", serde_json::json!({"id": id})),
                contents: Row::new().with_column("id", id),
                row_version: RowVersion::new("0a".into()).unwrap(),
            },
        }
    }

    #[tokio::test]
    async fn test_poke_framing() {
        let (handler, mut rx) =
            ClientHandler::new("c1".into(), "ws1".into(), None).unwrap();
        let mut poker = handler.start_poke(version("1xz", 0));
        assert_eq!(poker.client_id(), "c1");
        assert_eq!(poker.version(), &version("1xz", 0));
        poker.add_row_patch(&row_put("1xz", 0, 1)).unwrap();
        poker.add_row_patch(&row_put("1xz", 0, 2)).unwrap();
        let new_version = poker.end();
        assert_eq!(new_version, version("1xz", 0));

        match rx.recv().await.unwrap().unwrap() {
            Downstream::PokeStart(start) => {
                assert_eq!(start.poke_id, "1xz");
                assert_eq!(start.base_cookie, None);
                assert_eq!(start.cookie, "1xz");
            }
            other => panic!("expected pokeStart, got {other:?}"),
        }
        match rx.recv().await.unwrap().unwrap() {
            Downstream::PokePart(part) => {
                assert_eq!(part.poke_id, "1xz");
                assert_eq!(part.entities_patch.unwrap().len(), 2);
            }
            other => panic!("expected pokePart, got {other:?}"),
        }
        match rx.recv().await.unwrap().unwrap() {
            Downstream::PokeEnd(end) => assert_eq!(end.poke_id, "1xz"),
            other => panic!("expected pokeEnd, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poker_skips_patches_client_already_holds() {
        let (handler, mut rx) =
            ClientHandler::new("c1".into(), "ws1".into(), Some("1xz")).unwrap();
        let mut poker = handler.start_poke(version("1y0", 0));
        // At or below the base: dropped.
        poker.add_row_patch(&row_put("1xz", 0, 1)).unwrap();
        // Above the base: delivered.
        poker.add_row_patch(&row_put("1y0", 0, 2)).unwrap();
        poker.end();

        let mut entity_count = 0;
        while let Ok(frame) = rx.try_recv() {
            if let Downstream::PokePart(part) = frame.unwrap() {
                entity_count += part.entities_patch.map_or(0, |p| p.len());
            }
        }
        assert_eq!(entity_count, 1);
    }

    #[tokio::test]
    async fn test_large_pokes_split_into_parts() {
        let (handler, mut rx) =
            ClientHandler::new("c1".into(), "ws1".into(), None).unwrap();
        let mut poker = handler.start_poke(version("1xz", 0));
        for i in 0..(PATCHES_PER_PART + 10) {
            poker.add_row_patch(&row_put("1xz", 0, i as i64)).unwrap();
        }
        poker.end();

        let mut parts = 0;
        while let Ok(frame) = rx.try_recv() {
            if matches!(frame.unwrap(), Downstream::PokePart(_)) {
                parts += 1;
            }
        }
        assert_eq!(parts, 2);
    }

    #[tokio::test]
    async fn test_unsafe_integer_fails_the_patch() {
        let (handler, _rx) = ClientHandler::new("c1".into(), "ws1".into(), None).unwrap();
        let mut poker = handler.start_poke(version("1xz", 0));
        let patch = VersionedRowPatch {
            version: version("1xz", 0),
            patch: RowPatch::Put {
                id: RowId::new("public", "issues", serde_json::json!({"id": 1})),
                contents: Row::new().with_column("big", (1i64 << 53) + 1),
                row_version: RowVersion::new("0a".into()).unwrap(),
            },
        };
        let err = poker.add_row_patch(&patch).unwrap_err();
        assert_eq!(err.kind(), vp_repr::ErrorKind::Internal);
    }
}
