// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The downstream protocol.
//!
//! Each version increment reaches a client as one poke: a `pokeStart`
//! frame, any number of `pokePart` frames, and a `pokeEnd` frame. The
//! WebSocket framing layer serializes these; the core only guarantees their
//! order and content.

use std::collections::BTreeMap;

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};

use vp_repr::{ClientId, ErrorKind, QueryHash, QuerySpec};

use vp_cvr::PatchOp;

/// Opens a poke. `base_cookie` is the version the client is known to hold
/// (`None` for a client starting from nothing); `cookie` is the version the
/// poke delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    /// Identifies the poke across its frames.
    pub poke_id: String,
    /// The cookie the patches apply on top of.
    pub base_cookie: Option<String>,
    /// The cookie the client holds once the poke is applied.
    pub cookie: String,
}

/// A batch of patches within a poke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    /// The poke this part belongs to.
    pub poke_id: String,
    /// Clients that joined or left the group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients_patch: Option<Vec<ClientPatch>>,
    /// Per-client desired-query changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueryPatch>>>,
    /// Got-set changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueryPatch>>,
    /// Row changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities_patch: Option<Vec<EntityPatch>>,
    /// Mutation-id acknowledgements, merged in by the framing layer; the
    /// core never populates this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_mutation_id_changes: Option<BTreeMap<ClientId, u64>>,
}

impl PokePart {
    /// An empty part for `poke_id`.
    pub fn new(poke_id: String) -> PokePart {
        PokePart {
            poke_id,
            ..Default::default()
        }
    }

    /// Whether the part carries no patches.
    pub fn is_empty(&self) -> bool {
        self.clients_patch.is_none()
            && self.desired_queries_patches.is_none()
            && self.got_queries_patch.is_none()
            && self.entities_patch.is_none()
            && self.last_mutation_id_changes.is_none()
    }
}

/// Closes a poke; the client commits the accumulated patches and adopts the
/// poke's cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    /// The poke being closed.
    pub poke_id: String,
}

/// A client joined (`put`) or left (`del`) the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPatch {
    /// Add or remove.
    pub op: PatchOp,
    /// The affected client.
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
}

/// A query entered (`put`, with its spec) or left (`del`) a query set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPatch {
    /// Add or remove.
    pub op: PatchOp,
    /// The query's hash.
    pub hash: QueryHash,
    /// The compiled query, present on put.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ast: Option<QuerySpec>,
}

/// A row entered (`put`, with contents) or left (`del`) the client's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityPatch {
    /// Add or remove.
    pub op: PatchOp,
    /// The row's qualified table, `schema.table`.
    pub entity_type: String,
    /// The row's primary key.
    #[serde(rename = "entityID")]
    pub entity_id: serde_json::Value,
    /// The row's contents, present on put.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// A message to one client.
///
/// Serializes as the two-element `("pokeStart", {...})` tuples the framing
/// layer puts on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    /// Opens a poke.
    PokeStart(PokeStart),
    /// Carries patches.
    PokePart(PokePart),
    /// Closes a poke.
    PokeEnd(PokeEnd),
}

impl Serialize for Downstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        match self {
            Downstream::PokeStart(body) => {
                tuple.serialize_element("pokeStart")?;
                tuple.serialize_element(body)?;
            }
            Downstream::PokePart(body) => {
                tuple.serialize_element("pokePart")?;
                tuple.serialize_element(body)?;
            }
            Downstream::PokeEnd(body) => {
                tuple.serialize_element("pokeEnd")?;
                tuple.serialize_element(body)?;
            }
        }
        tuple.end()
    }
}

/// The terminal error delivered to a client before its channel closes.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorBody {
    /// The error's taxonomy kind.
    pub kind: ErrorKind,
    /// A human-readable description.
    pub message: String,
}

/// One operation of a desired-queries patch, as carried by
/// `initConnection` and `changeDesiredQueries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DesiredQueryOp {
    /// Desire the query.
    Put {
        /// The query's hash.
        hash: QueryHash,
        /// The compiled query.
        ast: QuerySpec,
    },
    /// Withdraw the desire for the query.
    Del {
        /// The query's hash.
        hash: QueryHash,
    },
    /// Withdraw every desire of the requesting client.
    Clear,
}

/// The identity of one RPC: which client, over which websocket, holding
/// which cookie.
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// The requesting client.
    pub client_id: ClientId,
    /// The websocket the request arrived on. A mismatch against the live
    /// handler marks the message stale.
    pub ws_id: String,
    /// The client's current cookie, `None` for a fresh client.
    pub base_cookie: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downstream_serializes_as_tagged_tuples() {
        let start = Downstream::PokeStart(PokeStart {
            poke_id: "1xz".into(),
            base_cookie: None,
            cookie: "1xz".into(),
        });
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(
            json,
            serde_json::json!(["pokeStart", {"pokeId": "1xz", "baseCookie": null, "cookie": "1xz"}])
        );

        let end = Downstream::PokeEnd(PokeEnd {
            poke_id: "1xz".into(),
        });
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            serde_json::json!(["pokeEnd", {"pokeId": "1xz"}])
        );
    }

    #[test]
    fn test_empty_part_fields_are_omitted() {
        let part = Downstream::PokePart(PokePart::new("1xz".into()));
        assert_eq!(
            serde_json::to_value(&part).unwrap(),
            serde_json::json!(["pokePart", {"pokeId": "1xz"}])
        );
    }

    #[test]
    fn test_desired_query_op_shapes() {
        let ops: Vec<DesiredQueryOp> = serde_json::from_value(serde_json::json!([
            {"op": "put", "hash": "qH", "ast": {"table": "issues"}},
            {"op": "del", "hash": "qH"},
            {"op": "clear"},
        ]))
        .unwrap();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], DesiredQueryOp::Put { hash, .. } if hash == "qH"));
        assert!(matches!(&ops[2], DesiredQueryOp::Clear));
    }
}
