// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use vp_repr::ErrorKind;

/// An error produced by the pipeline driver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// A query referenced a table the replica does not have.
    #[error("query references unknown table {schema}.{table}")]
    UnknownTable {
        /// The referenced schema.
        schema: String,
        /// The referenced table.
        table: String,
    },
    /// A query referenced a column its table does not have.
    #[error("query references unknown column {column:?} in {schema}.{table}")]
    UnknownColumn {
        /// The referenced schema.
        schema: String,
        /// The referenced table.
        table: String,
        /// The missing column.
        column: String,
    },
    /// A query hash was registered twice.
    #[error("query {0} is already registered")]
    DuplicateQuery(String),
    /// The driver was used before `init`.
    #[error("pipeline driver is not initialized")]
    NotInitialized,
    /// The replica signaled a version but produced no delta, or produced
    /// one out of order.
    #[error("replica cannot advance: {0}")]
    Advance(String),
}

impl PipelineError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnknownTable { .. } | PipelineError::UnknownColumn { .. } => {
                ErrorKind::BadQuery
            }
            PipelineError::DuplicateQuery(_) | PipelineError::NotInitialized => ErrorKind::Internal,
            PipelineError::Advance(_) => ErrorKind::Fatal,
        }
    }
}
