// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Object store client abstraction
//!
//! The engine only needs idempotent overwrite semantics: writing the same key
//! twice replaces the first object.

pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use s3::{S3ObjectStore, S3Settings};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Cannot read local file '{path}': {message}")]
    LocalRead { path: String, message: String },

    #[error("Access denied for key '{key}'")]
    AccessDenied { key: String },

    #[error("Object store error for key '{key}' (HTTP {status}): {message}")]
    Status {
        key: String,
        status: u16,
        message: String,
    },

    #[error("Object store request failed for key '{key}': {message}")]
    Request { key: String, message: String },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` at `key`. Returns the key written.
    async fn put_content(
        &self,
        body: Bytes,
        key: &str,
        content_type: &str,
    ) -> Result<String, ObjectStoreError>;

    /// Store the contents of a local file at `key`. Returns the key written.
    async fn put_file(&self, local_path: &Path, key: &str) -> Result<String, ObjectStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    fn bucket_name(&self) -> &str;
}
