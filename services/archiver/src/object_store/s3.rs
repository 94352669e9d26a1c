// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! S3 implementation of [`ObjectStore`]

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use bytes::Bytes;

use super::{ObjectStore, ObjectStoreError};

/// Connection settings for the target bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack). Enables path-style addressing.
    pub endpoint: Option<String>,
    /// Request AES256 server-side encryption on every put.
    pub server_side_encryption: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            bucket: "record-archive".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            server_side_encryption: true,
        }
    }
}

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    server_side_encryption: bool,
}

impl S3ObjectStore {
    /// Build a client from the default AWS credential chain plus `settings`.
    pub async fn connect(settings: &S3Settings) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::from_client(
            Client::from_conf(builder.build()),
            settings.bucket.clone(),
            settings.server_side_encryption,
        )
    }

    pub fn from_client(client: Client, bucket: String, server_side_encryption: bool) -> Self {
        Self {
            client,
            bucket,
            server_side_encryption,
        }
    }

    fn encryption(&self) -> Option<ServerSideEncryption> {
        self.server_side_encryption
            .then_some(ServerSideEncryption::Aes256)
    }

    async fn put(
        &self,
        body: ByteStream,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<String, ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .set_content_type(content_type.map(str::to_string))
            .set_server_side_encryption(self.encryption())
            .send()
            .await
            .map_err(|e| map_s3_error(e, key))?;

        tracing::debug!(bucket = %self.bucket, key, "Stored object");
        Ok(key.to_string())
    }
}

fn map_s3_error<E>(err: SdkError<E>, key: &str) -> ObjectStoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(service_err) => match service_err.raw().status().as_u16() {
            403 => ObjectStoreError::AccessDenied {
                key: key.to_string(),
            },
            status => ObjectStoreError::Status {
                key: key.to_string(),
                status,
                message,
            },
        },
        _ => ObjectStoreError::Request {
            key: key.to_string(),
            message,
        },
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_content(
        &self,
        body: Bytes,
        key: &str,
        content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        self.put(ByteStream::from(body), key, Some(content_type))
            .await
    }

    async fn put_file(&self, local_path: &Path, key: &str) -> Result<String, ObjectStoreError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| ObjectStoreError::LocalRead {
                path: local_path.display().to_string(),
                message: e.to_string(),
            })?;
        self.put(body, key, None).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(service_err))
                if service_err.raw().status().as_u16() == 404 =>
            {
                Ok(false)
            }
            Err(e) => Err(map_s3_error(e, key)),
        }
    }

    fn bucket_name(&self) -> &str {
        &self.bucket
    }
}
