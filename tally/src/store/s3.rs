//! Amazon S3 [`ObjectClient`].
//!
//! This module is only available when the `s3` feature is enabled.
//!
//! Credentials, region and endpoint come from the standard AWS environment
//! (`AWS_REGION`, `AWS_PROFILE`, `AWS_ENDPOINT_URL`, instance roles, ...).
//! The store API is synchronous, so the client drives the SDK on a private
//! current-thread runtime and must not be used from inside another tokio
//! runtime.

use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use tokio::runtime::Runtime;

use crate::error::{Result, StoreError};
use crate::store::ObjectClient;

/// An [`ObjectClient`] backed by `aws-sdk-s3`.
#[derive(Debug)]
pub struct S3Client {
    client: Client,
    runtime: Runtime,
}

impl S3Client {
    /// Builds a client from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Object`] if the runtime cannot be started.
    pub fn from_env() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Object {
                key: String::new(),
                reason: format!("failed to start S3 runtime: {e}"),
            })?;
        let config =
            runtime.block_on(aws_config::load_defaults(aws_config::BehaviorVersion::latest()));
        Ok(Self {
            client: Client::new(&config),
            runtime,
        })
    }
}

impl ObjectClient for S3Client {
    fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_type("application/json")
                    .body(ByteStream::from(body))
                    .send(),
            )
            .map_err(|e| object_error(key, &e))?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = self
            .runtime
            .block_on(self.client.get_object().bucket(bucket).key(key).send())
            .map_err(|e| match &e {
                SdkError::ServiceError(service)
                    if matches!(service.err(), GetObjectError::NoSuchKey(_)) =>
                {
                    StoreError::NotFound {
                        key: key.to_string(),
                    }
                    .into()
                }
                _ => object_error(key, &e),
            })?;

        let data = self
            .runtime
            .block_on(output.body.collect())
            .map_err(|e| StoreError::Object {
                key: key.to_string(),
                reason: format!("failed to read object body: {e}"),
            })?;
        Ok(data.into_bytes().to_vec())
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .runtime
                .block_on(
                    self.client
                        .list_objects_v2()
                        .bucket(bucket)
                        .prefix(prefix)
                        .set_continuation_token(continuation.take())
                        .send(),
                )
                .map_err(|e| object_error(prefix, &e))?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_owned)),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated() == Some(true) => {
                    continuation = Some(token.to_owned());
                }
                _ => break,
            }
        }

        tracing::debug!(bucket, prefix, keys = keys.len(), "listed objects");
        Ok(keys)
    }
}

fn object_error<E, R>(key: &str, error: &SdkError<E, R>) -> crate::error::TallyError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    StoreError::Object {
        key: key.to_string(),
        reason: DisplayErrorContext(error).to_string(),
    }
    .into()
}
