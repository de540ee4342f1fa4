//! Reservation key pair removal.
//!
//! Reservations register an SSH key pair with the provider and park the
//! private key in a bucket. Teardown removes both; nothing else in the
//! network lifecycle touches key material.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::gateways::missing_resource;

/// Key pair removal calls.
#[async_trait]
pub trait KeyPairPort: Send + Sync {
    /// Delete the registered key pair and its stored private key. Both
    /// halves tolerate the resource already being gone.
    async fn remove(&self, key_pair_name: &str, object_key: &str) -> Result<()>;
}

/// EC2- and S3-backed implementation of [`KeyPairPort`].
pub struct AwsKeyPairStore {
    ec2: aws_sdk_ec2::Client,
    s3: aws_sdk_s3::Client,
    bucket: Option<String>,
}

impl AwsKeyPairStore {
    /// Wrap the provider clients. Without a bucket only the registered
    /// key pair is removed.
    pub fn new(ec2: aws_sdk_ec2::Client, s3: aws_sdk_s3::Client, bucket: Option<String>) -> Self {
        Self { ec2, s3, bucket }
    }
}

#[async_trait]
impl KeyPairPort for AwsKeyPairStore {
    async fn remove(&self, key_pair_name: &str, object_key: &str) -> Result<()> {
        match &self.bucket {
            Some(bucket) => {
                self.s3
                    .delete_object()
                    .bucket(bucket)
                    .key(object_key)
                    .send()
                    .await
                    .map_err(OrchestratorError::from_s3)?;
                info!(bucket = %bucket, key = %object_key, "deleted stored private key");
            }
            None => {
                debug!("no key pair bucket configured, skipping stored key removal");
            }
        }

        match self
            .ec2
            .delete_key_pair()
            .key_name(key_pair_name)
            .send()
            .await
        {
            Ok(_) => {
                info!(key_pair = %key_pair_name, "deleted key pair");
                Ok(())
            }
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if missing_resource(&err) {
                    Ok(())
                } else {
                    Err(OrchestratorError::from_ec2(err))
                }
            }
        }
    }
}
