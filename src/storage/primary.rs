//! Primary attachment backend: an S3-compatible object store. Uploads go
//! under a flat `<millis>-<originalFilename>` key; the bucket is assumed
//! pre-provisioned with whatever public/signed-URL policy the deployment
//! wants (this tier only uploads and reports the resulting URL).

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::config::Config;
use crate::model::now_millis;

/// A thin wrapper over `aws_sdk_s3::Client` bound to one configured bucket.
pub struct PrimaryStore {
    client: Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
}

impl PrimaryStore {
    /// Builds a client from the region/credentials/endpoint settings in
    /// `config`. Credentials fall back to the ambient AWS credential chain
    /// (environment, instance profile, etc.) when not explicitly set.
    pub async fn new(config: &Config) -> Option<Self> {
        let region = config.s3_region.clone()?;
        let bucket = config.s3_bucket.clone()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.clone()));
        if let (Some(key), Some(secret)) = (&config.s3_access_key_id, &config.s3_secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key.clone(),
                secret.clone(),
                None,
                None,
                "mailhook-config",
            ));
        }
        let shared_config = loader.load().await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(endpoint) = &config.s3_endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint.clone());
        }
        if config.s3_force_path_style {
            s3_builder = s3_builder.force_path_style(true);
        }

        Some(PrimaryStore {
            client: Client::from_conf(s3_builder.build()),
            bucket,
            region,
            endpoint: config.s3_endpoint.clone(),
        })
    }

    /// Uploads `bytes` under a fresh `<millis>-<filename>` key and returns
    /// the durable URL on success.
    pub async fn upload(&self, filename: &str, content_type: &str, bytes: Vec<u8>) -> Result<String> {
        let key = format!("{}-{}", now_millis(), filename);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .context("uploading attachment to primary object store")?;

        Ok(self.object_url(&key))
    }

    fn object_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }
}
