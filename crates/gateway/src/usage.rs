//! Usage-metering authorization.
//!
//! When a metering endpoint is configured, model creation fetches opaque
//! credentials for the model owner and stores them on the model row. An
//! empty endpoint disables the whole feature.

use async_trait::async_trait;

use crate::error::{Error, Result};

#[async_trait]
pub trait UsageSenderAuthorizationClient: Send + Sync {
    /// Obtains authorization to collect and report usage metrics on behalf
    /// of the given user. The returned bytes are opaque to the gateway.
    async fn get_credentials(&self, application_user: &str) -> Result<Vec<u8>>;
}

#[derive(Debug)]
pub struct HttpUsageAuthorizationClient {
    url: String,
    client: reqwest::Client,
}

impl HttpUsageAuthorizationClient {
    pub fn new(url: &str) -> Result<Self> {
        if url.is_empty() {
            return Err(Error::server_configuration("usage sender URL is empty"));
        }
        let client = reqwest::Client::new();
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl UsageSenderAuthorizationClient for HttpUsageAuthorizationClient {
    async fn get_credentials(&self, application_user: &str) -> Result<Vec<u8>> {
        let res = self
            .client
            .post(format!("{}/v1/authorization", self.url))
            .json(&serde_json::json!({ "user": application_user }))
            .send()
            .await
            .map_err(|err| Error::internal("cannot make omnibus authorization request").with_cause(err))?;
        if !res.status().is_success() {
            return Err(Error::internal(format!(
                "usage authorization failed: {}",
                res.status()
            )));
        }
        let body = res
            .bytes()
            .await
            .map_err(|err| Error::internal("cannot read authorization response").with_cause(err))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn fetches_opaque_credentials() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/authorization")
                    .json_body(serde_json::json!({"user": "alice"}));
                then.status(200).body("opaque-metering-blob");
            })
            .await;

        let client = HttpUsageAuthorizationClient::new(&server.base_url()).expect("client");
        let creds = client.get_credentials("alice").await.expect("credentials");
        assert_eq!(creds, b"opaque-metering-blob");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn propagates_server_failures() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/authorization");
                then.status(503);
            })
            .await;

        let client = HttpUsageAuthorizationClient::new(&server.base_url()).expect("client");
        let err = client.get_credentials("alice").await.expect_err("failure");
        assert!(err.to_string().contains("usage authorization failed"));
    }

    #[test]
    fn empty_url_is_a_configuration_error() {
        let err = HttpUsageAuthorizationClient::new("").expect_err("empty url");
        assert_eq!(err.code(), crate::error::ErrorCode::ServerConfiguration);
    }
}
