// =============================================================================
// FEDERATION NODE — client.rs
// =============================================================================
//
// Outbound HTTP to other nodes. Every call carries the configured timeout;
// callers treat any error as transient and retry on their next cycle.
// =============================================================================

use crate::constants::*;
use crate::error::{FederationError, FederationResult};
use crate::message::{PullResponse, SignedPayload};
use crate::node::{NodeInfo, NodeRegistrationRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: u64,
    pub uuid: Uuid,
    #[serde(default)]
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagateResponse {
    pub status: String,
    pub complete: bool,
}

#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> FederationResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(PeerClient { http })
    }

    pub async fn fetch_info(&self, base_url: &str, token: Option<&str>) -> FederationResult<NodeInfo> {
        let url = join(base_url, ROUTE_INFO);
        let mut req = self.http.get(&url);
        if let Some(token) = token {
            req = req.query(&[("token", token)]);
        }
        let resp = req.send().await?;
        check(&url, &resp)?;
        Ok(resp.json::<NodeInfo>().await?)
    }

    pub async fn register(
        &self,
        base_url: &str,
        request: &NodeRegistrationRequest,
    ) -> FederationResult<RegisterResponse> {
        let url = join(base_url, ROUTE_REGISTER);
        let resp = self.http.post(&url).json(request).send().await?;
        check(&url, &resp)?;
        Ok(resp.json().await?)
    }

    pub async fn push_message(
        &self,
        base_url: &str,
        signed: &SignedPayload,
    ) -> FederationResult<PropagateResponse> {
        let url = join(base_url, ROUTE_NET_MESSAGE);
        let resp = self
            .http
            .post(&url)
            .header(SIGNATURE_HEADER, &signed.signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(signed.payload.clone())
            .send()
            .await?;
        check(&url, &resp)?;
        Ok(resp.json().await?)
    }

    pub async fn pull_messages(
        &self,
        base_url: &str,
        body: Vec<u8>,
        signature: &str,
    ) -> FederationResult<PullResponse> {
        let url = join(base_url, ROUTE_NET_MESSAGE_PULL);
        let resp = self
            .http
            .post(&url)
            .header(SIGNATURE_HEADER, signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        check(&url, &resp)?;
        Ok(resp.json().await?)
    }
}

fn join(base_url: &str, route: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), route)
}

fn check(url: &str, resp: &reqwest::Response) -> FederationResult<()> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(FederationError::Network(format!("{} returned {}", url, resp.status())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_trims_slash() {
        assert_eq!(join("http://10.0.0.1:8888/", ROUTE_INFO), "http://10.0.0.1:8888/nodes/info");
        assert_eq!(join("http://h:1", ROUTE_NET_MESSAGE_PULL), "http://h:1/nodes/net-message/pull");
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_network_error() {
        let client = PeerClient::new(Duration::from_millis(300)).unwrap();
        // port 9 on loopback: connection refused
        let err = client.fetch_info("http://127.0.0.1:9", None).await.unwrap_err();
        assert!(matches!(err, FederationError::Network(_)));
    }
}
