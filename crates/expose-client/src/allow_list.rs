//! Allow-list self-registration

use expose_auth::AllowListToken;
use std::net::IpAddr;
use tracing::debug;
use url::Url;

use crate::error::AgentError;

/// Registers IPs on a lease's allow-list over the relay's HTTP front door
#[derive(Clone)]
pub struct AllowListRegistrar {
    client: reqwest::Client,
    endpoint: Url,
}

impl AllowListRegistrar {
    pub fn new(endpoint: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Sign `{ip, port}` with the lease secret and post it to the relay
    pub async fn register(&self, secret: &str, ip: IpAddr, port: u16) -> Result<(), AgentError> {
        let token = AllowListToken::sign(secret, &ip.to_string(), port)?;

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(token)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(AgentError::AllowList(format!("{}: {}", status, body)));
        }

        debug!("Relay accepted {} for port {}: {}", ip, port, body);
        Ok(())
    }
}
