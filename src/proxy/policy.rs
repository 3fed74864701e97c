//! Out-of-band access control (ABAC).
//!
//! Before a session is admitted, the relay asks an external HTTP service
//! whether the client source is permitted. The check fails closed: any
//! transport problem, an exceptional response body, or a non-200 status
//! denies the connection.

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Access-control settings from the `[routing]` section.
#[derive(Debug, Clone, Default)]
pub struct AbacConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Object identifier this relay presents to the service.
    pub id: String,
    pub principal_id: String,
    /// When set, substituted for the real peer in every query.
    pub test_ip: String,
    pub test_port: u16,
}

#[derive(Serialize)]
struct PermissionQuery<'a> {
    principal: &'a str,
    #[serde(rename = "otherValues")]
    other_values: [String; 2],
}

/// Client handle for the access-control service.
///
/// The HTTP handle lives behind a mutex so permission checks are
/// serialized; `reset` replaces it after a transport failure.
#[derive(Debug)]
pub struct AbacClient {
    config: AbacConfig,
    http: Mutex<reqwest::Client>,
}

impl AbacClient {
    pub fn new(config: AbacConfig) -> Self {
        Self {
            http: Mutex::new(Self::build_client()),
            config,
        }
    }

    /// Build the HTTP handle. The relay refuses to run without one.
    fn build_client() -> reqwest::Client {
        match reqwest::Client::builder().build() {
            Ok(client) => client,
            Err(e) => {
                error!("can not initialize access-control client, aborting: {e}");
                std::process::exit(1);
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn url(&self) -> String {
        format!(
            "http://{}:{}/appAccessesObject",
            self.config.host, self.config.port
        )
    }

    /// Whether the service permits a connection from `ip:port`.
    ///
    /// Always true when disabled. False on transport errors (the handle is
    /// reset first), on a body containing `RuntimeException`, and on any
    /// status other than 200.
    pub async fn permitted(&self, ip: &str, port: u16) -> bool {
        if !self.config.enabled {
            return true;
        }

        let (ip, port) = if self.config.test_ip.is_empty() {
            (ip, port)
        } else {
            (self.config.test_ip.as_str(), self.config.test_port)
        };

        let query = PermissionQuery {
            principal: &self.config.principal_id,
            other_values: [format!("{ip}:{port}"), self.config.id.clone()],
        };
        if let Ok(body) = serde_json::to_string(&query) {
            debug!("checking access for {body}");
        }

        let response = {
            let client = self.http.lock().await;
            client.post(self.url()).json(&query).send().await
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                error!("access-control request failed: {e}");
                self.reset().await;
                return false;
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                error!("access-control response failed: {e}");
                self.reset().await;
                return false;
            }
        };
        debug!("access-control result: {body}");

        if body.contains("RuntimeException") {
            debug!("access denied for {ip}:{port}");
            return false;
        }
        if status != reqwest::StatusCode::OK {
            error!("access-control status {status} for {ip}:{port}");
            return false;
        }

        true
    }

    /// Dispose of the HTTP handle and create a fresh one.
    pub async fn reset(&self) {
        *self.http.lock().await = Self::build_client();
    }
}
