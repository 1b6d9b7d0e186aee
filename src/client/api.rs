//! `BaseAPI`-equivalent: an abstraction over the control server's HTTP
//! endpoints, tracking per-serial worker connection info. Grounded on
//! `examples/original_source/src/usbipice/client/lib/BaseAPI.py`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::error;

use crate::model::ReservedDevice;

/// Where to reach the worker currently hosting a reserved device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ip: String,
    pub server_port: u16,
}

impl ConnectionInfo {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.ip, self.server_port)
    }
}

pub struct BaseApi {
    control_url: String,
    client_name: String,
    http: reqwest::Client,
    connection_info: Mutex<HashMap<String, ConnectionInfo>>,
}

impl BaseApi {
    pub fn new(control_url: String, client_name: String) -> Self {
        Self {
            control_url,
            client_name,
            http: reqwest::Client::new(),
            connection_info: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    fn add_serial(&self, serial: &str, info: ConnectionInfo) {
        self.connection_info.lock().unwrap().insert(serial.to_string(), info);
    }

    /// Manually removes a device. Called after reservations end or devices
    /// fail. Returns whether it was tracked at all.
    pub fn remove_serial(&self, serial: &str) -> bool {
        self.connection_info.lock().unwrap().remove(serial).is_some()
    }

    pub fn serials(&self) -> Vec<String> {
        self.connection_info.lock().unwrap().keys().cloned().collect()
    }

    pub fn connection_info(&self, serial: &str) -> Option<ConnectionInfo> {
        self.connection_info.lock().unwrap().get(serial).cloned()
    }

    /// Whether any serial still points at this connection - used before
    /// tearing down a worker socket, so two reserved devices on the same
    /// worker don't disconnect each other's channel.
    pub fn using_connection(&self, info: &ConnectionInfo) -> bool {
        self.connection_info.lock().unwrap().values().any(|existing| existing == info)
    }

    async fn request_control(&self, endpoint: &str, body: Value) -> Option<Value> {
        let url = format!("{}/{endpoint}", self.control_url);
        match self.http.post(&url).json(&body).timeout(Duration::from_secs(20)).send().await {
            Ok(res) if res.status().is_success() => res.json().await.ok(),
            Ok(res) => {
                error!(endpoint, status = %res.status(), "control request failed");
                None
            }
            Err(err) => {
                error!(endpoint, %err, "control request failed");
                None
            }
        }
    }

    /// Reserves `amount` devices of `kind`, tracking each returned serial's
    /// worker connection info. Returns the reserved serials.
    pub async fn reserve(&self, amount: u32, kind: &str, args: Value) -> Option<Vec<String>> {
        let body = json!({ "amount": amount, "name": self.client_name, "kind": kind, "args": args });
        let data = self.request_control("reserve", body).await?;
        let rows: Vec<ReservedDevice> = serde_json::from_value(data).ok()?;

        let mut serials = Vec::with_capacity(rows.len());
        for row in rows {
            self.add_serial(&row.serial, ConnectionInfo { ip: row.ip, server_port: row.server_port });
            serials.push(row.serial);
        }
        Some(serials)
    }

    pub async fn extend(&self, serials: &[String]) -> Option<Vec<String>> {
        let body = json!({ "name": self.client_name, "serials": serials });
        let data = self.request_control("extend", body).await?;
        serde_json::from_value(data).ok()
    }

    pub async fn extend_all(&self) -> Option<Vec<String>> {
        let body = json!({ "name": self.client_name });
        let data = self.request_control("extendall", body).await?;
        serde_json::from_value(data).ok()
    }

    pub async fn end(&self, serials: &[String]) -> Option<Vec<String>> {
        let body = json!({ "name": self.client_name, "serials": serials });
        let data = self.request_control("end", body).await?;
        let ended: Vec<String> = serde_json::from_value(data).ok()?;
        for serial in &ended {
            self.remove_serial(serial);
        }
        Some(ended)
    }

    pub async fn end_all(&self) -> Option<Vec<String>> {
        let body = json!({ "name": self.client_name });
        let data = self.request_control("endall", body).await?;
        let ended: Vec<String> = serde_json::from_value(data).ok()?;
        for serial in &ended {
            self.remove_serial(serial);
        }
        Some(ended)
    }

    /// Sends `request` straight to the worker hosting `serial` over HTTP
    /// (used for one-off out-of-band calls; the socket channel carries the
    /// ongoing `request`/`event` traffic).
    pub async fn request_worker(&self, serial: &str, endpoint: &str, body: Value) -> Option<Value> {
        let info = self.connection_info(serial)?;
        let url = format!("{}/{endpoint}", info.url());
        self.http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()
    }
}
