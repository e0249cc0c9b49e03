//! JSON-RPC client for the Xen Orchestra API.
//!
//! Requests are JSON-RPC 2.0 envelopes POSTed to `<url>/api/` and
//! authenticated with the `authenticationToken` cookie. Object lookups go
//! through `xo.getAllObjects` with a filter; mutations use `vm.attachDisk`,
//! `vbd.connect` and `vbd.disconnect`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::COOKIE;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{Vbd, Vdi, Vm, XoApi, XoError};
use crate::config::XoConfig;

/// Production [`XoApi`] implementation.
pub struct XoClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl XoClient {
    /// Build a client from the `xo` configuration section.
    pub fn new(cfg: &XoConfig) -> Result<Self, XoError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .danger_accept_invalid_certs(cfg.insecure)
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/api/", cfg.url.trim_end_matches('/')),
            token: cfg.token.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    /// The JSON-RPC endpoint requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip(self, params), level = "debug")]
    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, XoError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let bytes = self
            .http
            .post(&self.endpoint)
            .header(COOKIE, format!("authenticationToken={}", self.token))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        debug!(method, id, len = bytes.len(), "xo api response");
        decode_response(&bytes)
    }

    async fn objects<T: DeserializeOwned>(&self, filter: Value) -> Result<Vec<T>, XoError> {
        let map: HashMap<String, Value> = self
            .call("xo.getAllObjects", json!({ "filter": filter }))
            .await?;
        map.into_values()
            .map(|v| serde_json::from_value(v).map_err(XoError::from))
            .collect()
    }
}

/// Decode a JSON-RPC response body into the `result` payload.
fn decode_response<R: DeserializeOwned>(body: &[u8]) -> Result<R, XoError> {
    let resp: RpcResponse = serde_json::from_slice(body)?;
    if let Some(err) = resp.error {
        return Err(XoError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    Ok(serde_json::from_value(resp.result.unwrap_or(Value::Null))?)
}

#[async_trait]
impl XoApi for XoClient {
    async fn get_vdi(&self, vdi_id: &str) -> Result<Vdi, XoError> {
        self.objects(json!({ "type": "VDI", "id": vdi_id }))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| XoError::NotFound {
                kind: "VDI",
                id: vdi_id.to_owned(),
            })
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Vm, XoError> {
        self.objects(json!({ "type": "VM", "id": vm_id }))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| XoError::NotFound {
                kind: "VM",
                id: vm_id.to_owned(),
            })
    }

    async fn list_vbds_for_vdi(&self, vdi_id: &str) -> Result<Vec<Vbd>, XoError> {
        self.objects(json!({ "type": "VBD", "VDI": vdi_id })).await
    }

    #[instrument(skip(self))]
    async fn attach_vdi(&self, vdi_id: &str, vm_id: &str) -> Result<(), XoError> {
        let accepted: bool = self
            .call(
                "vm.attachDisk",
                json!({ "vm": vm_id, "vdi": vdi_id, "mode": "RW" }),
            )
            .await?;
        if !accepted {
            return Err(XoError::Rejected {
                method: "vm.attachDisk".into(),
                reason: format!("VDI {vdi_id} could not be attached to VM {vm_id}"),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(vbd = %vbd.id))]
    async fn connect_vbd(&self, vbd: &Vbd) -> Result<(), XoError> {
        let _: Value = self.call("vbd.connect", json!({ "id": vbd.id })).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(vbd = %vbd.id))]
    async fn disconnect_vbd(&self, vbd: &Vbd) -> Result<(), XoError> {
        let _: Value = self.call("vbd.disconnect", json!({ "id": vbd.id })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalizes_trailing_slash() {
        let cfg = XoConfig {
            url: "https://xo.example.org/".into(),
            token: "t".into(),
            ..Default::default()
        };
        let client = XoClient::new(&cfg).expect("client");
        assert_eq!(client.endpoint(), "https://xo.example.org/api/");
    }

    #[test]
    fn decodes_result() {
        let ok: bool = decode_response(br#"{"jsonrpc":"2.0","id":1,"result":true}"#).unwrap();
        assert!(ok);

        let objects: HashMap<String, Vbd> = decode_response(
            br#"{"jsonrpc":"2.0","id":2,"result":{
                "vbd-1":{"id":"vbd-1","VDI":"v1","VM":"n1","attached":false,"device":null}
            }}"#,
        )
        .unwrap();
        assert!(!objects["vbd-1"].attached);
    }

    #[test]
    fn decodes_rpc_error() {
        let err = decode_response::<Value>(
            br#"{"jsonrpc":"2.0","id":3,"error":{"code":10,"message":"invalid parameters"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, XoError::Rpc { code: 10, .. }));
    }

    #[test]
    fn null_result_for_unit_calls() {
        let v: Value = decode_response(br#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert!(v.is_null());
    }
}
