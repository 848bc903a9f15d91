//! etcd v3 cache over the HTTP/JSON gateway.
//!
//! Keys and values travel base64-encoded. Per-entry TTLs are etcd leases:
//! each `set` with a TTL grants a lease and attaches the key to it, so the
//! server drops the key when the lease runs out.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use captcha_common::constants::CACHE_CONNECT_TIMEOUT_SECS;
use captcha_common::{CacheError, FactoryError};

use super::CacheStore;
use crate::config::ResolvedConfig;

const RANGE_PATH: &str = "/v3/kv/range";
const PUT_PATH: &str = "/v3/kv/put";
const DELETE_PATH: &str = "/v3/kv/deleterange";
const LEASE_GRANT_PATH: &str = "/v3/lease/grant";
const STATUS_PATH: &str = "/v3/maintenance/status";
const AUTH_PATH: &str = "/v3/auth/authenticate";

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    /// Omitted by the gateway when empty
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    /// int64, rendered as a JSON string by the gateway
    #[serde(rename = "ID")]
    id: Value,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

/// etcd cache client. Clones share the HTTP pool and auth token.
#[derive(Clone)]
pub struct EtcdCache {
    http: reqwest::Client,
    /// Base URLs, tried in order
    endpoints: Vec<String>,
    prefix: String,
    default_ttl: Duration,
    credentials: Option<(String, SecretString)>,
    token: Arc<RwLock<Option<String>>>,
}

impl EtcdCache {
    /// Build the client, authenticate if credentials are configured, and
    /// verify that at least one endpoint answers a status request.
    pub async fn connect(config: &ResolvedConfig) -> Result<Self, FactoryError> {
        if config.cache_addrs.is_empty() {
            return Err(FactoryError::MissingEndpoints("etcd".to_string()));
        }

        let addrs = config.cache_addrs.join(",");
        let failed = |reason: String| FactoryError::ConnectionFailed {
            backend: "etcd".to_string(),
            addr: addrs.clone(),
            reason,
        };

        let timeout = Duration::from_secs(CACHE_CONNECT_TIMEOUT_SECS);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| failed(e.to_string()))?;

        let credentials = config.cache_username.clone().map(|user| {
            let password = config
                .cache_password
                .clone()
                .unwrap_or_else(|| SecretString::new("".into()));
            (user, password)
        });

        let cache = Self {
            http,
            endpoints: config
                .cache_addrs
                .iter()
                .map(|addr| format!("http://{addr}"))
                .collect(),
            prefix: config.cache_key_prefix.clone(),
            default_ttl: config.cache_ttl(),
            credentials,
            token: Arc::new(RwLock::new(None)),
        };

        cache
            .authenticate()
            .await
            .map_err(|e| failed(e.to_string()))?;
        cache
            .request::<Value>(STATUS_PATH, json!({}))
            .await
            .map_err(|e| failed(e.to_string()))?;

        tracing::info!(addrs = %addrs, "Etcd cache connected");

        Ok(cache)
    }

    fn key(&self, key: &str) -> String {
        STANDARD.encode(format!("{}{}", self.prefix, key))
    }

    /// POST to the first endpoint that accepts the connection
    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, CacheError> {
        let token = self.token.read().await.clone();
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let mut request = self.http.post(format!("{endpoint}{path}")).json(body);
            if let Some(token) = &token {
                request = request.header(reqwest::header::AUTHORIZATION, token);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "Etcd endpoint unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(CacheError::Backend(match last_error {
            Some(e) => e.to_string(),
            None => "no etcd endpoints configured".to_string(),
        }))
    }

    /// POST and decode, re-authenticating once if the token was rejected
    async fn request<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, CacheError> {
        let mut response = self.post(path, &body).await?;

        if response.status() == StatusCode::UNAUTHORIZED && self.credentials.is_some() {
            tracing::debug!("Etcd token rejected, re-authenticating");
            self.authenticate().await?;
            response = self.post(path, &body).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CacheError::Backend(format!(
                "etcd {path} returned {status}: {detail}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// Obtain a fresh auth token. No-op without credentials.
    async fn authenticate(&self) -> Result<(), CacheError> {
        let Some((name, password)) = &self.credentials else {
            return Ok(());
        };

        *self.token.write().await = None;

        let body = json!({ "name": name, "password": password.expose_secret() });
        let response = self.post(AUTH_PATH, &body).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::Backend(format!(
                "etcd authentication returned {status}"
            )));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        *self.token.write().await = Some(auth.token);

        Ok(())
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<i64, CacheError> {
        let response: LeaseGrantResponse = self
            .request(LEASE_GRANT_PATH, json!({ "TTL": lease_secs(ttl), "ID": 0 }))
            .await?;

        parse_i64(&response.id)
            .ok_or_else(|| CacheError::Serialization(format!("invalid lease id {}", response.id)))
    }
}

/// etcd leases are whole seconds; round up and never go below one
fn lease_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    secs.max(1)
}

fn parse_i64(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => other.as_i64(),
    }
}

fn decode_value(encoded: &str) -> Result<String, CacheError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
}

#[async_trait]
impl CacheStore for EtcdCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let response: RangeResponse = self
            .request(RANGE_PATH, json!({ "key": self.key(key) }))
            .await?;

        response
            .kvs
            .first()
            .map(|kv| decode_value(&kv.value))
            .transpose()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut body = json!({
            "key": self.key(key),
            "value": STANDARD.encode(value),
        });

        if !ttl.is_zero() {
            let lease = self.grant_lease(ttl).await?;
            body["lease"] = json!(lease.to_string());
        }

        self.request::<Value>(PUT_PATH, body).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.request::<Value>(DELETE_PATH, json!({ "key": self.key(key) }))
            .await?;
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use captcha_common::CacheType;
    use tokio_test::assert_ok;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn etcd_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "version": "3.5.0" })))
            .mount(&server)
            .await;
        server
    }

    fn etcd_config(addrs: Vec<String>, ttl_secs: u64) -> ResolvedConfig {
        ResolvedConfig {
            cache_type: CacheType::Etcd,
            cache_addrs: addrs,
            cache_ttl_secs: ttl_secs,
            cache_key_prefix: "T:".to_string(),
            ..Default::default()
        }
    }

    fn encoded(raw: &str) -> String {
        STANDARD.encode(raw)
    }

    #[test]
    fn test_lease_secs_rounds_up() {
        assert_eq!(lease_secs(Duration::from_secs(30)), 30);
        assert_eq!(lease_secs(Duration::from_millis(1500)), 2);
        assert_eq!(lease_secs(Duration::from_millis(10)), 1);
    }

    #[test]
    fn test_parse_lease_id() {
        assert_eq!(parse_i64(&json!("7587862070224434954")), Some(7587862070224434954));
        assert_eq!(parse_i64(&json!(42)), Some(42));
        assert_eq!(parse_i64(&json!("not-a-number")), None);
    }

    #[test]
    fn test_range_response_decoding() {
        let body = json!({
            "header": { "revision": "5" },
            "kvs": [{ "key": STANDARD.encode("GO_CAPTCHA_DATA:k"), "value": STANDARD.encode("v") }],
            "count": "1"
        });
        let response: RangeResponse = serde_json::from_value(body).unwrap();
        assert_eq!(decode_value(&response.kvs[0].value).unwrap(), "v");

        let empty: RangeResponse = serde_json::from_value(json!({ "header": {} })).unwrap();
        assert!(empty.kvs.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_payload() {
        assert!(matches!(decode_value("%%%"), Err(CacheError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = ResolvedConfig {
            cache_type: captcha_common::CacheType::Etcd,
            cache_addrs: vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()],
            ..Default::default()
        };

        let err = EtcdCache::connect(&config).await.err().unwrap();
        assert!(
            matches!(err, FactoryError::ConnectionFailed { ref addr, .. } if addr == "127.0.0.1:1,127.0.0.1:2")
        );
    }

    #[tokio::test]
    async fn test_put_range_delete_against_gateway() {
        let server = etcd_server().await;

        Mock::given(method("POST"))
            .and(path(PUT_PATH))
            .and(body_partial_json(json!({ "key": encoded("T:captcha-1"), "value": encoded("answer") })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RANGE_PATH))
            .and(body_partial_json(json!({ "key": encoded("T:captcha-1") })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kvs": [{ "key": encoded("T:captcha-1"), "value": encoded("answer") }],
                "count": "1"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RANGE_PATH))
            .and(body_partial_json(json!({ "key": encoded("T:missing") })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(DELETE_PATH))
            .and(body_partial_json(json!({ "key": encoded("T:captcha-1") })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": "1" })))
            .expect(1)
            .mount(&server)
            .await;
        // TTL 0 never grants a lease
        Mock::given(method("POST"))
            .and(path(LEASE_GRANT_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let cache = EtcdCache::connect(&etcd_config(vec![server.address().to_string()], 0))
            .await
            .unwrap();

        assert_ok!(cache.set("captcha-1", "answer", None).await);
        assert_eq!(cache.get("captcha-1").await.unwrap().as_deref(), Some("answer"));
        assert_eq!(cache.get("missing").await.unwrap(), None);
        assert_ok!(cache.delete("captcha-1").await);
        assert_eq!(cache.evict_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_with_ttl_attaches_lease() {
        let server = etcd_server().await;

        Mock::given(method("POST"))
            .and(path(LEASE_GRANT_PATH))
            .and(body_partial_json(json!({ "TTL": 30 })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "ID": "7587862070224434954", "TTL": "30" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(PUT_PATH))
            .and(body_partial_json(json!({
                "key": encoded("T:k"),
                "value": encoded("v"),
                "lease": "7587862070224434954"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
            .expect(1)
            .mount(&server)
            .await;

        let cache = EtcdCache::connect(&etcd_config(vec![server.address().to_string()], 30))
            .await
            .unwrap();

        assert_ok!(cache.set("k", "v", None).await);
    }

    #[tokio::test]
    async fn test_rejected_token_triggers_reauthentication() {
        let server = etcd_server().await;

        Mock::given(method("POST"))
            .and(path(AUTH_PATH))
            .and(body_partial_json(json!({ "name": "captcha", "password": "hunter2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "stale" })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(AUTH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "fresh" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RANGE_PATH))
            .and(header("authorization", "fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kvs": [{ "value": encoded("v") }]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(RANGE_PATH))
            .and(header("authorization", "stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let config = ResolvedConfig {
            cache_username: Some("captcha".to_string()),
            cache_password: Some(SecretString::new("hunter2".into())),
            ..etcd_config(vec![server.address().to_string()], 0)
        };
        let cache = EtcdCache::connect(&config).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.token.read().await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_falls_through() {
        let server = etcd_server().await;

        Mock::given(method("POST"))
            .and(path(RANGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kvs": [{ "value": encoded("v") }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let addrs = vec!["127.0.0.1:1".to_string(), server.address().to_string()];
        let cache = EtcdCache::connect(&etcd_config(addrs, 0)).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_server_error_surfaces_as_backend_error() {
        let server = etcd_server().await;

        Mock::given(method("POST"))
            .and(path(PUT_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("etcdserver: too many requests"))
            .mount(&server)
            .await;

        let cache = EtcdCache::connect(&etcd_config(vec![server.address().to_string()], 0))
            .await
            .unwrap();

        let err = cache.set("k", "v", None).await.unwrap_err();
        assert!(matches!(err, CacheError::Backend(ref m) if m.contains("503")));
    }
}
