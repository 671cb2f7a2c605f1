use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ttl_secs, KvStore, StoreError, INDEX_ADD_SCRIPT};

const SCAN_BATCH: &str = "500";

/// Managed Redis-compatible store spoken to over HTTPS.
///
/// Each command is POSTed as a JSON array (`["SET", "k", "v"]`) with a bearer
/// token; the reply is `{"result": ...}` or `{"error": "..."}`.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RestReply {
    result: Option<Value>,
    error: Option<String>,
}

impl RestStore {
    pub fn new(url: String, token: String) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn command(&self, args: &[&str]) -> Result<Value, StoreError> {
        debug!(command = args.first().copied().unwrap_or_default(), "REST store call");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let reply: RestReply = serde_json::from_str(&body).map_err(|_| {
            StoreError::Response(format!("unexpected reply (status {status}): {body}"))
        })?;

        if let Some(error) = reply.error {
            return Err(StoreError::Response(error));
        }
        if !status.is_success() {
            return Err(StoreError::Response(format!("status {status}")));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }
}

fn as_integer(key: &str, value: &Value) -> Result<i64, StoreError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| StoreError::NotAnInteger(key.to_string())),
        Value::String(s) => s
            .parse()
            .map_err(|_| StoreError::NotAnInteger(key.to_string())),
        _ => Err(StoreError::NotAnInteger(key.to_string())),
    }
}

fn as_string_list(value: Value) -> Result<Vec<String>, StoreError> {
    match value {
        Value::Null => Ok(Vec::new()),
        other => Ok(serde_json::from_value(other)?),
    }
}

/// `SCAN` replies with `[cursor, [keys...]]`; the cursor may arrive as a string or a number.
fn parse_scan_reply(value: Value) -> Result<(String, Vec<String>), StoreError> {
    let mut parts = match value {
        Value::Array(parts) => parts,
        other => return Err(StoreError::Response(format!("unexpected SCAN reply: {other}"))),
    };
    if parts.len() != 2 {
        return Err(StoreError::Response("SCAN reply must have two parts".to_string()));
    }
    let keys = as_string_list(parts.pop().unwrap_or(Value::Null))?;
    let cursor = match parts.pop() {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        other => {
            return Err(StoreError::Response(format!("unexpected SCAN cursor: {other:?}")));
        }
    };
    Ok((cursor, keys))
}

#[async_trait]
impl KvStore for RestStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        match ttl {
            Some(ttl) => {
                let secs = ttl_secs(ttl).to_string();
                self.command(&["SET", key, value, "EX", &secs]).await?;
            }
            None => {
                self.command(&["SET", key, value]).await?;
            }
        }
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let value = self.command(&["INCR", key]).await?;
        as_integer(key, &value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let secs = ttl_secs(ttl).to_string();
        let value = self.command(&["EXPIRE", key, &secs]).await?;
        Ok(as_integer(key, &value)? == 1)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let value = self.command(&["DEL", key]).await?;
        Ok(as_integer(key, &value)? > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();
        loop {
            let reply = self
                .command(&["SCAN", &cursor, "MATCH", pattern, "COUNT", SCAN_BATCH])
                .await?;
            let (next, batch) = parse_scan_reply(reply)?;
            keys.extend(batch);
            if next == "0" {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn index_add(
        &self,
        key: &str,
        member: &str,
        deadline_ms: i64,
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let deadline = deadline_ms.to_string();
        let now = now_ms.to_string();
        self.command(&["EVAL", INDEX_ADD_SCRIPT, "1", key, member, &deadline, &now])
            .await?;
        Ok(())
    }

    async fn index_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        as_string_list(self.command(&["ZRANGE", key, "0", "-1"]).await?)
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.command(&["ZREM", key, member]).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "rest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_integer_accepts_numbers_and_numeric_strings() {
        assert_eq!(as_integer("k", &json!(3)).unwrap(), 3);
        assert_eq!(as_integer("k", &json!("7")).unwrap(), 7);
        assert!(as_integer("k", &json!("x")).is_err());
        assert!(as_integer("k", &Value::Null).is_err());
    }

    #[test]
    fn test_as_string_list_treats_null_as_empty() {
        assert!(as_string_list(Value::Null).unwrap().is_empty());
        assert_eq!(
            as_string_list(json!(["a", "b"])).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_reply_parses_error_shape() {
        let reply: RestReply = serde_json::from_str(r#"{"error":"WRONGTYPE"}"#).unwrap();
        assert_eq!(reply.error.as_deref(), Some("WRONGTYPE"));
        assert!(reply.result.is_none());
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let store = RestStore::new("https://kv.example.com/".into(), "t".into()).unwrap();
        assert_eq!(store.url, "https://kv.example.com");
    }

    #[test]
    fn test_scan_reply_accepts_string_and_numeric_cursors() {
        let (cursor, keys) = parse_scan_reply(json!(["17", ["session:a", "session:b"]])).unwrap();
        assert_eq!(cursor, "17");
        assert_eq!(keys, vec!["session:a", "session:b"]);

        let (cursor, keys) = parse_scan_reply(json!([0, []])).unwrap();
        assert_eq!(cursor, "0");
        assert!(keys.is_empty());
    }

    #[test]
    fn test_scan_reply_rejects_other_shapes() {
        assert!(parse_scan_reply(json!("OK")).is_err());
        assert!(parse_scan_reply(json!(["0"])).is_err());
    }
}
