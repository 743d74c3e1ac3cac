use crate::backend::{BackendBuildError, Consistency, RetryPolicy};
use crate::store::{BoxError, Entry, InsertStatement, QueryValue, StoreBackend};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for [`ClickHouseBackend`].
///
/// The backend talks to ClickHouse over HTTP using the `JSONEachRow`
/// format. `database` plays the keyspace role; the target table comes from
/// each entry's [`InsertStatement`].
#[derive(Clone, Debug)]
pub struct ClickHouseConfig {
    /// Base URL without query, e.g. "http://127.0.0.1:8123"
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub consistency: Consistency,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".to_string(),
            database: "default".to_string(),
            user: None,
            password: None,
            consistency: Consistency::default(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// ClickHouse implementation of [`StoreBackend`] using the HTTP interface.
///
/// A batch is written as one `INSERT ... FORMAT JSONEachRow` request per
/// run of consecutive entries targeting the same table, so the usual
/// single-statement batch from the persister is one insert.
///
/// Mixed-table batches are not atomic. Runs are sent in order and the first
/// run that fails after all retries aborts the batch; runs already sent stay
/// written. A request that times out after the server applied it is retried
/// and its rows are inserted twice, since no insert deduplication token is
/// sent.
#[derive(Clone)]
pub struct ClickHouseBackend {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseBackend {
    /// Build the HTTP client for `config`.
    ///
    /// **Returns**
    /// - `Err(BackendBuildError::Client)` if the client could not be
    ///   constructed (e.g. TLS initialisation failure).
    pub fn connect(config: ClickHouseConfig) -> Result<Self, BackendBuildError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendBuildError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    fn auth_params(&self, query: &mut String) {
        if let Some(user) = &self.config.user {
            query.push_str(&format!("&user={}", urlencoding::encode(user)));
        }
        if let Some(password) = &self.config.password {
            query.push_str(&format!("&password={}", urlencoding::encode(password)));
        }
    }

    fn endpoint(&self, table: &str) -> String {
        let mut query = format!(
            "database={}&query={}",
            urlencoding::encode(&self.config.database),
            urlencoding::encode(&format!("INSERT INTO {} FORMAT JSONEachRow", table))
        );
        if let Some(quorum) = self.config.consistency.insert_quorum() {
            query.push_str(&format!("&insert_quorum={}", quorum));
        }
        self.auth_params(&mut query);

        format!("{}/?{}", self.config.url.trim_end_matches('/'), query)
    }

    /// Check that `statement.table` exists and exposes every column the
    /// statement writes. This is optional and is not called automatically.
    pub async fn validate_schema(&self, statement: &InsertStatement) -> Result<(), BoxError> {
        let mut query = format!(
            "query={}",
            urlencoding::encode(&format!(
                "DESCRIBE TABLE {}.{} FORMAT JSON",
                self.config.database, statement.table
            ))
        );
        self.auth_params(&mut query);

        let url = format!("{}/?{}", self.config.url.trim_end_matches('/'), query);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(format!("ClickHouse schema validation failed with status {}", resp.status()).into());
        }

        let described: Value = resp.json().await?;
        let present: Vec<&str> = described["data"]
            .as_array()
            .map(|rows| rows.iter().filter_map(|row| row["name"].as_str()).collect())
            .unwrap_or_default();
        let missing: Vec<&str> = statement
            .columns
            .iter()
            .map(String::as_str)
            .filter(|column| !present.contains(column))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("table {} is missing columns: {}", statement.table, missing.join(", ")).into())
        }
    }

    async fn post(&self, url: &str, body: String) -> Result<(), BoxError> {
        let resp = self.client.post(url).body(body).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(format!("ClickHouse insert failed with status {}: {}", status, text).into())
        }
    }

    async fn post_with_retry(&self, url: &str, body: String) -> Result<(), BoxError> {
        let mut attempt = 0;
        loop {
            match self.post(url, body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < self.config.retry.attempts => {
                    let delay = self.config.retry.backoff(attempt);
                    warn!(attempt, error = %e, ?delay, "clickhouse insert failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn json_value(value: &QueryValue) -> Value {
    match value {
        QueryValue::Timestamp(ts) => Value::String(ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        QueryValue::Text(s) => Value::String(s.clone()),
        QueryValue::Int(v) => Value::from(*v),
        QueryValue::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
    }
}

fn map_entry(entry: &Entry) -> Value {
    let row: Map<String, Value> = entry
        .statement
        .columns
        .iter()
        .zip(entry.values.iter())
        .map(|(column, value)| (column.clone(), json_value(value)))
        .collect();
    Value::Object(row)
}

/// Group consecutive entries by target table, keeping insertion order.
fn runs_by_table(entries: &[Entry]) -> Vec<(&str, &[Entry])> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=entries.len() {
        if i == entries.len() || entries[i].statement.table != entries[start].statement.table {
            runs.push((entries[start].statement.table.as_str(), &entries[start..i]));
            start = i;
        }
    }
    runs
}

/// Encode each table run as JSONEachRow and hand it to `send`, in order,
/// stopping at the first run that fails.
async fn send_runs<'a, F, Fut>(entries: &'a [Entry], mut send: F) -> Result<(), BoxError>
where
    F: FnMut(&'a str, String) -> Fut,
    Fut: Future<Output = Result<(), BoxError>>,
{
    for (table, run) in runs_by_table(entries) {
        let mut body = String::new();
        for entry in run {
            body.push_str(&serde_json::to_string(&map_entry(entry))?);
            body.push('\n');
        }
        send(table, body).await?;
    }
    Ok(())
}

#[async_trait]
impl StoreBackend for ClickHouseBackend {
    async fn execute_batch(&self, entries: &[Entry]) -> Result<(), BoxError> {
        send_runs(entries, |table, body| async move {
            self.post_with_retry(&self.endpoint(table), body).await
        })
        .await
    }
}
