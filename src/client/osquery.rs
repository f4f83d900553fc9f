//! Inventory queries through the osquery shell

use super::{QueryClient, QueryResponse, QueryStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Runs each query as `osqueryi --json <sql>`
pub struct OsqueryiClient {
    binary: PathBuf,
}

impl OsqueryiClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl QueryClient for OsqueryiClient {
    async fn query(&self, sql: &str) -> Result<QueryResponse> {
        debug!("osquery: {}", sql);

        let output = Command::new(&self.binary)
            .arg("--json")
            .arg(sql)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("launching {}", self.binary.display()))?;

        if !output.status.success() {
            return Ok(QueryResponse {
                status: QueryStatus {
                    code: output.status.code().unwrap_or(-1),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                },
                rows: Vec::new(),
            });
        }

        Ok(QueryResponse {
            status: QueryStatus::default(),
            rows: parse_rows(&output.stdout)?,
        })
    }
}

/// osqueryi prints rows as a JSON array of objects; not every version
/// stringifies numeric columns
fn parse_rows(stdout: &[u8]) -> Result<Vec<HashMap<String, String>>> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let rows: Vec<HashMap<String, serde_json::Value>> =
        serde_json::from_slice(stdout).context("parsing osquery output")?;

    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(column, value)| {
                    let value = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (column, value)
                })
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rows() {
        let rows = parse_rows(br#"[{"name": "Safari", "version": "17.1"}, {"pid": 42}]"#)
            .expect("parse failed");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Safari");
        assert_eq!(rows[1]["pid"], "42");
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_rows(b"  \n").expect("parse failed").is_empty());
        assert!(parse_rows(b"[]").expect("parse failed").is_empty());
        assert!(parse_rows(b"not json").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_query_status_from_exit_code() {
        // `false` ignores its arguments and exits 1
        let client = OsqueryiClient::new("false");
        let response = client.query("SELECT * FROM nope").await.expect("query");
        assert_eq!(response.status.code, 1);
        assert!(response.rows.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let client = OsqueryiClient::new("/nonexistent/osqueryi");
        assert!(client.query("SELECT 1").await.is_err());
    }
}
