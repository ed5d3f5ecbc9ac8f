//! HTTP client for a node's admin and eval channels.

use std::time::Duration;

use meshcheck_protocol::{AdminRequest, EvalRequest, Reply, ADMIN_PATH, EVAL_PATH};
use serde_json::Value;

use crate::error::{HarnessError, Result};

/// One node's admin endpoint. Cheap to clone.
#[derive(Clone)]
pub struct AdminClient {
    node: String,
    base_url: String,
    bearer_token: Option<String>,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(
        node: &str,
        base_url: &str,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarnessError::deployment(node, format!("http client: {e}")))?;
        Ok(Self {
            node: node.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run an admin command and return its result value.
    pub async fn execute(&self, command: &str) -> Result<Value> {
        let body = AdminRequest {
            command: command.to_string(),
        };
        self.post(ADMIN_PATH, &body, command).await
    }

    /// Evaluate an expression with arguments on the node.
    pub async fn eval(&self, expr: &str, args: Vec<Value>) -> Result<Value> {
        let body = EvalRequest {
            expr: expr.to_string(),
            args,
        };
        self.post(EVAL_PATH, &body, expr).await
    }

    async fn post<B: serde::Serialize>(&self, path: &str, body: &B, label: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.post(&url).json(body);
        if let Some(token) = &self.bearer_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| HarnessError::command(&self.node, label, e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| HarnessError::command(&self.node, label, e))?;

        if !status.is_success() {
            return Err(HarnessError::command(
                &self.node,
                label,
                format!("HTTP {status}: {text}"),
            ));
        }

        let reply: Reply = serde_json::from_str(&text).map_err(|e| {
            HarnessError::command(&self.node, label, format!("malformed reply: {e}"))
        })?;
        let value = reply
            .into_result()
            .map_err(|e| HarnessError::command(&self.node, label, e))?;
        tracing::trace!(node = self.node.as_str(), command = label, "command ok");
        Ok(value)
    }
}
