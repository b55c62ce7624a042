/// api.rs – REST snapshot client for the dashboard's initial state.
///
/// Push updates only carry changes, so on startup the account overview,
/// open positions and most recent trades are fetched once over HTTP.
use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::models::{PortfolioSnapshot, PositionSnapshot, TradeEvent};

#[derive(Clone)]
pub struct ApiClient {
    pub base_url: String,
    api_token: Option<String>,
    http: Client,
}

/// Some endpoints wrap their payload as `{"data": ...}`. When a `data` key is
/// present it is the payload; its decode error is reported rather than
/// falling back to reading the whole body.
fn unwrap_envelope<T: DeserializeOwned>(body: Value) -> Result<T> {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            let data = map.remove("data").unwrap_or(Value::Null);
            serde_json::from_value(data).context("decoding `data` payload")
        }
        other => serde_json::from_value(other).context("decoding payload"),
    }
}

/// Positions fill in an account that did not embed them; a failed positions
/// fetch keeps the account as it is.
fn merge_positions(
    mut account: PortfolioSnapshot,
    positions: Result<Vec<PositionSnapshot>>,
) -> PortfolioSnapshot {
    match positions {
        Ok(positions) => account.positions = positions,
        Err(e) => warn!("Positions fetch failed, keeping account snapshot: {e:#}"),
    }
    account
}

impl ApiClient {
    /// `None` when no REST base URL is configured.
    pub fn from_config(cfg: &ApiConfig, api_token: Option<String>) -> Result<Option<Self>> {
        let Some(base) = cfg.base_url.as_deref() else {
            return Ok(None);
        };
        let http = Client::builder()
            .timeout(cfg.timeout())
            .build()
            .context("building HTTP client")?;
        Ok(Some(Self {
            base_url: base.trim_end_matches('/').to_string(),
            api_token,
            http,
        }))
    }

    pub async fn fetch_account(&self) -> Result<PortfolioSnapshot> {
        self.get_json("account", &[]).await
    }

    pub async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>> {
        self.get_json("positions", &[]).await
    }

    pub async fn fetch_trades(&self, limit: usize) -> Result<Vec<TradeEvent>> {
        self.get_json("trades", &[("limit", limit.to_string())]).await
    }

    /// Account overview with positions filled in from `/positions` when the
    /// account payload does not embed them.
    pub async fn fetch_portfolio(&self) -> Result<PortfolioSnapshot> {
        let mut account = self.fetch_account().await?;
        if account.positions.is_empty() {
            account = merge_positions(account, self.fetch_positions().await);
        }
        info!(
            "Loaded account snapshot: equity {:.2}, {} position(s)",
            account.equity,
            account.positions.len()
        );
        Ok(account)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);
        debug!("GET {url}");
        let mut req = self.http.get(&url).query(query);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.with_context(|| format!("requesting {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("GET {url} returned {status}");
        }
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("parsing response from {url}"))?;
        unwrap_envelope(body).with_context(|| format!("unexpected response shape from {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_base_url_means_no_client() {
        let cfg = ApiConfig::default();
        assert!(ApiClient::from_config(&cfg, None).unwrap().is_none());
    }

    #[test]
    fn url_joins_without_double_slash() {
        let cfg = ApiConfig {
            base_url: Some("http://localhost:3001/api/".into()),
            ..ApiConfig::default()
        };
        let client = ApiClient::from_config(&cfg, None).unwrap().unwrap();
        assert_eq!(client.url("/account"), "http://localhost:3001/api/account");
    }

    #[test]
    fn envelope_accepts_wrapped_and_bare_payloads() {
        let wrapped: Vec<TradeEvent> =
            unwrap_envelope(serde_json::json!({"data": [{"id": "t1", "symbol": "AAPL"}]})).unwrap();
        assert_eq!(wrapped[0].id, "t1");

        let snap: PortfolioSnapshot =
            unwrap_envelope(serde_json::json!({"equity": 1250.5, "dayPnl": -3.0})).unwrap();
        assert_eq!(snap.equity, 1250.5);
        assert_eq!(snap.day_pnl, -3.0);
    }

    #[test]
    fn mistyped_data_is_an_error_not_an_empty_snapshot() {
        let res: Result<PortfolioSnapshot> =
            unwrap_envelope(serde_json::json!({"data": "maintenance"}));
        assert!(res.is_err());

        let res: Result<PortfolioSnapshot> =
            unwrap_envelope(serde_json::json!({"data": {"equity": "lots"}}));
        assert!(res.is_err());
    }

    #[test]
    fn failed_positions_fetch_keeps_account() {
        let account = PortfolioSnapshot {
            balance: 4_000.0,
            equity: 10_000.0,
            ..PortfolioSnapshot::default()
        };
        let merged = merge_positions(account.clone(), Err(anyhow::anyhow!("503")));
        assert_eq!(merged, account);

        let pos = PositionSnapshot {
            symbol: "SPY".into(),
            quantity: 2.0,
            ..PositionSnapshot::default()
        };
        let merged = merge_positions(account, Ok(vec![pos.clone()]));
        assert_eq!(merged.equity, 10_000.0);
        assert_eq!(merged.positions, vec![pos]);
    }
}
