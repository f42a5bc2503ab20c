//! HTTP adapter for a PostgREST-style hosted store.

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::types::{DateRange, DayRecord, StoreWindow};
use super::ScheduleStore;
use crate::coordinator::CancelToken;
use crate::error::{SyncError, SyncResult};

const PREVIEW_TABLE: &str = "schedule_preview";
const PREVIEW_COLUMNS: &str = "id,for_date,summary,details_json,is_approved";
const SCHEDULE_TABLE: &str = "schedule";
const SCHEDULE_COLUMNS: &str = "id,for_date,summary,details_json";

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// REST base URL, e.g. `https://project.supabase.co/rest/v1`
  pub url: String,
  /// Per HTTP request
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  8
}

/// Store client speaking PostgREST filters over HTTP.
#[derive(Clone)]
pub struct RestStore {
  client: reqwest::Client,
  base: Url,
  api_key: String,
  timeout: Duration,
}

impl RestStore {
  pub fn new(config: &StoreConfig, api_key: String) -> Result<Self> {
    let base = base_url(&config.url)?;
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
      timeout,
    })
  }

  fn table_url(&self, table: &str) -> SyncResult<Url> {
    table_url(&self.base, table)
  }

  fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
    request
      .header("apikey", &self.api_key)
      .bearer_auth(&self.api_key)
  }

  /// Workout rows of `table` for one client within the inclusive window.
  async fn select_rows(
    &self,
    table: &str,
    columns: &str,
    client_id: i64,
    range: DateRange,
  ) -> SyncResult<Vec<DayRecord>> {
    let url = self.table_url(table)?;
    debug!(table, client_id, range = %range, "querying store");

    let request = self
      .authorized(self.client.get(url))
      .query(&window_filter(client_id, range))
      .query(&[("select", columns), ("order", "for_date.asc")]);

    let response = request.send().await.map_err(|e| self.request_error(e))?;
    let response = check_status(response, table).await?;

    response
      .json::<Vec<DayRecord>>()
      .await
      .map_err(|e| self.request_error(e))
  }

  /// Mark every draft row of the window as approved.
  pub async fn approve_window(
    &self,
    client_id: i64,
    range: DateRange,
    cancel: &CancelToken,
  ) -> SyncResult<()> {
    let url = self.table_url(PREVIEW_TABLE)?;
    debug!(client_id, range = %range, "approving window");

    let request = self
      .authorized(self.client.patch(url))
      .query(&window_filter(client_id, range))
      .header("Prefer", "return=minimal")
      .json(&serde_json::json!({ "is_approved": true }));

    let response = cancel
      .guard(request.send())
      .await?
      .map_err(|e| self.request_error(e))?;
    check_status(response, PREVIEW_TABLE).await?;
    Ok(())
  }

  fn request_error(&self, err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
      SyncError::Timeout(self.timeout)
    } else if err.is_decode() {
      SyncError::Store(format!("unexpected response body: {}", err))
    } else {
      SyncError::Transport(err.to_string())
    }
  }
}

#[async_trait]
impl ScheduleStore for RestStore {
  async fn fetch_window(
    &self,
    client_id: i64,
    range: DateRange,
    cancel: &CancelToken,
  ) -> SyncResult<StoreWindow> {
    // Sequential on purpose: two parallel queries per window overloaded the store.
    let preview = cancel
      .guard(self.select_rows(PREVIEW_TABLE, PREVIEW_COLUMNS, client_id, range))
      .await??;
    let schedule = cancel
      .guard(self.select_rows(SCHEDULE_TABLE, SCHEDULE_COLUMNS, client_id, range))
      .await??;

    Ok(StoreWindow::from_rows(preview, schedule, range.days()))
  }
}

fn base_url(raw: &str) -> Result<Url> {
  let mut base = Url::parse(raw).map_err(|e| eyre!("Invalid store url '{}': {}", raw, e))?;
  if base.cannot_be_a_base() {
    return Err(eyre!("Store url '{}' cannot be used as a base", raw));
  }
  // Url::join replaces the last segment unless the path ends with '/'.
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  Ok(base)
}

fn table_url(base: &Url, table: &str) -> SyncResult<Url> {
  base
    .join(table)
    .map_err(|e| SyncError::Validation(format!("bad table path {}: {}", table, e)))
}

fn window_filter(client_id: i64, range: DateRange) -> Vec<(&'static str, String)> {
  vec![
    ("client_id", format!("eq.{}", client_id)),
    ("type", "eq.workout".to_string()),
    ("for_date", format!("gte.{}", range.start.format("%Y-%m-%d"))),
    ("for_date", format!("lte.{}", range.end.format("%Y-%m-%d"))),
  ]
}

async fn check_status(response: Response, table: &str) -> SyncResult<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(status_error(status, table, &body))
}

fn status_error(status: StatusCode, table: &str, body: &str) -> SyncError {
  let detail = format!("{} on {}: {}", status, table, body.trim());
  match status {
    StatusCode::NOT_FOUND => SyncError::NotFound(detail),
    StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::Transport(detail),
    s if s.is_server_error() => SyncError::Transport(detail),
    _ => SyncError::Store(detail),
  }
}
