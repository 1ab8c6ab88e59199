//! [`RestSource`]: the system of record read through a PostgREST-style
//! HTTP endpoint.

use std::{
  collections::{HashMap, HashSet},
  time::Duration,
};

use cachesync_core::{record::Record, source::SourceOfRecord};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
  #[error("request failed: {0}")]
  Http(#[from] reqwest::Error),
  #[error("GET {url} returned {status}")]
  Status { url: String, status: u16 },
  #[error("schema document at {0} has no `definitions` object")]
  NoDefinitions(String),
}

/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct RestSource {
  client:   Client,
  base_url: String,
}

impl RestSource {
  pub fn new(base_url: &str) -> Result<Self, SourceError> {
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_owned(),
    })
  }

  fn url(&self, path: &str) -> String { format!("{}/{}", self.base_url, path) }

  async fn get_json<T: DeserializeOwned>(
    &self,
    url: String,
    request: RequestBuilder,
  ) -> Result<T, SourceError> {
    let resp = request.send().await?;
    if !resp.status().is_success() {
      return Err(SourceError::Status {
        url,
        status: resp.status().as_u16(),
      });
    }
    Ok(resp.json().await?)
  }
}

impl SourceOfRecord for RestSource {
  type Error = SourceError;

  /// `GET {base}/{table}?{id_column}=eq.{id}`
  async fn fetch(
    &self,
    table: &str,
    id_column: &str,
    id: &str,
  ) -> Result<Option<Record>, SourceError> {
    let url = self.url(table);
    let request = self
      .client
      .get(&url)
      .query(&[(id_column, format!("eq.{id}"))]);
    let rows: Vec<Record> = self.get_json(url, request).await?;
    Ok(rows.into_iter().next())
  }

  /// `GET {base}/{table}`
  async fn fetch_table(&self, table: &str) -> Result<Vec<Record>, SourceError> {
    let url = self.url(table);
    let request = self.client.get(&url);
    self.get_json(url, request).await
  }

  /// Columns per table from the OpenAPI root document.
  async fn describe(&self) -> Result<HashMap<String, HashSet<String>>, SourceError> {
    let url = self.url("");
    let request = self.client.get(&url);
    let document: Value = self.get_json(url.clone(), request).await?;
    columns_from_openapi(&document).ok_or(SourceError::NoDefinitions(url))
  }
}

/// `definitions.{table}.properties` keys, per table.
fn columns_from_openapi(document: &Value) -> Option<HashMap<String, HashSet<String>>> {
  let definitions = document.get("definitions")?.as_object()?;
  Some(
    definitions
      .iter()
      .map(|(table, definition)| {
        let columns = definition
          .get("properties")
          .and_then(Value::as_object)
          .map(|properties| properties.keys().cloned().collect())
          .unwrap_or_default();
        (table.clone(), columns)
      })
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn reads_columns_from_definitions() {
    let document = json!({
      "swagger": "2.0",
      "definitions": {
        "inventory_item": { "properties": { "id": {}, "name": {} } },
        "inventory_item_lot": { "properties": { "id": {}, "item_id": {} } },
        "empty": {}
      }
    });
    let columns = columns_from_openapi(&document).unwrap();
    assert_eq!(columns.len(), 3);
    assert!(columns["inventory_item_lot"].contains("item_id"));
    assert!(columns["empty"].is_empty());
  }

  #[test]
  fn missing_definitions_is_none() {
    assert!(columns_from_openapi(&json!({ "paths": {} })).is_none());
  }

  #[test]
  fn base_url_is_normalized() {
    let source = RestSource::new("http://db.local/rest/").unwrap();
    assert_eq!(source.url("inventory_item"), "http://db.local/rest/inventory_item");
  }
}
