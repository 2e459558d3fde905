//! Kitty box catalog service client.
//!
//! The catalog is the source of truth for which boxes exist, their prices,
//! and their global reservation status. The registry mirrors it into the
//! local store at startup.

use super::ReservationStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const CATALOG_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("catalog returned status {status}")]
    Status { status: u16 },
}

/// One box as listed by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub kitty_id: String,
    pub status: ReservationStatus,
    pub price_btc: i64,
    pub price_sky: i64,
}

/// One page of catalog entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPage {
    pub total_count: u64,
    pub entries: Vec<CatalogEntry>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Enumerate boxes, `page_size` at a time.
    async fn entries(&self, offset: u64, page_size: u64) -> Result<CatalogPage, CatalogError>;

    /// Report a box's reservation status back to the catalog.
    async fn set_reservation(
        &self,
        kitty_id: &str,
        status: ReservationStatus,
    ) -> Result<(), CatalogError>;
}

/// HTTP client for the kitty API catalog service.
pub struct KittyApiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SetReservationRequest<'a> {
    kitty_id: &'a str,
    status: ReservationStatus,
}

impl KittyApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(CATALOG_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Catalog for KittyApiClient {
    async fn entries(&self, offset: u64, page_size: u64) -> Result<CatalogPage, CatalogError> {
        let url = format!("{}/api/entries", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("offset", offset.to_string()), ("count", page_size.to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CatalogError::Status {
                status: response.status().as_u16(),
            });
        }

        Ok(response.json().await?)
    }

    async fn set_reservation(
        &self,
        kitty_id: &str,
        status: ReservationStatus,
    ) -> Result<(), CatalogError> {
        let url = format!("{}/api/reservation", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&SetReservationRequest { kitty_id, status })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CatalogError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// In-memory catalog for dummy mode and tests.
pub struct MemoryCatalog {
    entries: Mutex<Vec<CatalogEntry>>,
}

impl MemoryCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn entries(&self, offset: u64, page_size: u64) -> Result<CatalogPage, CatalogError> {
        let entries = self.entries.lock().map(|e| e.clone()).unwrap_or_default();
        let total_count = entries.len() as u64;
        let page = entries
            .into_iter()
            .skip(offset as usize)
            .take(page_size as usize)
            .collect();
        Ok(CatalogPage {
            total_count,
            entries: page,
        })
    }

    async fn set_reservation(
        &self,
        kitty_id: &str,
        status: ReservationStatus,
    ) -> Result<(), CatalogError> {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.iter_mut().find(|e| e.kitty_id == kitty_id) {
                entry.status = status;
            }
        }
        Ok(())
    }
}
