use serde::{Deserialize, Serialize};

use crate::file::ArchivedFile;

// catalog listing, served as plain json for whatever front end sits on top
//
// pagination is clamped server-side; see CATALOG_MAX_PER_PAGE
pub const CATALOG_MAX_PER_PAGE: u64 = 100;
pub const CATALOG_DEFAULT_PER_PAGE: u64 = 20;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub stream_url: String,
    #[serde(flatten)]
    pub file: ArchivedFile,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogResp {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub files: Vec<CatalogEntry>,
}
