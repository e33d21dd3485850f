pub mod routes;

use serde::{Deserialize, Serialize};

use crate::flags::{FeatureFlag, FlagFilter, FlagType, Page};

// DTOs

#[derive(Debug, Deserialize)]
pub struct ListFlagsQuery {
    #[serde(rename = "type")]
    pub flag_type: Option<String>,
    pub enabled: Option<bool>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ListFlagsQuery {
    pub fn filter(&self) -> Result<FlagFilter, String> {
        let flag_type = match self.flag_type.as_deref() {
            Some(raw) => Some(raw.parse::<FlagType>()?),
            None => None,
        };
        Ok(FlagFilter {
            flag_type,
            enabled: self.enabled,
            search: self.search.clone(),
        })
    }

    pub fn page(&self) -> Page {
        Page::new(self.page, self.limit)
    }
}

#[derive(Debug, Serialize)]
pub struct FlagListResponse {
    pub flags: Vec<FeatureFlag>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<u32>,
}

impl AuditQuery {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;

    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}
