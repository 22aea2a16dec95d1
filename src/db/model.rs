//! Row models returned by repository queries.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::warn;

use crate::model::{LocationRecord, LocationSummary, PlaceData};

/// Full `locations` row.
#[derive(Debug, Clone, FromRow)]
pub struct LocationRow {
    pub id: String,
    pub name: String,
    pub place_data: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub place_data_updated_at: Option<DateTime<Utc>>,
}

impl LocationRow {
    pub fn into_record(self) -> Result<LocationRecord, serde_json::Error> {
        let place_data = serde_json::from_str(&self.place_data)?;
        Ok(LocationRecord {
            id: self.id,
            name: self.name,
            place_data,
            updated_at: self.updated_at,
            place_data_updated_at: self.place_data_updated_at,
        })
    }
}

/// Slice used by catalog scans.
#[derive(Debug, Clone, FromRow)]
pub struct LocationScanRow {
    pub id: String,
    pub name: String,
    pub place_data: String,
}

impl LocationScanRow {
    /// A malformed document degrades to empty place data so one bad row
    /// cannot abort a whole-catalog scan.
    pub fn into_summary(self) -> LocationSummary {
        let place_data = match serde_json::from_str::<PlaceData>(&self.place_data) {
            Ok(data) => data,
            Err(err) => {
                warn!(id = %self.id, ?err, "unreadable placeData; treating as empty");
                PlaceData::default()
            }
        };
        LocationSummary {
            id: self.id,
            name: self.name,
            place_data,
        }
    }
}
