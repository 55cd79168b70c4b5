//! Core domain model for FIRA: reports, locations, and the administrative
//! hierarchy they are reconciled against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CRATE_NAME: &str = "fira-core";

/// Depth of the administrative hierarchy: governorate → district →
/// cadastral area. Chain walks stop exactly here.
pub const ADMIN_CHAIN_DEPTH: usize = 3;

/// One administrative hierarchy level as declared by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminLevel {
    pub id: i64,
    pub name: String,
}

/// A node in the administrative hierarchy. Root entities carry no parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminEntity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    pub level_id: i64,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

/// One denormalized chain entry. Chains are ordered root-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCrumb {
    pub level_id: i64,
    pub entity_id: i64,
    pub code: String,
    pub name: String,
}

impl AdminCrumb {
    /// Falls back to the stringified entity id when the entity carries no
    /// external code.
    pub fn from_entity(entity: &AdminEntity) -> Self {
        Self {
            level_id: entity.level_id,
            entity_id: entity.id,
            code: entity
                .code
                .clone()
                .unwrap_or_else(|| entity.id.to_string()),
            name: entity.name.clone(),
        }
    }
}

/// A physical site in the location registry.
///
/// `id` and `code` are immutable once assigned; every other field is
/// overwritten in full on each sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    #[serde(default)]
    pub code: Option<String>,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub admin_chain: Vec<AdminCrumb>,
}

/// Composite identity key for a report. Re-running an import with the same
/// key updates the existing document in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportKey {
    pub db_name: String,
    pub period: String,
    pub site_id: i64,
    pub activity_id: i64,
    pub partner_id: i64,
    pub indicator_id: i64,
}

impl ReportKey {
    /// Canonical JSON encoding used for store addressing. Struct field
    /// order is fixed, so the encoding is stable and injective.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).expect("report key encoding is infallible")
    }
}

/// (name, value) pair embedded in a report at creation time only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// A categorical tag inside an attribute group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeTag {
    pub id: i64,
    pub name: String,
}

/// Named set of categorical tags sites can declare membership in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeGroup {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub attributes: Vec<AttributeTag>,
}

/// One indicator observation for one site in one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub db_name: String,
    pub period: String,
    pub site_id: i64,
    pub activity_id: i64,
    pub partner_id: i64,
    pub indicator_id: i64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub activity_name: Option<String>,
    #[serde(default)]
    pub partner_name: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub location_code: Option<String>,
    #[serde(default)]
    pub location_x: Option<f64>,
    #[serde(default)]
    pub location_y: Option<f64>,
    #[serde(default)]
    pub indicator_name: Option<String>,
    #[serde(default)]
    pub indicator_category: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub admin_chain: Vec<AdminCrumb>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    /// Starts an empty report for an identity key; the reconciler fills
    /// the mutable fields afterwards.
    pub fn new(key: ReportKey, now: DateTime<Utc>) -> Self {
        Self {
            db_name: key.db_name,
            period: key.period,
            site_id: key.site_id,
            activity_id: key.activity_id,
            partner_id: key.partner_id,
            indicator_id: key.indicator_id,
            category: None,
            activity_name: None,
            partner_name: None,
            location_id: None,
            location_name: None,
            location_code: None,
            location_x: None,
            location_y: None,
            indicator_name: None,
            indicator_category: None,
            units: None,
            value: None,
            comments: None,
            admin_chain: Vec::new(),
            attributes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ReportKey {
        ReportKey {
            db_name: self.db_name.clone(),
            period: self.period.clone(),
            site_id: self.site_id,
            activity_id: self.activity_id,
            partner_id: self.partner_id,
            indicator_id: self.indicator_id,
        }
    }
}

/// One indicator row inside a site's monthly reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorRow {
    pub indicator_id: i64,
    pub indicator_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
}

/// Monthly reports keyed by period string (e.g. "2015-03").
pub type PeriodReports = BTreeMap<String, Vec<IndicatorRow>>;

/// Partner block embedded in a site payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerRef {
    pub id: i64,
    pub name: String,
}

/// Location block embedded in a site payload. This is the report source's
/// own view of the site; the registry `Location` is resolved separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteLocation {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// Report-bearing unit: one partner working one location under an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub partner: PartnerRef,
    pub location: SiteLocation,
    #[serde(default)]
    pub attributes: Vec<i64>,
    #[serde(default)]
    pub comments: Option<String>,
}

/// One activity of a source database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub attribute_groups: Vec<AttributeGroup>,
}

/// Source database payload as handed over by the remote client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Database {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

/// Full-replace persisted copy of one source database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub id: String,
    pub fetched_at: DateTime<Utc>,
    pub database: Database,
}
