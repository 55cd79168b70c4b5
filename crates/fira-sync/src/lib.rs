//! Reconciliation pipelines: report import, site synchronization, and
//! admin-lookup refresh.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use fira_clients::{
    location_from_remote, ActivityApiConfig, ActivityClient, CreateLocation, GeoApiConfig,
    GeoTableClient, HttpActivityClient, HttpGeoTableClient, Notifier, NullNotifier, PushOutcome,
    WebhookNotifier,
};
use fira_core::{
    Activity, AdminCrumb, AdminEntity, Attribute, AttributeGroup, Database, DatabaseSnapshot,
    Location, Report, ReportKey, Site, ADMIN_CHAIN_DEPTH,
};
use fira_storage::{BasicAuth, HttpClient, HttpConfig, Store};

pub const CRATE_NAME: &str = "fira-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store_dir: PathBuf,
    pub database_ids: Vec<i64>,
    pub api_base_url: String,
    pub api_username: Option<String>,
    pub api_password: Option<String>,
    pub geo_api_key: String,
    pub geo_domain: String,
    pub geo_table: String,
    pub geo_code_column: String,
    pub geo_name_column: String,
    pub geo_cad_column: String,
    pub geo_lat_column: String,
    pub geo_lon_column: String,
    pub location_type_id: i64,
    pub site_kind: String,
    pub region: String,
    pub push_locations: bool,
    pub notify_webhook: Option<String>,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            store_dir: std::env::var("FIRA_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./store")),
            database_ids: std::env::var("FIRA_DATABASE_IDS")
                .map(|raw| parse_id_list(&raw))
                .unwrap_or_default(),
            api_base_url: std::env::var("FIRA_API_BASE_URL")
                .unwrap_or_else(|_| "https://www.activityinfo.org".to_string()),
            api_username: std::env::var("FIRA_API_USERNAME").ok(),
            api_password: std::env::var("FIRA_API_PASSWORD").ok(),
            geo_api_key: std::env::var("FIRA_GEO_API_KEY").unwrap_or_default(),
            geo_domain: std::env::var("FIRA_GEO_DOMAIN")
                .unwrap_or_else(|_| "example.cartodb.com".to_string()),
            geo_table: std::env::var("FIRA_GEO_TABLE")
                .unwrap_or_else(|_| "ai_localities".to_string()),
            geo_code_column: std::env::var("FIRA_GEO_CODE_COLUMN")
                .unwrap_or_else(|_| "pcode".to_string()),
            geo_name_column: std::env::var("FIRA_GEO_NAME_COLUMN")
                .unwrap_or_else(|_| "location_name_en".to_string()),
            geo_cad_column: std::env::var("FIRA_GEO_CAD_COLUMN")
                .unwrap_or_else(|_| "cad_code".to_string()),
            geo_lat_column: std::env::var("FIRA_GEO_LAT_COLUMN")
                .unwrap_or_else(|_| "latitude".to_string()),
            geo_lon_column: std::env::var("FIRA_GEO_LON_COLUMN")
                .unwrap_or_else(|_| "longitude".to_string()),
            location_type_id: std::env::var("FIRA_LOCATION_TYPE_ID")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(51048),
            site_kind: std::env::var("FIRA_SITE_KIND").unwrap_or_else(|_| "LOC".to_string()),
            region: std::env::var("FIRA_REGION").unwrap_or_else(|_| "LB".to_string()),
            push_locations: std::env::var("FIRA_PUSH_LOCATIONS")
                .map(|raw| matches!(raw.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            notify_webhook: std::env::var("FIRA_NOTIFY_WEBHOOK").ok(),
            http_timeout_secs: std::env::var("FIRA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn site_sync_options(&self) -> SiteSyncOptions {
        SiteSyncOptions {
            table: self.geo_table.clone(),
            columns: GeoColumns {
                code: self.geo_code_column.clone(),
                name: self.geo_name_column.clone(),
                cadastral: self.geo_cad_column.clone(),
                latitude: self.geo_lat_column.clone(),
                longitude: self.geo_lon_column.clone(),
            },
            location_type_id: self.location_type_id,
            site_kind: self.site_kind.clone(),
            push_locations: self.push_locations,
        }
    }
}

/// Accepts whitespace- or comma-separated ids; anything unparsable is
/// dropped.
pub fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Source of synthetic location identifiers.
pub trait IdAllocator: Send + Sync {
    fn next_id(&self) -> i64;
}

/// Random positive 31-bit identifiers. Collisions over the registry's
/// scale are negligible, so there is no dedup scan.
#[derive(Debug, Default)]
pub struct RandomIdAllocator;

impl IdAllocator for RandomIdAllocator {
    fn next_id(&self) -> i64 {
        i64::from(rand::thread_rng().gen_range(1..=i32::MAX))
    }
}

/// Deterministic allocator for tests.
#[derive(Debug, Default)]
pub struct SequenceIdAllocator {
    next: AtomicI64,
}

impl SequenceIdAllocator {
    pub fn starting_at(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl IdAllocator for SequenceIdAllocator {
    fn next_id(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Shared handles for one pipeline run. Every pipeline takes the context,
/// so tests can swap in fixture clients and a null notifier.
pub struct RunContext {
    pub store: Store,
    pub activity: Arc<dyn ActivityClient>,
    pub geo: Arc<dyn GeoTableClient>,
    pub notifier: Arc<dyn Notifier>,
    pub ids: Arc<dyn IdAllocator>,
}

impl RunContext {
    pub fn new(
        store: Store,
        activity: Arc<dyn ActivityClient>,
        geo: Arc<dyn GeoTableClient>,
        notifier: Arc<dyn Notifier>,
        ids: Arc<dyn IdAllocator>,
    ) -> Self {
        Self {
            store,
            activity,
            geo,
            notifier,
            ids,
        }
    }

    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let store = Store::open(&config.store_dir)
            .await
            .with_context(|| format!("opening store at {}", config.store_dir.display()))?;
        let http = HttpClient::new(HttpConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
        })?;

        let auth = match (&config.api_username, &config.api_password) {
            (Some(username), Some(password)) => Some(BasicAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        let activity = Arc::new(HttpActivityClient::new(
            http.clone(),
            ActivityApiConfig {
                base_url: config.api_base_url.clone(),
                auth,
            },
        ));
        let geo = Arc::new(HttpGeoTableClient::new(
            http.clone(),
            GeoApiConfig {
                domain: config.geo_domain.clone(),
                api_key: config.geo_api_key.clone(),
            },
        ));
        let notifier: Arc<dyn Notifier> = match &config.notify_webhook {
            Some(url) => Arc::new(WebhookNotifier::new(http, url.clone())),
            None => Arc::new(NullNotifier),
        };

        Ok(Self::new(
            store,
            activity,
            geo,
            notifier,
            Arc::new(RandomIdAllocator),
        ))
    }

    /// A failed notification is logged and never fails the caller.
    pub async fn notify(&self, message: &str) {
        if let Err(err) = self.notifier.notify(message).await {
            warn!(error = %err, "notification delivery failed");
        }
    }
}

/// Read-only snapshot of locations and admin entities for one run. Runs
/// are serialized, so the snapshot cannot go stale mid-run.
#[derive(Debug, Default)]
pub struct LookupIndex {
    locations_by_id: HashMap<i64, Location>,
    location_ids_by_code: HashMap<String, i64>,
    entities_by_id: HashMap<i64, AdminEntity>,
    entity_ids_by_code: HashMap<String, i64>,
}

impl LookupIndex {
    pub async fn load(store: &Store) -> Result<Self> {
        let mut index = Self::default();
        for location in store.locations.all().await? {
            if let Some(code) = &location.code {
                index.location_ids_by_code.insert(code.clone(), location.id);
            }
            index.locations_by_id.insert(location.id, location);
        }
        for entity in store.admin_entities.all().await? {
            if let Some(code) = &entity.code {
                index.entity_ids_by_code.insert(code.clone(), entity.id);
            }
            index.entities_by_id.insert(entity.id, entity);
        }
        Ok(index)
    }

    pub fn location(&self, id: i64) -> Option<&Location> {
        self.locations_by_id.get(&id)
    }

    pub fn location_by_code(&self, code: &str) -> Option<&Location> {
        self.location_ids_by_code
            .get(code)
            .and_then(|id| self.locations_by_id.get(id))
    }

    pub fn entity(&self, id: i64) -> Option<&AdminEntity> {
        self.entities_by_id.get(&id)
    }

    pub fn entity_by_code(&self, code: &str) -> Option<&AdminEntity> {
        self.entity_ids_by_code
            .get(code)
            .and_then(|id| self.entities_by_id.get(id))
    }

    pub fn location_count(&self) -> usize {
        self.locations_by_id.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities_by_id.len()
    }
}

/// What the reconciler knows about a report's whereabouts.
#[derive(Debug, Clone, Default)]
pub struct LocationQuery {
    pub id: Option<i64>,
    pub code: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(Location),
    /// A code matched the reference pattern but no location carries it;
    /// the code is still worth keeping on the report.
    CodeOnly { code: String },
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainBreak {
    /// The location carries no admin reference to anchor a walk.
    NoAnchor,
    MissingEntity { entity_id: i64 },
    MissingParent { entity_id: i64 },
}

/// Result of an upward parent walk. Crumbs are root-first; `broken` holds
/// the reason the walk stopped short of the full depth, if it did.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainWalk {
    pub crumbs: Vec<AdminCrumb>,
    pub broken: Option<ChainBreak>,
}

impl ChainWalk {
    pub fn complete(&self) -> bool {
        self.broken.is_none()
    }
}

pub struct LocationResolver<'a> {
    index: &'a LookupIndex,
    code_pattern: Regex,
}

impl<'a> LocationResolver<'a> {
    pub fn new(index: &'a LookupIndex) -> Self {
        Self {
            index,
            code_pattern: Regex::new(r"\d{5}-\d?\d-\d{3}").expect("code pattern is valid"),
        }
    }

    /// Resolution order: identifier, then code, then code extracted from
    /// free text. Never errors for an unresolved reference.
    pub fn resolve(&self, query: &LocationQuery) -> Resolution {
        if let Some(id) = query.id {
            if let Some(location) = self.index.location(id) {
                return Resolution::Found(location.clone());
            }
        }
        if let Some(code) = query.code.as_deref() {
            if let Some(location) = self.index.location_by_code(code) {
                return Resolution::Found(location.clone());
            }
        }
        if let Some(text) = query.text.as_deref() {
            if let Some(code) = self.extract_code(text) {
                return match self.index.location_by_code(&code) {
                    Some(location) => Resolution::Found(location.clone()),
                    None => Resolution::CodeOnly { code },
                };
            }
        }
        Resolution::NotFound
    }

    /// First pattern match wins; no further disambiguation.
    pub fn extract_code(&self, text: &str) -> Option<String> {
        self.code_pattern
            .find(text)
            .map(|found| found.as_str().to_string())
    }

    /// Walks parent links upward from the location's deepest admin
    /// reference, exactly to the fixed depth.
    pub fn walk_chain(&self, location: &Location) -> ChainWalk {
        match location.admin_chain.last() {
            Some(anchor) => self.walk_chain_from(anchor.entity_id),
            None => ChainWalk {
                crumbs: Vec::new(),
                broken: Some(ChainBreak::NoAnchor),
            },
        }
    }

    /// Same walk, anchored at a known entity (site sync resolves the
    /// cadastral entity by code first).
    pub fn walk_chain_from(&self, entity_id: i64) -> ChainWalk {
        let mut crumbs: Vec<AdminCrumb> = Vec::new();
        let mut broken = None;
        let mut current_id = entity_id;

        for depth in 0..ADMIN_CHAIN_DEPTH {
            let Some(entity) = self.index.entity(current_id) else {
                broken = Some(ChainBreak::MissingEntity {
                    entity_id: current_id,
                });
                break;
            };
            crumbs.push(AdminCrumb::from_entity(entity));
            if depth + 1 == ADMIN_CHAIN_DEPTH {
                break;
            }
            match entity.parent_id {
                Some(parent_id) => current_id = parent_id,
                None => {
                    broken = Some(ChainBreak::MissingParent {
                        entity_id: entity.id,
                    });
                    break;
                }
            }
        }

        crumbs.reverse();
        ChainWalk { crumbs, broken }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub databases: usize,
    pub activities: usize,
    pub sites: usize,
    pub reports_created: usize,
    pub reports_refreshed: usize,
    pub unresolved_locations: usize,
    pub skipped_sites: usize,
    pub skipped_activities: usize,
}

/// Imports every configured source database: snapshot it, flatten its
/// attribute groups, then reconcile each site's monthly reports.
///
/// A database fetch failure aborts the whole run; activity and site
/// failures notify and continue.
pub async fn run_import(ctx: &RunContext, database_ids: &[i64]) -> Result<ImportSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let index = LookupIndex::load(&ctx.store).await?;
    let resolver = LocationResolver::new(&index);
    info!(
        %run_id,
        databases = database_ids.len(),
        known_locations = index.location_count(),
        known_entities = index.entity_count(),
        "starting report import"
    );

    let mut summary = ImportSummary {
        run_id,
        started_at,
        finished_at: started_at,
        databases: 0,
        activities: 0,
        sites: 0,
        reports_created: 0,
        reports_refreshed: 0,
        unresolved_locations: 0,
        skipped_sites: 0,
        skipped_activities: 0,
    };

    for &database_id in database_ids {
        let database = ctx
            .activity
            .get_database(database_id)
            .await
            .with_context(|| format!("fetching database {database_id}"))?;
        info!(database_id, name = %database.name, "pulling database");
        ctx.notify(&format!("import started for database: {}", database.name))
            .await;

        ctx.store
            .put_snapshot(&DatabaseSnapshot {
                id: database_id.to_string(),
                fetched_at: Utc::now(),
                database: database.clone(),
            })
            .await?;

        // Flatten group definitions across activities; duplicate ids are
        // last-write-wins.
        for activity in &database.activities {
            for group in &activity.attribute_groups {
                ctx.store.put_attribute_group(group).await?;
            }
        }
        let mut groups = ctx.store.attribute_groups.all().await?;
        groups.sort_by_key(|group| group.id);

        for activity in &database.activities {
            match import_activity(ctx, &resolver, &database, activity, &groups, &mut summary)
                .await
            {
                Ok(()) => {}
                Err(err) => {
                    warn!(activity_id = activity.id, error = %err, "activity import failed");
                    ctx.notify(&format!(
                        "import error for activity {}: {err:#}",
                        activity.name
                    ))
                    .await;
                    summary.skipped_activities += 1;
                }
            }
        }
        summary.databases += 1;
    }

    summary.finished_at = Utc::now();
    ctx.notify(&format!(
        "import finished, {} site reports created",
        summary.reports_created
    ))
    .await;
    info!(
        %run_id,
        created = summary.reports_created,
        refreshed = summary.reports_refreshed,
        unresolved = summary.unresolved_locations,
        "report import finished"
    );
    Ok(summary)
}

async fn import_activity(
    ctx: &RunContext,
    resolver: &LocationResolver<'_>,
    database: &Database,
    activity: &Activity,
    groups: &[AttributeGroup],
    summary: &mut ImportSummary,
) -> Result<()> {
    let sites = ctx
        .activity
        .get_sites(activity.id)
        .await
        .with_context(|| format!("fetching sites for activity {}", activity.id))?;
    info!(activity_id = activity.id, name = %activity.name, sites = sites.len(), "pulling sites");
    summary.activities += 1;

    for site in &sites {
        match import_site(ctx, resolver, database, activity, groups, site, summary).await {
            Ok(()) => summary.sites += 1,
            Err(err) => {
                warn!(site_id = site.id, error = %err, "site import failed");
                ctx.notify(&format!("import error, {err:#}")).await;
                summary.skipped_sites += 1;
            }
        }
    }
    Ok(())
}

async fn import_site(
    ctx: &RunContext,
    resolver: &LocationResolver<'_>,
    database: &Database,
    activity: &Activity,
    groups: &[AttributeGroup],
    site: &Site,
    summary: &mut ImportSummary,
) -> Result<()> {
    let candidates = candidate_attributes(groups, site);
    let reports = ctx
        .activity
        .get_monthly_reports_for_site(site.id)
        .await
        .with_context(|| format!("fetching monthly reports for site {}", site.id))?;

    for (period, rows) in &reports {
        for row in rows {
            let key = ReportKey {
                db_name: database.name.clone(),
                period: period.clone(),
                site_id: site.id,
                activity_id: activity.id,
                partner_id: site.partner.id,
                indicator_id: row.indicator_id,
            };
            let now = Utc::now();
            let (mut report, created) = match ctx.store.report(&key).await? {
                Some(existing) => (existing, false),
                None => (Report::new(key, now), true),
            };

            report.category = activity.category.clone();
            report.activity_name = Some(activity.name.clone());
            report.partner_name = Some(site.partner.name.clone());
            report.location_id = Some(site.location.id);
            report.location_name = Some(site.location.name.clone());
            report.location_x = site.location.longitude;
            report.location_y = site.location.latitude;
            report.indicator_name = Some(row.indicator_name.clone());
            report.indicator_category = row.category.clone();
            report.units = row.units.clone();
            report.value = row.value;
            report.comments = site.comments.clone();
            report.updated_at = now;

            let query = LocationQuery {
                id: Some(site.location.id),
                code: None,
                text: site.comments.clone(),
            };
            match resolver.resolve(&query) {
                Resolution::Found(location) => {
                    report.location_code = location.code.clone();
                    let walk = resolver.walk_chain(&location);
                    if walk.complete() {
                        report.admin_chain = walk.crumbs;
                    } else {
                        warn!(
                            site_id = site.id,
                            location_id = location.id,
                            reason = ?walk.broken,
                            "admin chain walk broke; report keeps its previous chain"
                        );
                    }
                }
                Resolution::CodeOnly { code } => {
                    report.location_code = Some(code);
                    summary.unresolved_locations += 1;
                }
                Resolution::NotFound => {
                    summary.unresolved_locations += 1;
                }
            }

            if created {
                for (group_name, tag_name) in &candidates {
                    report.attributes.push(Attribute {
                        name: group_name.clone(),
                        value: tag_name.clone(),
                    });
                }
            }

            ctx.store.put_report(&report).await?;
            if created {
                summary.reports_created += 1;
            } else {
                summary.reports_refreshed += 1;
            }
        }
    }
    Ok(())
}

/// (group name, tag name) pairs stamped on newly created reports: for each
/// group, the first listed tag the site declares.
fn candidate_attributes(groups: &[AttributeGroup], site: &Site) -> Vec<(String, String)> {
    let mut candidates = Vec::new();
    for group in groups {
        if let Some(tag) = group
            .attributes
            .iter()
            .find(|tag| site.attributes.contains(&tag.id))
        {
            candidates.push((group.name.clone(), tag.name.clone()));
        }
    }
    candidates
}

/// Geo table column names for one sync run.
#[derive(Debug, Clone)]
pub struct GeoColumns {
    pub code: String,
    pub name: String,
    pub cadastral: String,
    pub latitude: String,
    pub longitude: String,
}

#[derive(Debug, Clone)]
pub struct SiteSyncOptions {
    pub table: String,
    pub columns: GeoColumns,
    pub location_type_id: i64,
    pub site_kind: String,
    pub push_locations: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteSyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_seen: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub bad_rows: usize,
    pub bad_codes: Vec<String>,
    pub pushed: usize,
    pub push_rejected: usize,
}

enum Change {
    Created,
    Updated,
}

/// Upserts the geo table into the location registry by stable code, then
/// pushes new and changed entries upstream when pushing is enabled.
pub async fn run_site_sync(ctx: &RunContext, options: &SiteSyncOptions) -> Result<SiteSyncSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let index = LookupIndex::load(&ctx.store).await?;
    let resolver = LocationResolver::new(&index);

    let rows = ctx
        .geo
        .sql(&format!("select * from {}", options.table))
        .await
        .with_context(|| format!("querying geo table {}", options.table))?;
    info!(%run_id, rows = rows.len(), table = %options.table, "starting site sync");

    // Registry view by code; rewritten in place as the run creates rows.
    let mut by_code: HashMap<String, Location> = HashMap::new();
    for location in ctx.store.locations.all().await? {
        if let Some(code) = location.code.clone() {
            by_code.insert(code, location);
        }
    }

    let mut summary = SiteSyncSummary {
        run_id,
        started_at,
        finished_at: started_at,
        rows_seen: 0,
        created: 0,
        updated: 0,
        unchanged: 0,
        bad_rows: 0,
        bad_codes: Vec::new(),
        pushed: 0,
        push_rejected: 0,
    };

    for row in &rows {
        summary.rows_seen += 1;

        let Some(code) = row.str_col(&options.columns.code) else {
            warn!(column = %options.columns.code, "geo row without a code; skipping");
            summary.bad_rows += 1;
            continue;
        };
        let Some(name) = row.str_col(&options.columns.name) else {
            warn!(code = %code, column = %options.columns.name, "geo row without a name; skipping");
            summary.bad_rows += 1;
            continue;
        };
        let Some(cad_code) = row.str_col(&options.columns.cadastral) else {
            warn!(code = %code, column = %options.columns.cadastral, "geo row without a cadastral code; skipping");
            summary.bad_rows += 1;
            continue;
        };
        let latitude = row.f64_col(&options.columns.latitude);
        let longitude = row.f64_col(&options.columns.longitude);

        let Some(entity) = index.entity_by_code(&cad_code) else {
            warn!(code = %code, cadastral = %cad_code, "unknown cadastral code");
            summary.bad_codes.push(cad_code);
            continue;
        };
        let walk = resolver.walk_chain_from(entity.id);
        if !walk.complete() {
            warn!(code = %code, cadastral = %cad_code, reason = ?walk.broken, "cadastral code did not yield a full chain");
            summary.bad_codes.push(cad_code);
            continue;
        }
        let admin_chain = walk.crumbs;

        let (location, change) = match by_code.get(&code) {
            Some(existing) => {
                let updated = Location {
                    id: existing.id,
                    code: existing.code.clone(),
                    name,
                    kind: Some(options.site_kind.clone()),
                    latitude,
                    longitude,
                    admin_chain,
                };
                if updated == *existing {
                    summary.unchanged += 1;
                    continue;
                }
                (updated, Change::Updated)
            }
            None => (
                Location {
                    id: ctx.ids.next_id(),
                    code: Some(code.clone()),
                    name,
                    kind: Some(options.site_kind.clone()),
                    latitude,
                    longitude,
                    admin_chain,
                },
                Change::Created,
            ),
        };

        ctx.store.put_location(&location).await?;
        by_code.insert(code.clone(), location.clone());
        match change {
            Change::Created => summary.created += 1,
            Change::Updated => summary.updated += 1,
        }

        if options.push_locations {
            let display_name = format!("{}: {}", options.site_kind, location.name);
            let command =
                CreateLocation::for_location(&location, options.location_type_id, display_name);
            match ctx.activity.create_location(&command).await? {
                PushOutcome::Accepted => summary.pushed += 1,
                PushOutcome::Rejected { status } => {
                    warn!(code = %code, status, "location push rejected");
                    summary.push_rejected += 1;
                }
            }
        }
    }

    summary.finished_at = Utc::now();
    info!(
        %run_id,
        created = summary.created,
        updated = summary.updated,
        unchanged = summary.unchanged,
        bad_rows = summary.bad_rows,
        bad_codes = summary.bad_codes.len(),
        pushed = summary.pushed,
        rejected = summary.push_rejected,
        "site sync finished"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct PushStoredSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub matched: usize,
    pub pushed: usize,
    pub rejected: usize,
}

/// Re-pushes stored locations whose name contains the fragment as new
/// remote entries under the given location type. Each push gets a fresh
/// synthetic id; the local document keeps its own.
pub async fn run_push_stored(
    ctx: &RunContext,
    name_fragment: &str,
    location_type_id: i64,
) -> Result<PushStoredSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let mut locations = ctx.store.locations.all().await?;
    locations.sort_by_key(|location| location.id);
    info!(%run_id, fragment = %name_fragment, location_type_id, "starting stored-location push");

    let mut summary = PushStoredSummary {
        run_id,
        started_at,
        finished_at: started_at,
        matched: 0,
        pushed: 0,
        rejected: 0,
    };

    for location in locations
        .iter()
        .filter(|location| location.name.contains(name_fragment))
    {
        summary.matched += 1;
        let mut command =
            CreateLocation::for_location(location, location_type_id, location.name.clone());
        command.id = ctx.ids.next_id();
        match ctx.activity.create_location(&command).await? {
            PushOutcome::Accepted => summary.pushed += 1,
            PushOutcome::Rejected { status } => {
                warn!(location_id = location.id, status, "stored-location push rejected");
                summary.rejected += 1;
            }
        }
    }

    summary.finished_at = Utc::now();
    info!(%run_id, matched = summary.matched, pushed = summary.pushed, rejected = summary.rejected, "stored-location push finished");
    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub levels: usize,
    pub entities: usize,
    pub location_types: usize,
    pub locations: usize,
}

/// Pulls the region's admin levels, their entities, and typed locations
/// into the local lookup stores. Any fetch failure aborts the refresh.
pub async fn run_refresh_levels(ctx: &RunContext, region: &str) -> Result<RefreshSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();

    let levels = ctx
        .activity
        .get_admin_levels(region)
        .await
        .with_context(|| format!("fetching admin levels for region {region}"))?;
    info!(%run_id, region, levels = levels.len(), "starting admin-lookup refresh");

    let mut summary = RefreshSummary {
        run_id,
        started_at,
        finished_at: started_at,
        levels: 0,
        entities: 0,
        location_types: 0,
        locations: 0,
    };

    let mut entities_by_id: HashMap<i64, AdminEntity> = HashMap::new();
    for level in &levels {
        let entities = ctx
            .activity
            .get_entities(level.id)
            .await
            .with_context(|| format!("fetching entities for level {}", level.id))?;
        info!(level = %level.name, entities = entities.len(), "refreshing admin level");
        for mut entity in entities {
            entity.level_id = level.id;
            ctx.store.put_admin_entity(&entity).await?;
            summary.entities += 1;
            entities_by_id.insert(entity.id, entity);
        }
        summary.levels += 1;
    }

    let location_types = ctx
        .activity
        .get_location_types(region)
        .await
        .with_context(|| format!("fetching location types for region {region}"))?;
    for location_type in &location_types {
        let locations = ctx
            .activity
            .get_locations(location_type.id)
            .await
            .with_context(|| format!("fetching locations for type {}", location_type.id))?;
        info!(location_type = %location_type.name, locations = locations.len(), "refreshing locations");
        for remote in &locations {
            let mut location =
                location_from_remote(remote, &location_type.name, &levels, &entities_by_id);
            // Codes are immutable once assigned; a remote payload without
            // one must not clear it.
            if location.code.is_none() {
                if let Some(existing) = ctx.store.location(location.id).await? {
                    location.code = existing.code;
                }
            }
            ctx.store.put_location(&location).await?;
            summary.locations += 1;
        }
        summary.location_types += 1;
    }

    summary.finished_at = Utc::now();
    info!(
        %run_id,
        levels = summary.levels,
        entities = summary.entities,
        location_types = summary.location_types,
        locations = summary.locations,
        "admin-lookup refresh finished"
    );
    Ok(summary)
}

pub async fn run_import_from_env() -> Result<ImportSummary> {
    let config = PipelineConfig::from_env();
    if config.database_ids.is_empty() {
        anyhow::bail!("FIRA_DATABASE_IDS is not set");
    }
    let ctx = RunContext::from_config(&config).await?;
    run_import(&ctx, &config.database_ids).await
}

pub async fn run_site_sync_from_env() -> Result<SiteSyncSummary> {
    let config = PipelineConfig::from_env();
    let ctx = RunContext::from_config(&config).await?;
    run_site_sync(&ctx, &config.site_sync_options()).await
}

pub async fn run_refresh_levels_from_env() -> Result<RefreshSummary> {
    let config = PipelineConfig::from_env();
    let ctx = RunContext::from_config(&config).await?;
    run_refresh_levels(&ctx, &config.region).await
}

pub async fn run_push_stored_from_env(name_fragment: &str) -> Result<PushStoredSummary> {
    let config = PipelineConfig::from_env();
    let ctx = RunContext::from_config(&config).await?;
    run_push_stored(&ctx, name_fragment, config.location_type_id).await
}
