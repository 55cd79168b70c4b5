//! Client contracts for the remote activity API, the geospatial table
//! service, and the notification webhook, with HTTP and fixture
//! implementations of each.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use fira_core::{
    AdminCrumb, AdminEntity, AdminLevel, Database, Location, PeriodReports, Site,
};
use fira_storage::{BasicAuth, HttpClient, TransportError};

pub const CRATE_NAME: &str = "fira-clients";

/// Workflow status stamped on every pushed location.
pub const WORKFLOW_VALIDATED: &str = "validated";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A location category on the remote side ("Village", "Camp", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationType {
    pub id: i64,
    pub name: String,
}

/// Admin reference embedded in a remote location payload. Carries no
/// external code; only the entity store knows codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAdminRef {
    pub id: i64,
    pub name: String,
}

/// Location payload as the remote API returns it: admin entities keyed by
/// stringified level id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLocation {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub admin_entities: HashMap<String, RemoteAdminRef>,
}

/// Converts a remote location into the canonical shape. The chain follows
/// the fetched level order; crumbs prefer the stored entity (which knows
/// the external code) and fall back to the embedded reference.
pub fn location_from_remote(
    remote: &RemoteLocation,
    kind: &str,
    levels: &[AdminLevel],
    entities: &HashMap<i64, AdminEntity>,
) -> Location {
    let mut admin_chain = Vec::new();
    for level in levels {
        let Some(admin_ref) = remote.admin_entities.get(&level.id.to_string()) else {
            continue;
        };
        let crumb = match entities.get(&admin_ref.id) {
            Some(entity) => AdminCrumb::from_entity(entity),
            None => AdminCrumb {
                level_id: level.id,
                entity_id: admin_ref.id,
                code: admin_ref.id.to_string(),
                name: admin_ref.name.clone(),
            },
        };
        admin_chain.push(crumb);
    }

    Location {
        id: remote.id,
        code: remote.code.clone(),
        name: remote.name.clone(),
        kind: Some(kind.to_string()),
        latitude: remote.latitude,
        longitude: remote.longitude,
        admin_chain,
    }
}

/// `CreateLocation` command properties. Admin assignments serialize as
/// flattened `E<level_id>` keys, matching the command schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLocation {
    pub id: i64,
    pub location_type_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(rename = "workflowstatusid")]
    pub workflow_status_id: String,
    #[serde(flatten)]
    pub admin_assignments: BTreeMap<String, i64>,
}

impl CreateLocation {
    pub fn new(id: i64, location_type_id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            location_type_id,
            name: name.into(),
            axe: None,
            latitude: None,
            longitude: None,
            workflow_status_id: WORKFLOW_VALIDATED.to_string(),
            admin_assignments: BTreeMap::new(),
        }
    }

    pub fn assign_admin(mut self, level_id: i64, entity_id: i64) -> Self {
        self.admin_assignments.insert(format!("E{level_id}"), entity_id);
        self
    }

    /// Command for pushing a registry location upstream: the code travels
    /// as `axe`, the chain as one assignment per crumb.
    pub fn for_location(
        location: &Location,
        location_type_id: i64,
        display_name: impl Into<String>,
    ) -> Self {
        let mut command = Self::new(location.id, location_type_id, display_name);
        command.axe = location.code.clone();
        command.latitude = location.latitude;
        command.longitude = location.longitude;
        for crumb in &location.admin_chain {
            command = command.assign_admin(crumb.level_id, crumb.entity_id);
        }
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Rejected { status: u16 },
}

/// Read/write access to the remote activity-tracking API.
#[async_trait]
pub trait ActivityClient: Send + Sync {
    async fn get_database(&self, database_id: i64) -> Result<Database, ClientError>;

    /// Sites for an activity, never with embedded monthly reports.
    async fn get_sites(&self, activity_id: i64) -> Result<Vec<Site>, ClientError>;

    async fn get_monthly_reports_for_site(
        &self,
        site_id: i64,
    ) -> Result<PeriodReports, ClientError>;

    async fn get_admin_levels(&self, region: &str) -> Result<Vec<AdminLevel>, ClientError>;

    async fn get_entities(&self, level_id: i64) -> Result<Vec<AdminEntity>, ClientError>;

    async fn get_location_types(&self, region: &str) -> Result<Vec<LocationType>, ClientError>;

    async fn get_locations(
        &self,
        location_type_id: i64,
    ) -> Result<Vec<RemoteLocation>, ClientError>;

    /// A rejection is an outcome, not an error; transport failures are
    /// the only `Err` here.
    async fn create_location(&self, command: &CreateLocation)
        -> Result<PushOutcome, ClientError>;
}

/// One result row from the geospatial table; column access by configured
/// name, with tolerant string/number coercion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoRow(pub serde_json::Map<String, JsonValue>);

impl GeoRow {
    pub fn from_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self(map),
            _ => Self(serde_json::Map::new()),
        }
    }

    pub fn str_col(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            JsonValue::String(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            JsonValue::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }

    pub fn f64_col(&self, name: &str) -> Option<f64> {
        match self.0.get(name)? {
            JsonValue::Number(number) => number.as_f64(),
            JsonValue::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

#[async_trait]
pub trait GeoTableClient: Send + Sync {
    async fn sql(&self, query: &str) -> Result<Vec<GeoRow>, ClientError>;
}

/// Fire-and-forget message sink. Callers log a failed notification and
/// move on; a broken webhook must never stall a pipeline.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Clone)]
pub struct ActivityApiConfig {
    pub base_url: String,
    pub auth: Option<BasicAuth>,
}

#[derive(Debug, Clone)]
pub struct HttpActivityClient {
    http: HttpClient,
    config: ActivityApiConfig,
}

#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    command: CommandBody<'a>,
}

#[derive(Debug, Serialize)]
struct CommandBody<'a> {
    properties: &'a CreateLocation,
}

impl HttpActivityClient {
    pub fn new(http: HttpClient, config: ActivityApiConfig) -> Self {
        Self { http, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        Ok(self
            .http
            .get_json(&self.url(path), query, self.config.auth.as_ref())
            .await?)
    }
}

#[async_trait]
impl ActivityClient for HttpActivityClient {
    async fn get_database(&self, database_id: i64) -> Result<Database, ClientError> {
        self.get(&format!("resources/database/{database_id}/schema"), &[])
            .await
    }

    async fn get_sites(&self, activity_id: i64) -> Result<Vec<Site>, ClientError> {
        let activity = activity_id.to_string();
        self.get(
            "resources/sites",
            &[("activity", activity.as_str()), ("includeMonthlyReports", "false")],
        )
        .await
    }

    async fn get_monthly_reports_for_site(
        &self,
        site_id: i64,
    ) -> Result<PeriodReports, ClientError> {
        self.get(&format!("resources/sites/{site_id}/monthlyReports"), &[])
            .await
    }

    async fn get_admin_levels(&self, region: &str) -> Result<Vec<AdminLevel>, ClientError> {
        self.get(&format!("resources/country/{region}/adminLevels"), &[])
            .await
    }

    async fn get_entities(&self, level_id: i64) -> Result<Vec<AdminEntity>, ClientError> {
        self.get(&format!("resources/adminLevel/{level_id}/entities"), &[])
            .await
    }

    async fn get_location_types(&self, region: &str) -> Result<Vec<LocationType>, ClientError> {
        self.get(&format!("resources/country/{region}/locationTypes"), &[])
            .await
    }

    async fn get_locations(
        &self,
        location_type_id: i64,
    ) -> Result<Vec<RemoteLocation>, ClientError> {
        let location_type = location_type_id.to_string();
        self.get("resources/locations", &[("type", location_type.as_str())])
            .await
    }

    async fn create_location(
        &self,
        command: &CreateLocation,
    ) -> Result<PushOutcome, ClientError> {
        let envelope = CommandEnvelope {
            kind: "CreateLocation",
            command: CommandBody { properties: command },
        };
        let status = self
            .http
            .post_json(&self.url("command"), self.config.auth.as_ref(), &envelope)
            .await?;
        if status.is_success() {
            Ok(PushOutcome::Accepted)
        } else {
            Ok(PushOutcome::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeoApiConfig {
    pub domain: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct HttpGeoTableClient {
    http: HttpClient,
    config: GeoApiConfig,
}

#[derive(Debug, Deserialize)]
struct GeoSqlResponse {
    rows: Vec<GeoRow>,
}

impl HttpGeoTableClient {
    pub fn new(http: HttpClient, config: GeoApiConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl GeoTableClient for HttpGeoTableClient {
    async fn sql(&self, query: &str) -> Result<Vec<GeoRow>, ClientError> {
        let url = format!("https://{}/api/v2/sql", self.config.domain);
        let resp: GeoSqlResponse = self
            .http
            .get_json(&url, &[("q", query), ("api_key", &self.config.api_key)], None)
            .await?;
        Ok(resp.rows)
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
}

/// Posts `{"text": ...}` to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: HttpClient,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(http: HttpClient, webhook_url: impl Into<String>) -> Self {
        Self {
            http,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<(), ClientError> {
        let status = self
            .http
            .post_json(&self.webhook_url, None, &WebhookMessage { text: message })
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Transport(TransportError::HttpStatus {
                status: status.as_u16(),
                url: self.webhook_url.clone(),
            }))
        }
    }
}

/// Notifier for runs with no webhook configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _message: &str) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Collects messages in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("messages lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), ClientError> {
        self.messages
            .lock()
            .expect("messages lock")
            .push(message.to_string());
        Ok(())
    }
}

/// Canned remote dataset for tests and offline runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityFixture {
    #[serde(default)]
    pub databases: Vec<Database>,
    #[serde(default)]
    pub sites_by_activity: HashMap<i64, Vec<Site>>,
    #[serde(default)]
    pub reports_by_site: HashMap<i64, PeriodReports>,
    #[serde(default)]
    pub admin_levels: Vec<AdminLevel>,
    #[serde(default)]
    pub entities_by_level: HashMap<i64, Vec<AdminEntity>>,
    #[serde(default)]
    pub location_types: Vec<LocationType>,
    #[serde(default)]
    pub locations_by_type: HashMap<i64, Vec<RemoteLocation>>,
}

pub fn load_activity_fixture(path: impl AsRef<Path>) -> Result<ActivityFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Fixture-backed client. Records pushed commands so tests can assert on
/// them; failure knobs exercise the per-activity and per-site catch
/// boundaries.
#[derive(Debug, Default)]
pub struct FixtureActivityClient {
    fixture: ActivityFixture,
    fail_sites_for: Vec<i64>,
    fail_reports_for: Vec<i64>,
    reject_pushes_with: Option<u16>,
    pushed: Mutex<Vec<CreateLocation>>,
}

impl FixtureActivityClient {
    pub fn new(fixture: ActivityFixture) -> Self {
        Self {
            fixture,
            ..Self::default()
        }
    }

    /// Site fetches for this activity will fail.
    pub fn with_failing_sites(mut self, activity_id: i64) -> Self {
        self.fail_sites_for.push(activity_id);
        self
    }

    /// Monthly-report fetches for this site will fail.
    pub fn with_failing_reports(mut self, site_id: i64) -> Self {
        self.fail_reports_for.push(site_id);
        self
    }

    /// Every push comes back rejected with the given status.
    pub fn with_rejected_pushes(mut self, status: u16) -> Self {
        self.reject_pushes_with = Some(status);
        self
    }

    pub fn pushed(&self) -> Vec<CreateLocation> {
        self.pushed.lock().expect("pushed commands lock").clone()
    }
}

#[async_trait]
impl ActivityClient for FixtureActivityClient {
    async fn get_database(&self, database_id: i64) -> Result<Database, ClientError> {
        self.fixture
            .databases
            .iter()
            .find(|database| database.id == database_id)
            .cloned()
            .ok_or_else(|| ClientError::Message(format!("no fixture database {database_id}")))
    }

    async fn get_sites(&self, activity_id: i64) -> Result<Vec<Site>, ClientError> {
        if self.fail_sites_for.contains(&activity_id) {
            return Err(ClientError::Message(format!(
                "site fetch failed for activity {activity_id}"
            )));
        }
        Ok(self
            .fixture
            .sites_by_activity
            .get(&activity_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_monthly_reports_for_site(
        &self,
        site_id: i64,
    ) -> Result<PeriodReports, ClientError> {
        if self.fail_reports_for.contains(&site_id) {
            return Err(ClientError::Message(format!(
                "monthly reports fetch failed for site {site_id}"
            )));
        }
        Ok(self
            .fixture
            .reports_by_site
            .get(&site_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_admin_levels(&self, _region: &str) -> Result<Vec<AdminLevel>, ClientError> {
        Ok(self.fixture.admin_levels.clone())
    }

    async fn get_entities(&self, level_id: i64) -> Result<Vec<AdminEntity>, ClientError> {
        Ok(self
            .fixture
            .entities_by_level
            .get(&level_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_location_types(&self, _region: &str) -> Result<Vec<LocationType>, ClientError> {
        Ok(self.fixture.location_types.clone())
    }

    async fn get_locations(
        &self,
        location_type_id: i64,
    ) -> Result<Vec<RemoteLocation>, ClientError> {
        Ok(self
            .fixture
            .locations_by_type
            .get(&location_type_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_location(
        &self,
        command: &CreateLocation,
    ) -> Result<PushOutcome, ClientError> {
        self.pushed
            .lock()
            .expect("pushed commands lock")
            .push(command.clone());
        match self.reject_pushes_with {
            Some(status) => Ok(PushOutcome::Rejected { status }),
            None => Ok(PushOutcome::Accepted),
        }
    }
}

/// Fixture-backed geospatial table.
#[derive(Debug, Clone, Default)]
pub struct FixtureGeoTable {
    pub rows: Vec<GeoRow>,
}

impl FixtureGeoTable {
    pub fn new(rows: Vec<GeoRow>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl GeoTableClient for FixtureGeoTable {
    async fn sql(&self, _query: &str) -> Result<Vec<GeoRow>, ClientError> {
        Ok(self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_fixture_path() -> PathBuf {
        workspace_root().join("fixtures/activity/sample.json")
    }

    #[test]
    fn create_location_flattens_admin_assignments() {
        let command = CreateLocation::new(1200345678, 50601, "Village: Qoubaiyat")
            .assign_admin(1370, 7)
            .assign_admin(1521, 23)
            .assign_admin(1522, 310);
        let mut command = command;
        command.axe = Some("12345-1-001".to_string());
        command.latitude = Some(34.57);
        command.longitude = Some(36.27);

        let value = serde_json::to_value(&command).expect("serialize");
        assert_eq!(value["id"], json!(1200345678i64));
        assert_eq!(value["locationTypeId"], json!(50601));
        assert_eq!(value["name"], json!("Village: Qoubaiyat"));
        assert_eq!(value["axe"], json!("12345-1-001"));
        assert_eq!(value["workflowstatusid"], json!("validated"));
        assert_eq!(value["E1370"], json!(7));
        assert_eq!(value["E1521"], json!(23));
        assert_eq!(value["E1522"], json!(310));
        assert!(value.get("admin_assignments").is_none());
    }

    #[test]
    fn create_location_skips_absent_coordinates() {
        let command = CreateLocation::new(42, 50601, "Village: Somewhere");
        let value = serde_json::to_value(&command).expect("serialize");
        assert!(value.get("axe").is_none());
        assert!(value.get("latitude").is_none());
        assert!(value.get("longitude").is_none());
    }

    #[test]
    fn command_envelope_wraps_properties() {
        let command = CreateLocation::new(42, 50601, "Village: Somewhere");
        let envelope = CommandEnvelope {
            kind: "CreateLocation",
            command: CommandBody {
                properties: &command,
            },
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["type"], json!("CreateLocation"));
        assert_eq!(value["command"]["properties"]["id"], json!(42));
    }

    #[test]
    fn geo_row_coerces_strings_and_numbers() {
        let row = GeoRow::from_value(json!({
            "pcode": "12345-1-001",
            "cad_code": 310,
            "latitude": "34.57",
            "longitude": 36.27,
            "blank": "   ",
        }));

        assert_eq!(row.str_col("pcode").as_deref(), Some("12345-1-001"));
        assert_eq!(row.str_col("cad_code").as_deref(), Some("310"));
        assert_eq!(row.f64_col("latitude"), Some(34.57));
        assert_eq!(row.f64_col("longitude"), Some(36.27));
        assert_eq!(row.str_col("blank"), None);
        assert_eq!(row.str_col("missing"), None);
        assert_eq!(row.f64_col("pcode"), None);
    }

    #[test]
    fn remote_location_chain_follows_level_order() {
        let levels = vec![
            AdminLevel {
                id: 1370,
                name: "Governorate".to_string(),
            },
            AdminLevel {
                id: 1521,
                name: "District".to_string(),
            },
            AdminLevel {
                id: 1522,
                name: "Cadastral Area".to_string(),
            },
        ];
        let mut entities = HashMap::new();
        entities.insert(
            310,
            AdminEntity {
                id: 310,
                name: "Qoubaiyat".to_string(),
                code: Some("CAD9".to_string()),
                level_id: 1522,
                parent_id: Some(23),
            },
        );

        let remote = RemoteLocation {
            id: 99,
            name: "Village A".to_string(),
            code: Some("54321-2-100".to_string()),
            latitude: Some(33.89),
            longitude: Some(35.5),
            admin_entities: HashMap::from([
                (
                    "1522".to_string(),
                    RemoteAdminRef {
                        id: 310,
                        name: "Qoubaiyat".to_string(),
                    },
                ),
                (
                    "1370".to_string(),
                    RemoteAdminRef {
                        id: 7,
                        name: "North".to_string(),
                    },
                ),
            ]),
        };

        let location = location_from_remote(&remote, "Village", &levels, &entities);

        assert_eq!(location.id, 99);
        assert_eq!(location.code.as_deref(), Some("54321-2-100"));
        assert_eq!(location.kind.as_deref(), Some("Village"));
        assert_eq!(location.admin_chain.len(), 2);
        // Root-first regardless of payload map order.
        assert_eq!(location.admin_chain[0].level_id, 1370);
        assert_eq!(location.admin_chain[0].code, "7");
        assert_eq!(location.admin_chain[1].level_id, 1522);
        assert_eq!(location.admin_chain[1].code, "CAD9");
    }

    #[test]
    fn activity_fixture_loads_from_json() {
        let fixture = load_activity_fixture(sample_fixture_path()).expect("load fixture");

        let database = fixture.databases.first().expect("database");
        assert_eq!(database.name, "refugee-response");
        assert_eq!(database.activities.len(), 1);

        let sites = fixture.sites_by_activity.get(&101).expect("sites");
        assert_eq!(sites[0].partner.name, "Relief Org");
        assert_eq!(sites[0].comments.as_deref(), Some("ref 54321-2-100 info"));

        let cadastral = fixture
            .entities_by_level
            .get(&1522)
            .and_then(|entities| entities.first())
            .expect("cadastral entity");
        assert_eq!(cadastral.code.as_deref(), Some("CAD9"));
        assert_eq!(cadastral.parent_id, Some(23));
    }

    #[tokio::test]
    async fn fixture_client_records_pushes_and_rejections() {
        let client =
            FixtureActivityClient::new(ActivityFixture::default()).with_rejected_pushes(403);
        let command = CreateLocation::new(7, 50601, "Village: Somewhere");

        let outcome = client.create_location(&command).await.expect("push");
        assert_eq!(outcome, PushOutcome::Rejected { status: 403 });
        assert_eq!(client.pushed(), vec![command]);
    }
}
