use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{FromRequestParts, Multipart, Path, Query, State},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::assistant::{AssistantClient, DraftKind};
use crate::auth::AuthProvider;
use crate::billing::Billing;
use crate::community::{Community, NewEvent, NewNews, NewPost};
use crate::compress::Compressor;
use crate::config::Config;
use crate::error::{AppError, AuthError};
use crate::gate::Gate;
use crate::login::{LoginFlow, SignedIn};
use crate::model::{Audience, ReportCategory, Resident};
use crate::permits::{NewPermit, Permits};
use crate::prefs::Preferences;
use crate::reports::{NewReport, Reports};
use crate::residents::{ProfileUpdate, Residents, id_card};
use crate::store::{Collections, Document, DocumentStore, Query as StoreQuery, Stored};
use crate::subscription::{Subscription, SubscriptionManager};
use crate::weather::WeatherClient;

const IMAGES_ONLY: &str = "Hanya file gambar yang diizinkan.";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub collections: Collections,
    pub login: Arc<LoginFlow>,
    pub residents: Arc<Residents>,
    pub billing: Arc<Billing>,
    pub reports: Arc<Reports>,
    pub permits: Arc<Permits>,
    pub community: Arc<Community>,
    pub gate: Arc<Gate>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub weather: Arc<WeatherClient>,
    pub assistant: Arc<AssistantClient>,
}

impl AppState {
    pub fn new(
        cfg: &Config,
        store: Arc<dyn DocumentStore>,
        auth: Arc<dyn AuthProvider>,
        preferences: Arc<Preferences>,
    ) -> Self {
        let collections = Collections::new(cfg.app.get_app_id());
        let compressor = Arc::new(Compressor::new(cfg.compression));

        AppState {
            login: Arc::new(LoginFlow::new(
                store.clone(),
                auth,
                collections.clone(),
                preferences,
            )),
            residents: Arc::new(Residents::new(store.clone(), collections.clone(), compressor.clone())),
            billing: Arc::new(Billing::new(store.clone(), collections.clone(), compressor.clone())),
            reports: Arc::new(Reports::new(store.clone(), collections.clone(), compressor)),
            permits: Arc::new(Permits::new(store.clone(), collections.clone())),
            community: Arc::new(Community::new(store.clone(), collections.clone())),
            gate: Arc::new(Gate::new(store.clone(), collections.clone())),
            subscriptions: Arc::new(SubscriptionManager::new(store.clone())),
            weather: Arc::new(WeatherClient::new(&cfg.weather)),
            assistant: Arc::new(AssistantClient::new(&cfg.assistant)),
            store,
            collections,
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

fn success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse { data })).into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse { data })).into_response()
}

// ============================================================================
// Extractors
// ============================================================================

/// The signed-in resident behind the request's bearer token.
pub struct CurrentUser {
    pub token: String,
    pub resident: Stored<Resident>,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::Auth(AuthError::SessionExpired))?;

        let SignedIn { resident, .. } = state.login.resume(token).await?;
        Ok(CurrentUser {
            token: token.to_string(),
            resident,
        })
    }
}

/// Text fields and image parts of a multipart upload.
#[derive(Debug, Default)]
struct Upload {
    fields: HashMap<String, String>,
    images: Vec<Vec<u8>>,
}

impl Upload {
    fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or_default()
    }

    fn single_image(mut self) -> Result<Vec<u8>, AppError> {
        match self.images.len() {
            0 => Err(AppError::Validation("Foto wajib dilampirkan.".to_string())),
            _ => Ok(self.images.swap_remove(0)),
        }
    }
}

fn bad_upload(e: axum::extract::multipart::MultipartError) -> AppError {
    AppError::Validation(format!("Unggahan tidak valid: {}", e.body_text()))
}

/// File parts must declare an `image/*` content type; anything else is
/// rejected before it reaches the compressor.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, AppError> {
    let mut upload = Upload::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_upload)? {
        let name = field.name().unwrap_or_default().to_string();
        let is_file = field.file_name().is_some() || field.content_type().is_some();

        if is_file {
            let is_image = field
                .content_type()
                .is_some_and(|content_type| content_type.starts_with("image/"));
            if !is_image {
                return Err(AppError::Validation(IMAGES_ONLY.to_string()));
            }
            let bytes = field.bytes().await.map_err(bad_upload)?;
            info!(field = %name, size = bytes.len(), "received image part");
            upload.images.push(bytes.to_vec());
        } else {
            let text = field.text().await.map_err(bad_upload)?;
            upload.fields.insert(name, text);
        }
    }

    Ok(upload)
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PhoneRequest {
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub resident_id: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(ApiResponse { data: "ok" })
}

pub async fn entry_step(State(state): State<AppState>) -> Response {
    success(state.login.entry_step())
}

pub async fn check_phone(
    State(state): State<AppState>,
    Json(input): Json<PhoneRequest>,
) -> Result<Response, AppError> {
    Ok(success(state.login.check_phone(&input.phone).await?))
}

pub async fn activate(
    State(state): State<AppState>,
    Json(input): Json<ActivateRequest>,
) -> Result<Response, AppError> {
    let signed_in = state
        .login
        .activate(&input.resident_id, &input.email, &input.password)
        .await?;
    Ok(created(signed_in))
}

pub async fn login(
    State(state): State<AppState>,
    Json(input): Json<LoginRequest>,
) -> Result<Response, AppError> {
    Ok(success(state.login.login(&input.email, &input.password).await?))
}

pub async fn logout(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    state.login.logout(&user.token).await?;
    info!(resident_id = %user.resident.id, "signed out");
    Ok(success("ok"))
}

// ============================================================================
// Profile
// ============================================================================

pub async fn get_profile(user: CurrentUser) -> Response {
    success(user.resident)
}

pub async fn update_profile(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(update): Json<ProfileUpdate>,
) -> Result<Response, AppError> {
    Ok(success(state.residents.update_profile(&user.resident.id, update).await?))
}

pub async fn update_photo(
    State(state): State<AppState>,
    user: CurrentUser,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let image = read_upload(multipart).await?.single_image()?;
    Ok(success(state.residents.update_photo(&user.resident.id, image).await?))
}

pub async fn get_card(user: CurrentUser) -> Response {
    success(id_card(&user.resident))
}

// ============================================================================
// Billing
// ============================================================================

pub async fn list_bills(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.billing.list(&user.resident.id).await?))
}

pub async fn bill_summary(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.billing.summary(&user.resident.id).await?))
}

pub async fn submit_payment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(bill_id): Path<String>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let upload = read_upload(multipart).await?;
    let method = upload.field("method").to_string();
    let proof = upload.single_image()?;

    let bill = state
        .billing
        .submit_payment(&user.resident.id, &bill_id, proof, &method)
        .await?;
    Ok(success(bill))
}

// ============================================================================
// Reports
// ============================================================================

pub async fn list_reports(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.reports.list(&user.resident.id).await?))
}

pub async fn create_report(
    State(state): State<AppState>,
    user: CurrentUser,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let upload = read_upload(multipart).await?;
    let category: ReportCategory = serde_json::from_value(Value::String(upload.field("category").to_string()))
        .map_err(|_| AppError::Validation("Kategori laporan tidak dikenal.".to_string()))?;
    let input = NewReport {
        category,
        description: upload.field("description").to_string(),
    };

    let report = state
        .reports
        .create(&user.resident.id, input, upload.images)
        .await?;
    Ok(created(report))
}

pub async fn report_images(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(report_id): Path<String>,
) -> Result<Response, AppError> {
    Ok(success(state.reports.images(&user.resident.id, &report_id).await?))
}

// ============================================================================
// Permits
// ============================================================================

pub async fn list_permits(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.permits.list(&user.resident.id).await?))
}

pub async fn create_permit(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<NewPermit>,
) -> Result<Response, AppError> {
    Ok(created(state.permits.create(&user.resident.id, input).await?))
}

// ============================================================================
// Community
// ============================================================================

pub async fn list_news(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.community.news_for(&user.resident.doc.rt).await?))
}

pub async fn create_news(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<NewNews>,
) -> Result<Response, AppError> {
    Ok(created(state.community.create_news(&user.resident, input).await?))
}

pub async fn list_events(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.community.events_for(&user.resident.doc.rt).await?))
}

pub async fn create_event(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<NewEvent>,
) -> Result<Response, AppError> {
    Ok(created(state.community.create_event(&user.resident, input).await?))
}

pub async fn list_posts(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.community.posts_for(&user.resident.doc.rt).await?))
}

pub async fn create_post(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<NewPost>,
) -> Result<Response, AppError> {
    Ok(created(state.community.create_post(&user.resident, input).await?))
}

pub async fn toggle_like(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(post_id): Path<String>,
) -> Result<Response, AppError> {
    Ok(success(state.community.toggle_like(&post_id, &user.resident.id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

pub async fn list_comments(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(post_id): Path<String>,
) -> Result<Response, AppError> {
    Ok(success(state.community.comments(&post_id).await?))
}

pub async fn add_comment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(post_id): Path<String>,
    Json(input): Json<CommentRequest>,
) -> Result<Response, AppError> {
    let comment = state
        .community
        .add_comment(&post_id, &user.resident, &input.content)
        .await?;
    Ok(created(comment))
}

// ============================================================================
// Gate, weather, assistant
// ============================================================================

pub async fn gate_state(State(state): State<AppState>, _user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.gate.state().await?))
}

#[derive(Debug, Deserialize)]
pub struct GateRequest {
    pub is_open: bool,
}

pub async fn set_gate(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(input): Json<GateRequest>,
) -> Result<Response, AppError> {
    Ok(success(state.gate.set(input.is_open, &user.resident.id).await?))
}

pub async fn toggle_gate(State(state): State<AppState>, user: CurrentUser) -> Result<Response, AppError> {
    Ok(success(state.gate.toggle(&user.resident.id).await?))
}

pub async fn weather(State(state): State<AppState>) -> Response {
    success(state.weather.current().await)
}

#[derive(Debug, Deserialize)]
pub struct DraftRequest {
    pub kind: DraftKind,
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct EventIdeasRequest {
    pub theme: String,
}

#[derive(Debug, Serialize)]
pub struct GeneratedText {
    pub text: String,
}

pub async fn smart_draft(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(input): Json<DraftRequest>,
) -> Response {
    let text = state.assistant.smart_draft(input.kind, &input.notes).await;
    success(GeneratedText { text })
}

pub async fn event_ideas(
    State(state): State<AppState>,
    _user: CurrentUser,
    Json(input): Json<EventIdeasRequest>,
) -> Response {
    let text = state.assistant.event_ideas(&input.theme).await;
    success(GeneratedText { text })
}

// ============================================================================
// Live snapshots
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LiveParams {
    pub view: Option<String>,
}

/// Read-time filtering applied to each snapshot before it is sent.
#[derive(Debug, Clone)]
enum SnapshotFilter {
    Everything,
    VisibleTo(String),
}

impl SnapshotFilter {
    fn apply<'a>(&self, documents: &'a [Document]) -> Vec<&'a Document> {
        match self {
            SnapshotFilter::Everything => documents.iter().collect(),
            SnapshotFilter::VisibleTo(rt) => documents
                .iter()
                .filter(|document| {
                    serde_json::from_value::<Audience>(document.data.clone())
                        .map(|audience| audience.visible_to(rt))
                        .unwrap_or(false)
                })
                .collect(),
        }
    }
}

fn live_query(
    state: &AppState,
    collection: &str,
    resident: &Stored<Resident>,
) -> Result<(StoreQuery, SnapshotFilter), AppError> {
    let rt = resident.doc.rt.clone();
    let query = match collection {
        "billing" => (state.billing.query_for(&resident.id), SnapshotFilter::Everything),
        "reports" => (state.reports.query_for(&resident.id), SnapshotFilter::Everything),
        "permits" => (state.permits.query_for(&resident.id), SnapshotFilter::Everything),
        "news" => (state.community.news_query(), SnapshotFilter::VisibleTo(rt)),
        "events" => (state.community.events_query(), SnapshotFilter::VisibleTo(rt)),
        "posts" => (state.community.posts_query(), SnapshotFilter::VisibleTo(rt)),
        "gate" => (state.gate.query(), SnapshotFilter::Everything),
        _ => return Err(AppError::NotFound(format!("Koleksi {}", collection))),
    };
    Ok(query)
}

fn snapshot_stream(
    subscription: Subscription,
    filter: SnapshotFilter,
) -> impl Stream<Item = Result<SseEvent, axum::Error>> {
    stream::unfold((subscription, filter), |(mut subscription, filter)| async move {
        let snapshot = subscription.next().await?;
        let event = SseEvent::default()
            .event("snapshot")
            .json_data(filter.apply(&snapshot));
        Some((event, (subscription, filter)))
    })
}

/// Streams full result snapshots of one collection as server-sent events.
/// Re-opening the same view replaces the previous stream.
pub async fn live(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(collection): Path<String>,
    Query(params): Query<LiveParams>,
) -> Result<Response, AppError> {
    let (query, filter) = live_query(&state, &collection, &user.resident)?;
    let view = format!(
        "{}/{}",
        user.resident.id,
        params.view.as_deref().unwrap_or(collection.as_str())
    );

    info!(view = %view, collection = %collection, "live query opened");
    let subscription = state.subscriptions.subscribe(&view, query);
    Ok(Sse::new(snapshot_stream(subscription, filter))
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(id: &str, data: Value) -> Document {
        Document {
            id: id.to_string(),
            data,
        }
    }

    #[test]
    fn test_snapshot_filter_by_audience() {
        let documents = vec![
            document("n1", json!({"title": "Kerja bakti", "scope": "RW"})),
            document("n2", json!({"title": "Ronda", "scope": "RT", "rt": "03"})),
            document("n3", json!({"title": "Arisan", "scope": "RT", "rt": "05"})),
            document("n4", json!({"title": "Rusak"})),
        ];

        let visible = SnapshotFilter::VisibleTo("03".to_string()).apply(&documents);
        let ids: Vec<&str> = visible.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);

        assert_eq!(SnapshotFilter::Everything.apply(&documents).len(), 4);
    }

    #[test]
    fn test_upload_requires_an_image() {
        let upload = Upload::default();
        assert!(matches!(upload.single_image(), Err(AppError::Validation(_))));

        let mut upload = Upload::default();
        upload.fields.insert("method".into(), "QRIS".into());
        upload.images.push(vec![1, 2, 3]);
        assert_eq!(upload.field("method"), "QRIS");
        assert_eq!(upload.field("missing"), "");
        assert_eq!(upload.single_image().unwrap(), vec![1, 2, 3]);
    }
}
