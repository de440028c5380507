use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    convert::Infallible,
    sync::Arc,
};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Json, Path, Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post, put},
    Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{Event, EventBus},
    entry::{parse_day, ConversationEntry, EntryEdit},
    geo::{Coordinates, Distance, DistanceUnit, Nearby, Place, PlaceFilter, PlaceOrder},
    journal::{DailyAggregator, DailyBundle, DayDigest, DayDigests, EntryOrder},
    photo::PhotoResolver,
    store::{EditOutcome, RecordOutcome, SessionInfo, Store},
};

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(e) => {
                error!("Request failed: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong, please try again.".to_string(),
                )
            }
        };
        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` body whose rejections use the error envelope.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct JsonBody<T>(pub T);

/// `Query` string whose rejections use the error envelope.
#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
pub struct QueryParams<T>(pub T);

// -----------------------------------------------------------------------------
// Request / response shapes
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Original,
    Recent,
    Distance,
}

/// `sort`, `lat` and `lng` as accepted by the journal endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct OrderParams {
    #[serde(default)]
    pub sort: SortKey,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl OrderParams {
    fn entry_order(&self) -> ApiResult<EntryOrder> {
        match self.sort {
            SortKey::Original => Ok(EntryOrder::Original),
            SortKey::Recent => Ok(EntryOrder::Recency),
            SortKey::Distance => origin(self.lat, self.lng)?
                .map(EntryOrder::Distance)
                .ok_or_else(|| ApiError::BadRequest("Distance sort needs lat and lng".into())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AggregateRequest {
    /// Entries keyed by the producer's date string.
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ConversationEntry>>,
    /// Pre-bundled `{images, summary}` per date.
    #[serde(default)]
    pub bundles: HashMap<String, DayDigest>,
    #[serde(flatten)]
    pub order: OrderParams,
}

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    pub session_id: Option<String>,
    /// Keep only the most recently recorded entries.
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TimestampQuery {
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// Maximum distance, in `unit`.
    pub radius: Option<f64>,
    #[serde(default)]
    pub unit: DistanceUnit,
    /// Comma-separated category tags.
    pub categories: Option<String>,
    #[serde(default)]
    pub order: PlaceOrder,
}

#[derive(Debug, Deserialize)]
pub struct PlacesRequest {
    pub items: Vec<Place>,
    #[serde(default)]
    pub origin: Option<Coordinates>,
    #[serde(default)]
    pub max_distance: Option<f64>,
    #[serde(default)]
    pub unit: DistanceUnit,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub order: PlaceOrder,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NearbyItem<T> {
    #[serde(flatten)]
    pub item: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_label: Option<String>,
}

impl<T> NearbyItem<T> {
    fn new(nearby: Nearby<T>, unit: DistanceUnit) -> Self {
        Self {
            item: nearby.item,
            distance_m: nearby.distance.map(Distance::meters),
            distance_label: nearby.distance.map(|d| d.display(unit)),
        }
    }
}

fn origin(lat: Option<f64>, lng: Option<f64>) -> ApiResult<Option<Coordinates>> {
    match (lat, lng) {
        (None, None) => Ok(None),
        (Some(lat), Some(lng)) => Coordinates::new(lat, lng)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest("Coordinates out of range".into())),
        _ => Err(ApiError::BadRequest("lat and lng must be given together".into())),
    }
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct AppState {
    pub store: Store,
    pub bus: Arc<EventBus>,
    pub photos: PhotoResolver,
}

// -----------------------------------------------------------------------------
// Implementation
// -----------------------------------------------------------------------------

pub struct JournalServer {
    state: Arc<AppState>,
}

impl JournalServer {
    pub fn new(store: Store, bus: Arc<EventBus>, photos: PhotoResolver) -> Self {
        Self {
            state: Arc::new(AppState { store, bus, photos }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/events", get(events_handler))
            .route(
                "/users/:user_id/entries",
                get(list_entries_handler)
                    .post(record_entry_handler)
                    .patch(edit_by_timestamp_handler),
            )
            .route("/users/:user_id/entries/nearby", get(nearby_entries_handler))
            .route("/users/:user_id/entries/:entry_id", patch(edit_entry_handler))
            .route("/users/:user_id/sessions/:session_id", get(session_handler))
            .route("/users/:user_id/journal", get(journal_handler))
            .route("/users/:user_id/journal/:date", put(save_digest_handler))
            .route("/journal/aggregate", post(aggregate_handler))
            .route("/places/nearby", post(places_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "service": "hermes" }))
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    QueryParams(query): QueryParams<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    info!("New SSE connection established");

    let mut rx = state.bus.subscribe();
    let only_user = query.user_id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if only_user.as_deref().is_some_and(|u| u != event.user_id()) {
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(data) => yield Ok(SseEvent::default().data(data)),
                        Err(e) => error!("Failed to encode bus event: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn record_entry_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    JsonBody(entry): JsonBody<ConversationEntry>,
) -> ApiResult<(StatusCode, Json<ConversationEntry>)> {
    let entry = match state.store.record_entry(&user_id, entry).await? {
        RecordOutcome::Recorded(entry) => entry,
        RecordOutcome::Duplicate(id) => {
            return Err(ApiError::Conflict(format!("Entry {id} is already recorded")));
        }
    };
    info!(
        "Recorded entry {} for user {}",
        entry.id.as_deref().unwrap_or("-"),
        user_id
    );

    state.bus.publish(Event::EntryRecorded {
        user_id,
        entry: entry.clone(),
    });
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn list_entries_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    QueryParams(query): QueryParams<EntriesQuery>,
) -> ApiResult<Json<Vec<ConversationEntry>>> {
    let mut entries = match query.session_id {
        Some(session_id) => state.store.list_session_entries(&user_id, &session_id).await?,
        None => state.store.list_entries(&user_id).await?,
    };
    if let Some(limit) = query.limit {
        entries = entries.split_off(entries.len().saturating_sub(limit));
    }
    Ok(Json(entries))
}

async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, session_id)): Path<(String, String)>,
) -> ApiResult<Json<SessionInfo>> {
    state
        .store
        .session_info(&user_id, &session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Session not found".into()))
}

fn finish_edit(state: &AppState, user_id: String, outcome: EditOutcome) -> ApiResult<Json<ConversationEntry>> {
    match outcome {
        EditOutcome::Updated(entry) => {
            state.bus.publish(Event::EntryEdited {
                user_id,
                entry: entry.clone(),
            });
            Ok(Json(entry))
        }
        EditOutcome::NotFound => Err(ApiError::NotFound("Journal entry not found".into())),
        EditOutcome::Ambiguous(count) => Err(ApiError::Conflict(format!(
            "{count} entries share this timestamp; edit by id instead"
        ))),
    }
}

async fn edit_entry_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, entry_id)): Path<(String, String)>,
    JsonBody(edit): JsonBody<EntryEdit>,
) -> ApiResult<Json<ConversationEntry>> {
    if edit.is_empty() {
        return Err(ApiError::BadRequest("Nothing to edit".into()));
    }
    let outcome = state.store.edit_entry(&user_id, &entry_id, &edit).await?;
    finish_edit(&state, user_id, outcome)
}

async fn edit_by_timestamp_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    QueryParams(query): QueryParams<TimestampQuery>,
    JsonBody(edit): JsonBody<EntryEdit>,
) -> ApiResult<Json<ConversationEntry>> {
    if edit.is_empty() {
        return Err(ApiError::BadRequest("Nothing to edit".into()));
    }
    let outcome = state
        .store
        .edit_entry_by_timestamp(&user_id, &query.timestamp, &edit)
        .await?;
    finish_edit(&state, user_id, outcome)
}

async fn nearby_entries_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    QueryParams(query): QueryParams<NearbyQuery>,
) -> ApiResult<Json<Vec<NearbyItem<ConversationEntry>>>> {
    let mut filter = PlaceFilter::new(origin(query.lat, query.lng)?).order(query.order);
    if let Some(radius) = query.radius {
        filter = filter.within(Distance::new(radius, query.unit));
    }
    if let Some(categories) = &query.categories {
        filter = filter.categories(categories.split(',').map(str::trim).filter(|c| !c.is_empty()));
    }

    let entries = state.store.list_entries(&user_id).await?;
    let unit = query.unit;
    Ok(Json(
        filter
            .apply(entries)
            .into_iter()
            .map(|n| NearbyItem::new(n, unit))
            .collect(),
    ))
}

async fn journal_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    QueryParams(params): QueryParams<OrderParams>,
) -> ApiResult<Json<Vec<DailyBundle>>> {
    let order = params.entry_order()?;

    // Aggregate only once both loads have succeeded.
    let entries = state.store.list_entries(&user_id).await?;
    let digests = state.store.day_digests(&user_id).await?;

    let bundles = DailyAggregator::new(&state.photos)
        .with_digests(&digests)
        .order(order)
        .aggregate(entries);
    debug!("Built {} journal days for user {}", bundles.len(), user_id);
    Ok(Json(bundles))
}

async fn save_digest_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, date)): Path<(String, String)>,
    JsonBody(mut digest): JsonBody<DayDigest>,
) -> ApiResult<Json<DayDigest>> {
    let day = parse_day(&date).ok_or_else(|| ApiError::BadRequest(format!("Invalid date: {date}")))?;

    // Digest images are served verbatim, so they are normalized on the way in.
    if let Some(images) = digest.images.take() {
        let mut normalized: Vec<String> = Vec::with_capacity(images.len());
        for url in images.iter().filter_map(|raw| state.photos.normalize(raw)) {
            if !normalized.contains(&url) {
                normalized.push(url);
            }
        }
        digest.images = Some(normalized);
    }

    state.store.save_day_digest(&user_id, day, &digest).await?;
    state.bus.publish(Event::DayDigestSaved {
        user_id,
        date: day.format("%Y-%m-%d").to_string(),
    });
    Ok(Json(digest))
}

async fn aggregate_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(request): JsonBody<AggregateRequest>,
) -> ApiResult<Json<Vec<DailyBundle>>> {
    let order = request.order.entry_order()?;
    let digests = DayDigests::from_keyed(request.bundles);

    let bundles = DailyAggregator::new(&state.photos)
        .with_digests(&digests)
        .order(order)
        .aggregate_grouped(request.entries);
    Ok(Json(bundles))
}

async fn places_handler(JsonBody(request): JsonBody<PlacesRequest>) -> ApiResult<Json<Vec<NearbyItem<Place>>>> {
    let origin = match request.origin {
        Some(o) => Some(
            Coordinates::new(o.latitude, o.longitude)
                .ok_or_else(|| ApiError::BadRequest("Coordinates out of range".into()))?,
        ),
        None => None,
    };

    let mut filter = PlaceFilter::new(origin)
        .categories(request.categories)
        .order(request.order);
    if let Some(max) = request.max_distance {
        filter = filter.within(Distance::new(max, request.unit));
    }

    let unit = request.unit;
    let items = filter
        .apply(request.items)
        .into_iter()
        .map(|n| NearbyItem::new(n, unit))
        .collect();
    Ok(Json(items))
}
