use crate::session::{FrameEvent, Session};
use crate::types::{Region, YearAggregate};
use crate::watch::Reload;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use geo::{BoundingRect, Contains, Point};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

// Bounding box entry pointing back into `AppState::regions`.
pub struct RegionIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for RegionIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub struct AppState {
    pub regions: Vec<Region>,
    pub tree: RTree<RegionIndex>,
    pub aggregates: Arc<BTreeMap<i32, YearAggregate>>,
    pub missing: Vec<i32>,
    pub session: Arc<Session>,
    pub reload: broadcast::Sender<Reload>,
}

impl AppState {
    pub fn new(
        regions: Vec<Region>,
        aggregates: Arc<BTreeMap<i32, YearAggregate>>,
        missing: Vec<i32>,
        session: Arc<Session>,
        reload: broadcast::Sender<Reload>,
    ) -> Self {
        let items: Vec<RegionIndex> = regions
            .iter()
            .enumerate()
            .filter_map(|(index, region)| {
                let rect = region.geometry.bounding_rect()?;
                Some(RegionIndex {
                    index,
                    aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                })
            })
            .collect();
        let tree = RTree::bulk_load(items);
        info!(regions = regions.len(), "spatial index built");

        Self {
            regions,
            tree,
            aggregates,
            missing,
            session,
            reload,
        }
    }

    /// Name of the region containing the point, if any.
    pub fn region_at(&self, lon: f64, lat: f64) -> Option<&Region> {
        let point = Point::new(lon, lat);
        let envelope = AABB::from_point([lon, lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|candidate| self.regions.get(candidate.index))
            .find(|region| region.geometry.contains(&point))
    }
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Serialize)]
pub struct RegionResponse {
    name: String,
    years: Vec<i32>,
}

#[derive(Serialize)]
pub struct YearsResponse {
    years: Vec<i32>,
    missing: Vec<i32>,
    aggregates: Vec<YearAggregate>,
}

pub fn router(state: Arc<AppState>, dist_dir: PathBuf) -> Router {
    Router::new()
        .route("/api/years", get(years_handler))
        .route("/api/years/{year}", post(select_handler))
        .route("/api/frame", get(frame_handler))
        .route("/api/frames", get(frames_handler))
        .route("/api/region", get(region_handler))
        .route("/livereload", get(livereload_handler))
        .fallback_service(ServeDir::new(dist_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, dist_dir: PathBuf, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let session = state.session.clone();
    let app = router(state, dist_dir);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("serving on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    session.dispose();
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

async fn years_handler(State(state): State<Arc<AppState>>) -> Json<YearsResponse> {
    Json(YearsResponse {
        years: state.session.years(),
        missing: state.missing.clone(),
        aggregates: state.aggregates.values().cloned().collect(),
    })
}

async fn select_handler(
    State(state): State<Arc<AppState>>,
    Path(year): Path<i32>,
) -> Result<Json<FrameEvent>, (StatusCode, String)> {
    state
        .session
        .select(year)
        .map(Json)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn frame_handler(State(state): State<Arc<AppState>>) -> Json<FrameEvent> {
    Json(state.session.current())
}

async fn region_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<RegionResponse>> {
    let response = state.region_at(params.lon, params.lat).map(|region| RegionResponse {
        name: region.name.clone(),
        years: state
            .aggregates
            .values()
            .filter(|agg| agg.teams.contains(&region.name))
            .map(|agg| agg.year)
            .collect(),
    });
    Json(response)
}

async fn frames_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.session.subscribe();
    let first = state.session.current();
    let events = stream::once(async move { first })
        .chain(broadcast_stream(rx))
        .map(|frame| Ok(json_event("frame", &frame)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn livereload_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = broadcast_stream(state.reload.subscribe()).map(|reload| Ok(json_event("reload", &reload)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("failed to encode {name} event: {e}");
            Event::default().comment("encoding error")
        }
    }
}

/// Items from a broadcast channel; lagging receivers skip what they missed.
fn broadcast_stream<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> impl Stream<Item = T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}
