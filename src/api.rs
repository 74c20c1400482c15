use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::models::{EndpointStatus, PulseSnapshot};
use crate::pulse::PulseEngine;
use crate::rollup::{geo_rollup, GeoGroup};

const NO_STORE: &str = "no-store, no-cache, must-revalidate";

#[derive(Debug, Serialize)]
pub struct GeoRollupResponse {
    pub generated_at: DateTime<Utc>,
    pub online: bool,
    pub groups: Vec<GeoGroup>,
}

#[derive(Debug, Serialize)]
pub struct ChannelHealth {
    pub channel: String,
    pub active: String,
    pub endpoints: Vec<EndpointStatus>,
}

pub fn router(engine: Arc<PulseEngine>) -> Router {
    Router::new()
        .route("/api/pulse", get(get_pulse))
        .route("/api/geo", get(get_geo))
        .route("/api/endpoints", get(get_endpoints))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static(NO_STORE),
        ))
        .with_state(engine)
}

pub async fn get_pulse(State(engine): State<Arc<PulseEngine>>) -> Json<PulseSnapshot> {
    Json(engine.refresh().await)
}

pub async fn get_geo(State(engine): State<Arc<PulseEngine>>) -> Json<GeoRollupResponse> {
    let snapshot = engine.refresh().await;
    Json(GeoRollupResponse {
        generated_at: snapshot.generated_at,
        online: snapshot.online,
        groups: geo_rollup(&snapshot.nodes),
    })
}

pub async fn get_endpoints(State(engine): State<Arc<PulseEngine>>) -> Json<Vec<ChannelHealth>> {
    Json(
        engine
            .endpoint_statuses()
            .into_iter()
            .map(|(channel, active, endpoints)| ChannelHealth {
                channel,
                active,
                endpoints,
            })
            .collect(),
    )
}
