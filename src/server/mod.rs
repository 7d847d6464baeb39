//! HTTP front end: prediction, overlay, signup and login.

mod error;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    http::header,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

pub use error::ApiError;

use crate::{
    auth::{TokenIssuer, UserStore},
    config::Config,
    service::{InferenceHandle, PredictionService, start_inference_worker},
};

const UPLOAD_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
    pub inference: InferenceHandle,
    pub users: Arc<UserStore>,
    pub tokens: Arc<TokenIssuer>,
    pub labels: Arc<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: String,
    pub confidence: f32,
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    pub access_token: String,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub labels: Vec<String>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/predict/", post(predict))
        .route("/visualize/", post(visualize))
        .route("/signup", post(signup))
        .route("/login", post(login))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn read_upload(mut multipart: Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(UPLOAD_FIELD) {
            return Ok(field.bytes().await?.to_vec());
        }
    }
    Err(ApiError::MissingField(UPLOAD_FIELD))
}

async fn predict(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let image = read_upload(multipart).await?;
    let prediction = state.inference.predict(image).await?;
    Ok(Json(PredictResponse {
        prediction: prediction.label,
        confidence: prediction.confidence,
    }))
}

async fn visualize(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let image = read_upload(multipart).await?;
    let jpeg = state.inference.visualize(image).await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg))
}

async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let users = state.users.clone();
    tokio::task::spawn_blocking(move || users.signup(&body.name, &body.email, &body.password))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;
    Ok(Json(MessageResponse {
        message: "Signup successful".to_string(),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let users = state.users.clone();
    let user = tokio::task::spawn_blocking(move || users.login(&body.email, &body.password))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;
    let access_token = state.tokens.issue(&user)?;
    Ok(Json(LoginResponse {
        message: "Login successful".to_string(),
        access_token,
        username: user.username,
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        labels: state.labels.as_ref().clone(),
    })
}

/// Loads models and the user store, then serves until ctrl-c.
pub async fn serve(config: Config) -> Result<()> {
    let tokens = TokenIssuer::new(
        &config.auth.jwt_secret,
        Duration::from_secs(config.auth.token_ttl_secs),
    )
    .context("set auth.jwt_secret or SIGNSPEAK_JWT_SECRET before starting the server")?;
    let users = UserStore::open(&config.auth.database, config.auth.bcrypt_cost).with_context(
        || format!("failed to open user database {}", config.auth.database.display()),
    )?;
    let labels = config.recognition.gesture_labels()?;

    let models = config.models.clone();
    let recognition = config.recognition.clone();
    let queue_capacity = config.server.queue_capacity;
    let (inference, _worker) = tokio::task::spawn_blocking(move || {
        start_inference_worker(
            move || PredictionService::from_config(&models, &recognition),
            queue_capacity,
        )
    })
    .await
    .context("inference start-up task panicked")??;

    let state = AppState {
        inference,
        users: Arc::new(users),
        tokens: Arc::new(tokens),
        labels: Arc::new(labels.as_slice().to_vec()),
    };
    let app = router(state, config.server.max_upload_bytes);

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for ctrl-c: {err}");
    }
}
