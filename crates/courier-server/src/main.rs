//! Courier Server - demo worker with an admin API
//!
//! Runs a consumer against the in-memory broker and exposes its routes,
//! bindings and counters over HTTP. Messages can be injected through the
//! API to exercise the handlers.

mod config;
mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use courier_core::Consumer;
use courier_transport::{Channel, Connection, MemoryBroker};
use courier_types::{
    BindingInfo, BindingSpec, ConsumerStatsSnapshot, Envelope, Error, ExchangeKind,
    MessageId, MessageProperties, QueueOptions,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::ServerConfig;
use crate::handlers::{GreetHandler, LogHandler};

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
struct AppState {
    consumer: Arc<Consumer>,
    broker: Arc<MemoryBroker>,
    exchange: String,
}

// ==================== Request/Response Types ====================

/// Publish message request
#[derive(Debug, Deserialize, ToSchema)]
struct PublishRequest {
    /// Routing key selecting the handler
    routing_key: String,
    /// Message body content
    body: String,
    /// Exchange to publish to (defaults to the worker's exchange)
    #[serde(default)]
    exchange: Option<String>,
    /// Queue the handler's reply goes to
    #[serde(default)]
    reply_to: Option<String>,
    /// Correlation id copied onto the reply
    #[serde(default)]
    correlation_id: Option<String>,
    /// Content type (e.g., "text/plain")
    #[serde(default)]
    content_type: Option<String>,
    /// Custom headers
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
}

/// Publish response
#[derive(Debug, Serialize, ToSchema)]
struct PublishResponse {
    /// ID of the published message
    message_id: String,
    /// Number of queues the message was routed to
    routed: usize,
}

/// Queue depth response
#[derive(Debug, Serialize, ToSchema)]
struct QueueDepthResponse {
    queue: String,
    depth: u64,
}

/// Registered routes
#[derive(Debug, Serialize, ToSchema)]
struct RoutesResponse {
    routes: Vec<String>,
}

/// API Error response
#[derive(Debug, Serialize, ToSchema)]
struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
    /// Whether the consumer loops are running
    consuming: bool,
}

// ==================== Error Handling ====================

/// Wrapper for Courier errors to implement IntoResponse
struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self.0 {
            Error::QueueNotFound(_) => (StatusCode::NOT_FOUND, "QUEUE_NOT_FOUND"),
            Error::ExchangeNotFound(_) => (StatusCode::NOT_FOUND, "EXCHANGE_NOT_FOUND"),
            Error::DeclarationConflict(_) => (StatusCode::CONFLICT, "DECLARATION_CONFLICT"),
            Error::InvalidRoutingKey(_) => (StatusCode::BAD_REQUEST, "INVALID_ROUTING_KEY"),
            Error::ChannelClosed(_) | Error::ConnectionClosed => {
                (StatusCode::SERVICE_UNAVAILABLE, "TRANSPORT_CLOSED")
            }
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(ApiErrorBody {
            error: self.0.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Courier API",
        version = "0.1.0",
        description = "Courier - message dispatch worker admin API",
        license(name = "MIT OR Apache-2.0"),
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(
        health,
        list_routes,
        list_bindings,
        get_stats,
        publish_message,
        get_queue_depth,
    ),
    components(
        schemas(
            HealthResponse,
            RoutesResponse,
            BindingInfo,
            ConsumerStatsSnapshot,
            PublishRequest,
            PublishResponse,
            QueueDepthResponse,
            ApiErrorBody,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "consumer", description = "Consumer inspection endpoints"),
        (name = "messages", description = "Message injection endpoints")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        consuming: state.consumer.is_started(),
    })
}

/// List registered routing keys
#[utoipa::path(
    get,
    path = "/api/v1/routes",
    tag = "consumer",
    responses(
        (status = 200, description = "Registered routing keys", body = RoutesResponse)
    )
)]
async fn list_routes(State(state): State<AppState>) -> Json<RoutesResponse> {
    Json(RoutesResponse {
        routes: state.consumer.routes(),
    })
}

/// List queue bindings
#[utoipa::path(
    get,
    path = "/api/v1/bindings",
    tag = "consumer",
    responses(
        (status = 200, description = "Live bindings", body = Vec<BindingInfo>)
    )
)]
async fn list_bindings(State(state): State<AppState>) -> Json<Vec<BindingInfo>> {
    Json(state.consumer.bindings())
}

/// Get dispatch counters
#[utoipa::path(
    get,
    path = "/api/v1/stats",
    tag = "consumer",
    responses(
        (status = 200, description = "Consumer counters", body = ConsumerStatsSnapshot)
    )
)]
async fn get_stats(State(state): State<AppState>) -> Json<ConsumerStatsSnapshot> {
    Json(state.consumer.stats())
}

/// Publish a message to an exchange
#[utoipa::path(
    post,
    path = "/api/v1/publish",
    tag = "messages",
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Message published", body = PublishResponse),
        (status = 404, description = "Exchange not found", body = ApiErrorBody)
    )
)]
async fn publish_message(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let message_id = MessageId::new();
    let mut properties = MessageProperties {
        message_id: Some(message_id.clone()),
        ..Default::default()
    };

    if let Some(reply_to) = req.reply_to {
        properties = properties.with_reply_to(reply_to);
    }

    if let Some(correlation_id) = req.correlation_id {
        properties = properties.with_correlation_id(correlation_id);
    }

    if let Some(ct) = req.content_type {
        properties = properties.with_content_type(ct);
    }

    if let Some(headers) = req.headers {
        for (k, v) in headers {
            properties = properties.with_header(k, v);
        }
    }

    let exchange = req.exchange.unwrap_or_else(|| state.exchange.clone());
    let envelope =
        Envelope::new(exchange, req.routing_key, req.body).with_properties(properties);
    let routed = state.broker.publish(envelope)?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            message_id: message_id.to_string(),
            routed,
        }),
    ))
}

/// Get the number of ready messages in a queue
#[utoipa::path(
    get,
    path = "/api/v1/queues/{name}/depth",
    tag = "messages",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Queue depth", body = QueueDepthResponse),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn get_queue_depth(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueDepthResponse>, AppError> {
    let depth = state.broker.queue_depth(&name)?;
    Ok(Json(QueueDepthResponse { queue: name, depth }))
}

// ==================== Router ====================

fn create_router(state: AppState) -> Router {
    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Health
        .route("/health", get(health))
        // Consumer
        .route("/api/v1/routes", get(list_routes))
        .route("/api/v1/bindings", get(list_bindings))
        .route("/api/v1/stats", get(get_stats))
        // Messages
        .route("/api/v1/publish", post(publish_message))
        .route("/api/v1/queues/:name/depth", get(get_queue_depth))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ==================== Main ====================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    // In-memory broker with the worker's exchange and a queue collecting replies
    let broker = Arc::new(MemoryBroker::new());
    broker.declare_exchange(&config.exchange, ExchangeKind::Topic)?;
    let connection = broker.connect();

    let mut consumer = Consumer::new(config.consumer.clone());
    consumer.register("greet", GreetHandler)?;
    consumer.register("log", LogHandler)?;

    // Replies land here so they can be inspected through the depth endpoint
    let setup = connection.open_channel().await?;
    setup
        .declare_queue(&config.reply_queue, &QueueOptions::default())
        .await?;

    let work = BindingSpec::new(&config.queue, &config.exchange, &config.routing_pattern)
        .with_options(QueueOptions {
            durable: true,
            ..Default::default()
        });
    consumer.declare_and_bind(&connection, work).await?;
    consumer.start(&connection)?;

    let consumer = Arc::new(consumer);
    let state = AppState {
        consumer: Arc::clone(&consumer),
        broker: Arc::clone(&broker),
        exchange: config.exchange.clone(),
    };

    // Create router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!("Courier server listening on {}", config.addr);
    info!("Swagger UI: http://{}/swagger-ui/", config.addr);
    info!("Health check: http://{}/health", config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = consumer.graceful_shutdown().await;
    info!(
        drained = report.drained,
        remaining = report.remaining,
        "Consumer stopped"
    );
    setup.close().await?;
    connection.close();

    Ok(())
}
