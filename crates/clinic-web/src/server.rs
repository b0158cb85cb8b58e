//! Web服务器

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{self, require_permission};
use crate::handlers::{self, budgets, patients, payment_links, payments, refunds};
use crate::state::AppState;

/// HTTP 层设置
#[derive(Debug, Clone)]
pub struct WebOptions {
    pub enable_cors: bool,
    pub cors_allowed_origins: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for WebOptions {
    fn default() -> Self {
        Self {
            enable_cors: true,
            cors_allowed_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// 需要调用方身份的 API 路由
fn protected_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/permissions", get(auth::permissions))
        // 患者
        .route("/api/patients", get(patients::list).post(patients::create))
        .route("/api/patients/search", get(patients::search))
        .route("/api/patients/stats", get(patients::stats))
        .route(
            "/api/patients/:id",
            get(patients::get).put(patients::update).delete(patients::delete),
        )
        .route("/api/patients/:id/status", put(patients::change_status))
        .route("/api/patients/:id/clinical-history", get(patients::clinical_history))
        // 预算
        .route("/api/budgets", get(budgets::list).post(budgets::create))
        .route("/api/budgets/search", get(budgets::search))
        .route("/api/budgets/stats", get(budgets::stats))
        .route("/api/budgets/pipeline", get(budgets::pipeline))
        .route("/api/budgets/pipeline/stats", get(budgets::pipeline_stats))
        .route("/api/budgets/patient/:patient_id", get(budgets::by_patient))
        .route(
            "/api/budgets/:id",
            get(budgets::get).put(budgets::update).delete(budgets::delete),
        )
        .route("/api/budgets/:id/status", put(budgets::change_status))
        .route("/api/budgets/:id/communication", post(budgets::add_communication))
        // 收款
        .route("/api/payments", get(payments::list).post(payments::create))
        .route("/api/payments/search", get(payments::search))
        .route("/api/payments/stats", get(payments::stats))
        .route("/api/payments/patient/:patient_id", get(payments::by_patient))
        .route(
            "/api/payments/:id",
            get(payments::get).put(payments::update).delete(payments::delete),
        )
        .route("/api/payments/:id/status", put(payments::change_status))
        .route("/api/payments/:id/reconcile", post(payments::reconcile))
        // 支付链接
        .route("/api/payment-links", get(payment_links::list).post(payment_links::create))
        .route("/api/payment-links/search", get(payment_links::search))
        .route("/api/payment-links/stats", get(payment_links::stats))
        .route("/api/payment-links/patient/:patient_id", get(payment_links::by_patient))
        .route(
            "/api/payment-links/:id",
            get(payment_links::get)
                .put(payment_links::update)
                .delete(payment_links::delete),
        )
        .route("/api/payment-links/:id/status", put(payment_links::change_status))
        .route("/api/payment-links/:id/cancel", post(payment_links::cancel))
        .route("/api/payment-links/:id/renew", post(payment_links::renew))
        .route("/api/payment-links/:id/pay", post(payment_links::pay))
        // 退款
        .route("/api/refunds", get(refunds::list).post(refunds::create))
        .route("/api/refunds/search", get(refunds::search))
        .route("/api/refunds/stats", get(refunds::stats))
        .route("/api/refunds/patient/:patient_id", get(refunds::by_patient))
        .route(
            "/api/refunds/:id",
            get(refunds::get).put(refunds::update).delete(refunds::delete),
        )
        .route("/api/refunds/:id/status", put(refunds::change_status))
        .route_layer(axum::middleware::from_fn(require_permission))
}

/// 无需身份的路由：健康检查与患者使用的公开支付链接
fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/payment-links/public/:token", get(payment_links::public_get))
        .route(
            "/api/payment-links/public/:token/attempt",
            post(payment_links::public_attempt),
        )
}

fn cors_layer(options: &WebOptions) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if options.cors_allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = options
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

/// 组装完整的应用路由
pub fn create_app(state: AppState, options: &WebOptions) -> Router {
    let app = protected_routes()
        .merge(public_routes())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(options.request_timeout)),
        );

    if options.enable_cors {
        app.layer(cors_layer(options))
    } else {
        app
    }
}

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, app: Router) -> Self {
        Self { addr, app }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start web server: {}", e))?;

        info!("Web server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
