//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers::{self, auth, events, files, shares, uploads, users};
use crate::metrics::metrics_handler;
use crate::ratelimit::{ip_rate_limit_middleware, user_rate_limit_middleware};
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Slack above the part size for multipart framing and headers.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let part_limit = usize::try_from(state.config.uploads.max_part_size)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    let auth_routes = Router::new()
        .route("/api/auth/login", post(auth::login_handler))
        .route("/api/auth/logout", post(auth::logout_handler))
        .route("/api/auth/session", get(auth::session_handler))
        .route("/api/auth/ws", get(auth::ws_handler));

    let file_routes = Router::new()
        .route(
            "/api/files",
            get(files::list_files).post(files::create_file),
        )
        .route(
            "/api/files/{id}",
            get(files::get_file).patch(files::update_file),
        )
        .route("/api/files/move", post(files::move_files))
        .route("/api/files/delete", post(files::delete_files))
        .route("/api/files/copy", post(files::copy_file))
        .route("/api/files/directories", post(files::make_directory))
        .route("/api/files/directories/move", post(files::move_directory))
        .route(
            "/api/files/{id}/stream/{name}",
            get(files::stream_file).head(files::stream_file),
        )
        .route(
            "/api/files/{id}/share",
            get(shares::get_share)
                .post(shares::create_share)
                .patch(shares::update_share)
                .delete(shares::delete_share),
        );

    let share_routes = Router::new()
        .route("/api/shares/{id}", get(shares::share_info))
        .route("/api/shares/{id}/files", get(shares::share_files))
        .route(
            "/api/shares/{id}/files/{file_id}/stream/{name}",
            get(shares::share_stream).head(shares::share_stream),
        );

    let upload_routes = Router::new()
        .route("/api/uploads/parts", post(uploads::create_part))
        .route("/api/uploads/stats", get(uploads::upload_stats))
        .route(
            "/api/uploads/{id}",
            get(uploads::get_parts)
                .post(uploads::upload_part)
                .delete(uploads::delete_upload),
        )
        .layer(DefaultBodyLimit::max(part_limit));

    let user_routes = Router::new()
        .route("/api/users/stats", get(users::stats))
        .route(
            "/api/users/bots",
            get(users::list_bots)
                .post(users::add_bots)
                .delete(users::delete_bots),
        )
        .route(
            "/api/users/channels",
            get(users::list_channels).patch(users::update_channel),
        )
        .route("/api/users/profile", get(users::profile));

    let event_routes = Router::new()
        .route("/api/events", get(events::recent_events))
        .route("/api/events/stream", get(events::event_stream));

    let mut router = Router::new()
        // Unauthenticated for load balancer probes
        .route("/api/health", get(handlers::health_check))
        .merge(auth_routes)
        .merge(file_routes)
        .merge(share_routes)
        .merge(upload_routes)
        .merge(user_routes)
        .merge(event_routes);

    // When enabled, /metrics must be network-restricted to the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let rate_limit_state = state.rate_limit.clone();

    // Order of execution: CatchPanic -> Trace -> IP rate limit -> Auth -> User rate limit -> Handler
    router
        .layer(middleware::from_fn_with_state(
            rate_limit_state.clone(),
            user_rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            rate_limit_state,
            ip_rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}
