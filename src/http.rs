//! HTTP surface: static file serving, the live WebSocket endpoint, and the
//! bulk download routes, all under a single no-cache header layer (spec §7,
//! grounded on the original static server's header set).

use std::sync::Arc;

use axum::http::{header, HeaderValue};
use axum::routing::get;
use axum::Router;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::Config;
use crate::datastore::DataStore;
use crate::download::{self, DownloadState};
use crate::ws::{self, WsState};

pub fn router(config: Arc<Config>, datastore: Arc<DataStore>) -> Router {
    let ws_state = WsState {
        datastore,
        subscriber_queue_capacity: config.subscriber_queue_capacity,
    };
    let download_state = DownloadState {
        config: config.clone(),
    };

    let ws_router = Router::new().route("/ws", get(ws::handler)).with_state(ws_state);
    let download_router = Router::new()
        .route("/download/{filename}", get(download::handler))
        .with_state(download_state);

    let mut router = ws_router.merge(download_router);

    if let Some(static_root) = &config.static_root {
        router = router.fallback_service(ServeDir::new(static_root));
    }

    router
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::PRAGMA,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::EXPIRES,
            HeaderValue::from_static("0"),
        ))
}
