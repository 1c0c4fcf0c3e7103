use crate::error::Error;
use crate::layout::StageProgress;
use crate::orchestrator::{ProviderPipeline, Remote};
use crate::raster::ToolRunner;
use crate::search::BoundingBox;
use crate::tiles::{TileCoordinate, TILE_CONTENT_TYPE};
use axum::{
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

pub struct AppState<P, R> {
    providers: HashMap<String, Arc<ProviderPipeline<P, R>>>,
}

impl<P: Remote, R: ToolRunner> AppState<P, R> {
    pub fn new(pipelines: impl IntoIterator<Item = Arc<ProviderPipeline<P, R>>>) -> Self {
        let providers = pipelines
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self { providers }
    }

    fn provider(&self, name: &str) -> Result<&Arc<ProviderPipeline<P, R>>, Error> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::UnknownProvider(_) => StatusCode::NOT_FOUND,
        Error::RunInProgress(_) => StatusCode::CONFLICT,
        e if e.is_invalid_input() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        error!("Request failed: {e}");
    }
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}

/// 200 for a complete report, 500 with the same body for a partial one.
fn report_response<T: Serialize>(report: T, partial: bool) -> Response {
    let status = if partial {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn get_tile<P: Remote, R: ToolRunner>(
    Extension(state): Extension<Arc<AppState<P, R>>>,
    Path((provider, z, x, y)): Path<(String, String, String, String)>,
) -> Response {
    let pipeline = match state.provider(&provider) {
        Ok(pipeline) => pipeline,
        Err(e) => return error_response(e),
    };
    let coord = match TileCoordinate::parse(&z, &x, &y) {
        Ok(coord) => coord,
        Err(e) => return error_response(e),
    };
    match pipeline.tiles().get_tile(coord).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, TILE_CONTENT_TYPE)], bytes).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LinksParams {
    bbox: Option<String>,
}

pub async fn get_links<P: Remote, R: ToolRunner>(
    Extension(state): Extension<Arc<AppState<P, R>>>,
    Path(provider): Path<String>,
    Query(params): Query<LinksParams>,
) -> Response {
    let pipeline = match state.provider(&provider) {
        Ok(pipeline) => pipeline,
        Err(e) => return error_response(e),
    };
    let bbox = match params.bbox.as_deref().map(BoundingBox::parse).transpose() {
        Ok(bbox) => bbox,
        Err(e) => return error_response(e),
    };
    match pipeline.links(bbox).await {
        Ok(results) => {
            let partial = !results.complete;
            report_response(results, partial)
        }
        Err(e) => error_response(e),
    }
}

pub async fn admin<P: Remote, R: ToolRunner>(
    Extension(state): Extension<Arc<AppState<P, R>>>,
    Path((provider, action)): Path<(String, String)>,
) -> Response {
    let pipeline = match state.provider(&provider) {
        Ok(pipeline) => pipeline,
        Err(e) => return error_response(e),
    };
    info!("{provider}: admin {action} requested");
    match action.as_str() {
        "download" => match pipeline.acquire().await {
            Ok(report) => {
                let partial = report.is_partial();
                report_response(report, partial)
            }
            Err(e) => error_response(e),
        },
        "merge" => match pipeline.process(StageProgress::Merged).await {
            Ok(report) => report_response(report, false),
            Err(e) => error_response(e),
        },
        "tile" => match pipeline.process(StageProgress::Tiled).await {
            Ok(report) => report_response(report, false),
            Err(e) => error_response(e),
        },
        "run" => match pipeline.run().await {
            Ok(report) => {
                let partial = report.is_partial();
                report_response(report, partial)
            }
            Err(e) => error_response(e),
        },
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router<P: Remote, R: ToolRunner + 'static>(state: Arc<AppState<P, R>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/:provider/tiles/:z/:x/:y", get(get_tile::<P, R>))
        .route("/:provider/links", get(get_links::<P, R>))
        .route("/:provider/admin/:action", post(admin::<P, R>))
        .layer(Extension(state))
}

pub async fn serve<P: Remote, R: ToolRunner + 'static>(
    bind: &str,
    state: Arc<AppState<P, R>>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("HTTP server listening on {bind}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
