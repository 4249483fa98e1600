use std::fmt::Write as _;

use axum::body::Body;
use axum::extract::{Extension, Path as AxumPath};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use serde::Serialize;

use crate::app_state::AppState;
use crate::mjpeg::{self, MjpegMultiplexer};

/// Landing page: the configured title plus one `<img>` per camera in the
/// two-column grid.
#[axum::debug_handler]
pub(crate) async fn index(Extension(state): Extension<AppState>) -> Html<String> {
    let prefix = &state.path_prefix;
    let mut cells = String::new();
    for camera in state.registry.cameras() {
        let index = camera.index();
        let _ = writeln!(
            cells,
            r#"    <figure><img src="{prefix}/camera/{index}" alt="camera {index}"></figure>"#
        );
    }

    Html(format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head>\n\
           <meta charset=\"utf-8\">\n\
           <title>{title}</title>\n\
           <style>\n\
             body {{ background: #111; color: #eee; font-family: sans-serif; margin: 1rem; }}\n\
             main {{ display: grid; grid-template-columns: repeat(2, 1fr); gap: 0.5rem; }}\n\
             figure {{ margin: 0; }}\n\
             img {{ width: 100%; }}\n\
           </style>\n\
         </head>\n\
         <body>\n\
           <h1>{title}</h1>\n\
           <main>\n{cells}  </main>\n\
         </body>\n\
         </html>\n",
        title = state.title,
    ))
}

/// `GET {prefix}/camera/{index}` for any index, configured or not.
#[axum::debug_handler]
pub(crate) async fn stream_camera(
    Extension(state): Extension<AppState>,
    AxumPath(index): AxumPath<usize>,
) -> Response {
    mjpeg_response(state, index)
}

/// 200 with an unending multipart body when the camera is configured,
/// 204 No Content otherwise.
pub(crate) fn mjpeg_response(state: AppState, index: usize) -> Response {
    let Some(camera) = state.registry.get(index) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let mux = MjpegMultiplexer::new(camera.slot().watch(), state.jpeg_quality);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mjpeg::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(mux.into_stream()))
        .unwrap()
}

#[derive(Serialize)]
pub(crate) struct CameraStatus {
    index: usize,
    url: String,
    width: Option<u32>,
    height: Option<u32>,
    frames: u64,
    live: bool,
}

/// Per-camera ingestion state; URLs are credential-redacted.
#[axum::debug_handler]
pub(crate) async fn status(Extension(state): Extension<AppState>) -> Json<Vec<CameraStatus>> {
    let cameras = state
        .registry
        .cameras()
        .iter()
        .map(|camera| {
            let dimensions = camera.dimensions();
            CameraStatus {
                index: camera.index(),
                url: camera.display_url().to_string(),
                width: dimensions.map(|(width, _)| width),
                height: dimensions.map(|(_, height)| height),
                frames: camera.slot().sequence(),
                live: camera.slot().read().is_some(),
            }
        })
        .collect();
    Json(cameras)
}
