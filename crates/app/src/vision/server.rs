//! Actix Web server exposing the MJPEG feed and the JSON status endpoints.
//!
//! The server runs on a dedicated thread so the capture and inference threads
//! never touch the Actix runtime. Handlers only read the shared slots; each
//! MJPEG connection is an independent stream task that ends when the client
//! goes away or the frame slot is closed.

use std::{io, sync::Arc, thread::JoinHandle, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    middleware::DefaultHeaders,
    rt::time::timeout,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::vision::{
    config::ConfigSummary,
    data::{DetectionSlot, DetectionsResponse, FrameSlot, HistoryResponse},
    encoding::{MJPEG_BOUNDARY, multipart_chunk, render_frame},
    health::Health,
    telemetry,
};

/// Per-connection MJPEG settings.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StreamSettings {
    pub(crate) jpeg_quality: u8,
    /// Send the placeholder when no new frame arrives within this window.
    pub(crate) frame_timeout: Duration,
}

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) frames: Arc<FrameSlot>,
    pub(crate) detections: Arc<DetectionSlot>,
    pub(crate) health: Arc<Health>,
    pub(crate) stream: StreamSettings,
    pub(crate) config: ConfigSummary,
    /// Pre-encoded "CAMERA UNAVAILABLE" JPEG.
    pub(crate) placeholder: Bytes,
    pub(crate) metrics: Option<PrometheusHandle>,
}

#[derive(Default)]
/// Handle for the HTTP server thread.
pub(crate) struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/video_feed", web::get().to(video_feed))
        .route("/api/detections", web::get().to(detections_handler))
        .route("/api/detections/history", web::get().to(history_handler))
        .route("/api/status", web::get().to(status_handler))
        .route("/health", web::get().to(health_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

/// The dashboard is served from another origin.
pub(crate) fn cors_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
}

/// Bind `bind_address:port` and serve on a dedicated thread. Returns once the
/// listener is bound, or with the bind error.
pub(crate) fn spawn_server(bind_address: String, port: u16, state: ServerState) -> Result<ApiServer> {
    let state = web::Data::new(state);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<io::Result<()>>(1);
    let address = format!("{bind_address}:{port}");

    let handle = telemetry::spawn_thread("http-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(state.clone())
                    .wrap(cors_headers())
                    .configure(configure)
            })
            .shutdown_timeout(2)
            .bind((bind_address.as_str(), port));
            let server = match bound {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("failed to spawn HTTP server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("HTTP server listening on http://{address}");
            Ok(ApiServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).with_context(|| format!("failed to bind HTTP server to {address}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("HTTP server thread exited before binding {address}"))
        }
    }
}

/// Tracks one MJPEG client for the lifetime of its response stream.
struct StreamGuard {
    health: Arc<Health>,
}

impl StreamGuard {
    fn open(health: Arc<Health>) -> Self {
        let clients = health.stream_opened();
        metrics::gauge!("stream_clients").set(clients as f64);
        debug!("stream client connected ({clients} active)");
        Self { health }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let clients = self.health.stream_closed();
        metrics::gauge!("stream_clients").set(clients as f64);
        debug!("stream client disconnected ({clients} active)");
    }
}

/// Stream annotated frames as `multipart/x-mixed-replace`.
async fn video_feed(state: web::Data<ServerState>) -> HttpResponse {
    let mut updates = state.frames.subscribe();
    let guard = StreamGuard::open(state.health.clone());
    let body = stream! {
        let _guard = guard;
        let mut last_sent = 0u64;
        loop {
            if state.frames.is_closed() {
                break;
            }
            let fresh = state.frames.latest().filter(|frame| frame.sequence > last_sent);
            let frame = match fresh {
                Some(frame) => Some(frame),
                None => match timeout(state.stream.frame_timeout, updates.changed()).await {
                    Ok(Ok(())) => {
                        // Woken by a frame this client already sent, or by close.
                        match state.frames.latest().filter(|frame| frame.sequence > last_sent) {
                            Some(frame) => Some(frame),
                            None => continue,
                        }
                    }
                    Ok(Err(_)) => break,
                    // A slow but healthy camera is waited on, not papered over.
                    Err(_) if state.health.camera_ok() => continue,
                    Err(_) => None,
                },
            };
            if state.frames.is_closed() {
                break;
            }

            let chunk = match frame {
                Some(frame) if state.health.camera_ok() => {
                    last_sent = frame.sequence;
                    let sequence = frame.sequence;
                    let detections = state.detections.latest();
                    let fps = state.health.fps();
                    let quality = state.stream.jpeg_quality;
                    match web::block(move || render_frame(&frame, &detections, fps, quality)).await {
                        Ok(Ok(jpeg)) => multipart_chunk(&jpeg, sequence),
                        Ok(Err(err)) => {
                            warn!("failed to render frame #{sequence}: {err:#}");
                            multipart_chunk(&state.placeholder, sequence)
                        }
                        Err(err) => {
                            warn!("encoder pool unavailable: {err}");
                            multipart_chunk(&state.placeholder, sequence)
                        }
                    }
                }
                Some(frame) => {
                    last_sent = frame.sequence;
                    multipart_chunk(&state.placeholder, frame.sequence)
                }
                None => multipart_chunk(&state.placeholder, last_sent),
            };
            metrics::counter!("stream_chunks_total").increment(1);
            yield Ok::<Bytes, actix_web::Error>(chunk);
        }
    };

    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
        .append_header((
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
        ))
        .streaming(body)
}

/// Latest detection set as JSON.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    let set = state.detections.latest();
    HttpResponse::Ok().json(DetectionsResponse {
        ok: true,
        timestamp: set.timestamp_ms,
        sequence: set.sequence,
        count: set.detections.len(),
        fps: (state.health.fps() * 10.0).round() / 10.0,
        detections: &set.detections,
    })
}

async fn history_handler(state: web::Data<ServerState>) -> HttpResponse {
    let history = state.detections.history();
    HttpResponse::Ok().json(HistoryResponse {
        ok: true,
        count: history.len(),
        history: &history,
    })
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.health.snapshot(&state.config))
}

async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_handler(state: web::Data<ServerState>) -> HttpResponse {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
