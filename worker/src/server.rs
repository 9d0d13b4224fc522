//! The worker's request handler: a single-threaded loopback HTTP
//! server.
//!
//! One route, `POST /`, carrying one encoded request per message body.
//! Other methods on `/` get 405 and other paths 404. Bodies above the
//! frame limit are rejected with 413 before they reach the codec.
//! Handling is serialised through a mutex: one request at a time, even
//! though the framework would permit concurrency.

use crate::config::RunSettings;
use actix_web::{web, App, HttpResponse, HttpServer};
use commons::codec::{self, MAX_FRAME_LEN};
use commons::dispatch::{dispatch, Dispatchable, SHUTDOWN_METHOD};
use commons::port::BIND_FAILURE_MARKER;
use commons::prelude_errors::*;
use commons::rpc::{FaultFrame, Response};
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::sync::mpsc;

const OCTET_STREAM: &str = "application/octet-stream";

struct AppState {
    extension: Mutex<Box<dyn Dispatchable>>,
    protocol: u16,
    shutdown: mpsc::Sender<()>,
}

/// Run the server until an orderly shutdown request (or a fatal server
/// error) ends it.
pub fn serve(settings: RunSettings, extension: Box<dyn Dispatchable>) -> Fallible<()> {
    actix_web::rt::System::new().block_on(run(settings, extension))
}

async fn run(settings: RunSettings, extension: Box<dyn Dispatchable>) -> Fallible<()> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let state = web::Data::new(AppState {
        extension: Mutex::new(extension),
        protocol: settings.protocol,
        shutdown: shutdown_tx,
    });

    let server = HttpServer::new({
        let state = state.clone();
        move || {
            App::new()
                .app_data(state.clone())
                .app_data(web::PayloadConfig::new(MAX_FRAME_LEN))
                .service(web::resource("/").route(web::post().to(rpc)))
        }
    })
    .workers(1)
    .shutdown_timeout(1)
    .bind((settings.host, settings.port))
    .with_context(|| format!("{} {}:{}", BIND_FAILURE_MARKER, settings.host, settings.port))?
    .run();

    let handle = server.handle();
    actix_web::rt::spawn(async move {
        if shutdown_rx.recv().await.is_some() {
            info!("shutdown requested; stopping the server");
            handle.stop(true).await;
        }
    });

    info!("serving on {}:{}", settings.host, settings.port);
    server.await.context("server loop failed")?;
    Ok(())
}

async fn rpc(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let response = handle_frame(&state, &body);
    match codec::encode_response(&response, state.protocol) {
        Ok(frame) => HttpResponse::Ok().content_type(OCTET_STREAM).body(frame),
        Err(err) => {
            error!("could not encode a response frame: {}", err);
            HttpResponse::InternalServerError().finish()
        }
    }
}

fn handle_frame(state: &AppState, frame: &[u8]) -> Response {
    let request = match codec::decode_request(frame, state.protocol) {
        Ok(request) => request,
        Err(err) => {
            debug!("refusing an undecodable request frame: {}", err);
            return Response::Fault(FaultFrame::codec(err.to_string()));
        }
    };
    let mut extension = state.extension.lock();
    if request.method == SHUTDOWN_METHOD {
        debug!("request #{} asks for orderly shutdown", request.seq);
        let farewell = extension.before_shutdown();
        let _ = state.shutdown.try_send(());
        return Response::Ok(farewell);
    }
    dispatch(extension.as_mut(), &request)
}
