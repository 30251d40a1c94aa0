use log::warn;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse, Responder, Route, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::backend::LineBackend;
use crate::config::LineMode;
use crate::error::AppError;
use crate::line::{LineHandle, LineManager, LineOptions};
use crate::monitor::{EdgeEvent, MonitorOptions};

pub struct AppState<B: LineBackend> {
    pub manager: Arc<LineManager<B>>,
}

impl<B: LineBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

#[derive(Deserialize)]
struct AllocatePayload {
    mode: LineMode,
    #[serde(flatten)]
    options: LineOptions,
}

#[derive(Deserialize)]
struct MonitorPayload {
    edge: String,
    #[serde(default)]
    debounce_ms: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DutyPayload {
    Percent { percent: f64 },
    Nanos { nanos: u64 },
}

#[derive(Serialize)]
struct DutyResponse {
    duty_ns: u64,
}

#[derive(Deserialize, Default)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ValueQuery {
    duration_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct StreamQuery {
    line: Option<u32>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
    line_filter: Option<u32>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if line_filter.is_some_and(|l| l != event.line) {
                            continue;
                        }
                        if let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = json!({ "error": format!("Event stream lagged by {n} messages") });
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn only(methods: &[Method]) -> Route {
    web::route()
        .guard(guard_not_methods(methods))
        .to(method_not_allowed)
}

impl<B: LineBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/lines")
                    .route(web::get().to(list_lines::<B>))
                    .route(only(&[Method::GET])),
            )
            .service(
                web::resource("/lines/events")
                    .route(web::get().to(events_ws::<B>))
                    .route(only(&[Method::GET])),
            )
            .service(
                web::resource("/system")
                    .route(web::get().to(system_report::<B>))
                    .route(only(&[Method::GET])),
            )
            .service(
                web::resource("/line/{line_id}")
                    .route(web::get().to(line_descriptor::<B>))
                    .route(web::post().to(allocate_line::<B>))
                    .route(web::delete().to(close_line::<B>))
                    .route(only(&[Method::GET, Method::POST, Method::DELETE])),
            )
            .service(
                web::resource("/line/{line_id}/config")
                    .route(web::get().to(line_config::<B>))
                    .route(only(&[Method::GET])),
            )
            .service(
                web::resource("/line/{line_id}/value")
                    .route(web::get().to(get_value::<B>))
                    .route(web::post().to(set_value::<B>))
                    .route(only(&[Method::GET, Method::POST])),
            )
            .service(
                web::resource("/line/{line_id}/monitor")
                    .route(web::post().to(set_monitor::<B>))
                    .route(only(&[Method::POST])),
            )
            .service(
                web::resource("/line/{line_id}/duty")
                    .route(web::post().to(set_duty::<B>))
                    .route(only(&[Method::POST])),
            )
            .service(
                web::resource("/line/{line_id}/event")
                    .route(web::get().to(get_last_event::<B>))
                    .route(only(&[Method::GET])),
            )
            .service(
                web::resource("/line/{line_id}/events")
                    .route(web::get().to(get_events::<B>))
                    .route(only(&[Method::GET])),
            )
    }
}

async fn list_lines<B: LineBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.list()))
}

async fn system_report<B: LineBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.manager.system_report()))
}

async fn line_descriptor<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let desc = state.manager.descriptor(line_id)?;

    Ok(web::Json(desc))
}

async fn allocate_line<B: LineBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let payload: AllocatePayload = parse_json(&body, "allocation")?;

    let handle = state
        .manager
        .allocate(line_id, payload.mode, payload.options)
        .await?;

    Ok(HttpResponse::Created().json(handle))
}

async fn close_line<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let handle = current_handle(&req, &state, "close")?;
    state.manager.close(handle).await?;

    Ok(HttpResponse::NoContent())
}

async fn line_config<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let config = state.manager.line_config(line_id)?;

    Ok(web::Json(json!({ "line": line_id, "config": config })))
}

async fn get_value<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let handle = current_handle(&req, &state, "read")?;
    let value = state.manager.read(handle).await?;

    Ok(web::Json(value))
}

async fn set_value<B: LineBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    query: web::Query<ValueQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let handle = current_handle(&req, &state, "write")?;
    let value = parse_value_payload(&body)?;

    match query.duration_ms {
        Some(ms) => {
            state
                .manager
                .write_for(handle, value, Duration::from_millis(ms))
                .await?
        }
        None => state.manager.write(handle, value).await?,
    }

    Ok(HttpResponse::Ok())
}

async fn set_monitor<B: LineBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let handle = current_handle(&req, &state, "monitor")?;
    let payload: MonitorPayload = parse_json(&body, "monitor")?;

    state
        .manager
        .monitor(
            handle,
            &payload.edge,
            None,
            MonitorOptions {
                debounce_ms: payload.debounce_ms,
            },
        )
        .await?;

    Ok(web::Json(state.manager.descriptor(handle.line)?))
}

async fn set_duty<B: LineBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let handle = current_handle(&req, &state, "set duty")?;
    let payload: DutyPayload = parse_json(&body, "duty")?;

    let duty_ns = match payload {
        DutyPayload::Percent { percent } => state.manager.set_duty(handle, percent).await?,
        DutyPayload::Nanos { nanos } => state.manager.set_duty_nanos(handle, nanos).await?,
    };

    Ok(web::Json(DutyResponse { duty_ns }))
}

async fn get_last_event<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    state.manager.descriptor(line_id)?;

    match state.manager.events().last(line_id) {
        Some(event) => Ok(HttpResponse::Ok().json(event)),
        None => Ok(HttpResponse::Ok().finish()),
    }
}

async fn get_events<B: LineBackend + 'static>(
    req: HttpRequest,
    query: web::Query<EventsQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    state.manager.descriptor(line_id)?;

    Ok(web::Json(state.manager.events().history(line_id, query.limit)))
}

async fn events_ws<B: LineBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<StreamQuery>,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let rx = state.manager.events().subscribe();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::BadRequest(format!("Websocket error: {e}")))?;

    let line_filter = query.line;
    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx, line_filter).await;
    });

    Ok(response)
}

/// Handle of the live allocation behind `{line_id}`.
fn current_handle<B: LineBackend + 'static>(
    req: &HttpRequest,
    state: &AppState<B>,
    op: &'static str,
) -> Result<LineHandle, AppError> {
    let line_id = parse_line_id(req)?;
    state.manager.descriptor(line_id)?;

    state
        .manager
        .handle_of(line_id)
        .ok_or(AppError::HandleClosed { line: line_id, op })
}

fn parse_value_payload(body: &[u8]) -> Result<u8, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => text
            .trim()
            .parse::<u8>()
            .map_err(|_| AppError::BadRequest("Value must be an integer".into())),
        _ => Err(AppError::BadRequest(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a [u8], what: &str) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest(format!("Empty {what} payload")));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid {what} payload: {e}")))
}

fn parse_line_id(req: &HttpRequest) -> Result<u32, AppError> {
    let line_id = req
        .match_info()
        .get("line_id")
        .ok_or_else(|| AppError::BadRequest("Missing line id".into()))?;
    let line_id = line_id
        .parse::<u32>()
        .map_err(|_| AppError::BadRequest("Invalid line id".into()))?;

    Ok(line_id)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
