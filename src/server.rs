use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, HeaderMap, Method, Request, Response, Server, StatusCode};
use hyper_tungstenite::tungstenite::Message;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::auth::Authenticator;
use crate::directory::UserProfile;
use crate::dispatch::Realtime;

/// Everything a request handler needs. Cheap to clone per request.
#[derive(Clone)]
pub struct AppContext {
    pub realtime: Realtime,
    pub auth: Authenticator,
    pub cors_origin: HeaderValue,
    /// A connection that answers nothing (not even a ping) for this long is closed.
    pub idle_timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    user_id: String,
    online: bool,
    connections: usize,
}

fn decode_path_segment(seg: &str) -> String {
    match urlencoding::decode(seg) {
        Ok(s) => s.into_owned(),
        Err(_) => seg.to_string(),
    }
}

fn text_response(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_string(value) {
        Ok(json) => {
            let mut resp = text_response(status, json);
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to serialize response: {}", e)),
    }
}

fn with_cors(mut resp: Response<Body>, origin: &HeaderValue) -> Response<Body> {
    let headers = resp.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type, Authorization"));
    resp
}

// ============================================
// WebSocket Connection Handler
// ============================================

async fn handle_connection(
    ws: hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
    addr: SocketAddr,
    user: UserProfile,
    ctx: AppContext,
) {
    info!("WebSocket connection established from {} for user {}", addr, user.id);

    let (mut ws_sender, mut ws_receiver) = ws.split();

    // Create channel for sending messages to this WebSocket
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let session = ctx.realtime.connect(user, tx.clone()).await;

    // Liveness: ping every half timeout; any inbound frame (Pong included) counts.
    let mut heartbeat = tokio::time::interval((ctx.idle_timeout / 2).max(Duration::from_millis(10)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    // Handle incoming messages, one at a time and in arrival order
    loop {
        tokio::select! {
            msg_result = ws_receiver.next() => {
                last_seen = Instant::now();
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        ctx.realtime.handle_text(&session, &text).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} closed connection", addr);
                        break;
                    }
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > ctx.idle_timeout {
                    info!("Connection {} silent for {:?}, closing", session.conn_id, ctx.idle_timeout);
                    break;
                }
                let _ = tx.send(Message::Ping(Vec::new()));
            }
            _ = &mut send_task => {
                break;
            }
        }
    }

    // Clean up when connection closes
    ctx.realtime.disconnect(&session).await;
    send_task.abort();
}

// ============================================
// HTTP Handlers
// ============================================

async fn handle_presence_request(
    method: &Method,
    headers: &HeaderMap,
    query: Option<&str>,
    user_id: &str,
    ctx: &AppContext,
) -> Response<Body> {
    if *method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }
    if let Err(e) = ctx.auth.authenticate_handshake(headers, query).await {
        return text_response(StatusCode::UNAUTHORIZED, format!("Authentication failed: {}", e));
    }

    let connections = ctx.realtime.user_connections(user_id).await.len();
    json_response(
        StatusCode::OK,
        &PresenceResponse {
            user_id: user_id.to_string(),
            online: connections > 0,
            connections,
        },
    )
}

async fn handle_request(mut req: Request<Body>, addr: SocketAddr, ctx: AppContext) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();

    // CORS preflight
    if req.method() == Method::OPTIONS {
        let mut resp = with_cors(text_response(StatusCode::NO_CONTENT, Body::empty()), &ctx.cors_origin);
        resp.headers_mut()
            .insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
        return Ok(resp);
    }

    if path == "/health" {
        return Ok(with_cors(text_response(StatusCode::OK, "ok"), &ctx.cors_origin));
    }

    // GET /api/presence/{user_id}
    if let Some(rest) = path.strip_prefix("/api/presence/") {
        let user_id = decode_path_segment(rest.trim_end_matches('/'));
        let resp = if user_id.is_empty() {
            text_response(StatusCode::NOT_FOUND, "API endpoint not found")
        } else {
            handle_presence_request(req.method(), req.headers(), req.uri().query(), &user_id, &ctx).await
        };
        return Ok(with_cors(resp, &ctx.cors_origin));
    }

    // WebSocket upgrade, gated by the access token
    if hyper_tungstenite::is_upgrade_request(&req) {
        let user = match ctx
            .auth
            .authenticate_handshake(req.headers(), req.uri().query())
            .await
        {
            Ok(user) => user,
            Err(e) => {
                warn!("Rejected WebSocket handshake from {}: {}", addr, e);
                return Ok(text_response(
                    StatusCode::UNAUTHORIZED,
                    format!("Authentication failed: {}", e),
                ));
            }
        };

        return match hyper_tungstenite::upgrade(&mut req, None) {
            Ok((response, websocket)) => {
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => handle_connection(ws, addr, user, ctx).await,
                        Err(e) => error!("WebSocket upgrade from {} failed: {}", addr, e),
                    }
                });
                Ok(response)
            }
            Err(e) => {
                error!("WebSocket upgrade error: {}", e);
                Ok(text_response(StatusCode::BAD_REQUEST, "Invalid WebSocket upgrade request"))
            }
        };
    }

    Ok(text_response(
        StatusCode::NOT_FOUND,
        "Not found. Use /health, /api/presence/{userId}, or upgrade to WebSocket.",
    ))
}

/// Binds the HTTP/WebSocket server. Returns the bound address and the server future.
pub fn bind(
    addr: &SocketAddr,
    ctx: AppContext,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>> + Send), hyper::Error> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let ctx = ctx.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, remote, ctx.clone())))
        }
    });

    let server = Server::try_bind(addr)?.serve(make_svc);
    let local = server.local_addr();
    Ok((local, server))
}
