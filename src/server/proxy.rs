//! Reverse-proxy forwarding for configured path rules
//!
//! Plain HTTP is forwarded with reqwest and streamed back. WebSocket upgrades
//! on rules with `ws` enabled are accepted locally and bridged frame by frame
//! to the target with tokio-tungstenite.

use axum::{
    body::Body,
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, protocol::frame::coding::CloseCode,
};

use crate::config::ProxyRule;

/// Headers that only make sense for a single hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Ordered set of proxy rules plus the shared HTTP client
pub struct ProxyForwarder {
    rules: Vec<ProxyRule>,
    client: reqwest::Client,
}

impl ProxyForwarder {
    pub fn new(mut rules: Vec<ProxyRule>) -> Self {
        // Longest prefix wins
        rules.sort_by(|a, b| b.path.len().cmp(&a.path.len()));

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build proxy client, using defaults: {}", e);
                reqwest::Client::new()
            });

        Self { rules, client }
    }

    pub fn rules(&self) -> &[ProxyRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Find the rule that owns a request path
    pub fn match_rule(&self, path: &str) -> Option<&ProxyRule> {
        self.rules.iter().find(|rule| rule.matches(path))
    }

    /// Forward a request (HTTP or WebSocket upgrade) according to `rule`
    pub async fn forward(
        &self,
        rule: &ProxyRule,
        ws: Option<WebSocketUpgrade>,
        req: Request<Body>,
    ) -> Response {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        match ws {
            Some(ws) if rule.ws => {
                let protocols = requested_protocols(req.headers());
                let url = websocket_target_url(&rule.target, &path_and_query);
                log::debug!("Proxying WebSocket {} -> {}", path_and_query, url);
                forward_websocket(ws, url, protocols)
            }
            _ => self.forward_http(rule, &path_and_query, req).await,
        }
    }

    async fn forward_http(
        &self,
        rule: &ProxyRule,
        path_and_query: &str,
        req: Request<Body>,
    ) -> Response {
        let url = format!("{}{}", rule.target, path_and_query);
        log::debug!("Proxying {} {} -> {}", req.method(), path_and_query, url);

        let (parts, body) = req.into_parts();
        let headers = outbound_headers(&parts.headers, &rule.target);

        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to read request body for proxy: {}", e);
                return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
            }
        };

        let mut builder = self.client.request(parts.method, &url).headers(headers);
        if !body_bytes.is_empty() {
            builder = builder.body(body_bytes);
        }

        let upstream = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("Proxy target {} unreachable: {}", url, e);
                return (
                    StatusCode::BAD_GATEWAY,
                    format!("Proxy target unreachable: {}", rule.target),
                )
                    .into_response();
            }
        };

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                response_headers.append(name.clone(), value.clone());
            }
        }

        // Stream the body back (important for SSE)
        let body = Body::from_stream(upstream.bytes_stream());
        (status, response_headers, body).into_response()
    }
}

/// Request headers for the upstream hop: origin rewritten to the target,
/// host left for the client to fill from the URL
fn outbound_headers(incoming: &HeaderMap, target: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if name == header::HOST || name == header::CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if headers.contains_key(header::ORIGIN) {
        if let Some(origin) = target_origin(target) {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                headers.insert(header::ORIGIN, value);
            }
        }
    }
    headers
}

/// `scheme://host[:port]` of a target URL
pub fn target_origin(target: &str) -> Option<String> {
    let url = url::Url::parse(target).ok()?;
    let origin = url.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}

/// Target URL for a WebSocket upgrade (http -> ws, https -> wss)
pub fn websocket_target_url(target: &str, path_and_query: &str) -> String {
    let base = if let Some(rest) = target.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = target.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        target.to_string()
    };
    format!("{}{}", base, path_and_query)
}

/// Sub-protocols offered by the browser (e.g. `vite-hmr`)
fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn forward_websocket(ws: WebSocketUpgrade, url: String, protocols: Vec<String>) -> Response {
    let ws = if protocols.is_empty() {
        ws
    } else {
        ws.protocols(protocols.clone())
    };
    ws.on_upgrade(move |client| bridge_websocket(client, url, protocols))
        .into_response()
}

async fn bridge_websocket(client: WebSocket, url: String, protocols: Vec<String>) {
    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Invalid WebSocket proxy target {}: {}", url, e);
            return;
        }
    };
    if !protocols.is_empty() {
        if let Ok(value) = protocols.join(", ").parse() {
            request
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    let upstream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            log::warn!("Failed to connect WebSocket proxy target {}: {}", url, e);
            return;
        }
    };

    log::debug!("WebSocket tunnel established to {}", url);

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, Message::Close(_));
            if upstream_tx.send(to_tungstenite(msg)).await.is_err() || closing {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = from_tungstenite(msg) else {
                continue;
            };
            let closing = matches!(msg, Message::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    log::debug!("WebSocket tunnel to {} closed", url);
}

fn to_tungstenite(msg: Message) -> tungstenite::Message {
    match msg {
        Message::Text(text) => tungstenite::Message::Text(text),
        Message::Binary(data) => tungstenite::Message::Binary(data),
        Message::Ping(data) => tungstenite::Message::Ping(data),
        Message::Pong(data) => tungstenite::Message::Pong(data),
        Message::Close(frame) => {
            tungstenite::Message::Close(frame.map(|f| tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason,
            }))
        }
    }
}

fn from_tungstenite(msg: tungstenite::Message) -> Option<Message> {
    match msg {
        tungstenite::Message::Text(text) => Some(Message::Text(text)),
        tungstenite::Message::Binary(data) => Some(Message::Binary(data)),
        tungstenite::Message::Ping(data) => Some(Message::Ping(data)),
        tungstenite::Message::Pong(data) => Some(Message::Pong(data)),
        tungstenite::Message::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        tungstenite::Message::Frame(_) => None,
    }
}
