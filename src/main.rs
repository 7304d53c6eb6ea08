use refract::health;
use refract::ingress::MessagesRequest;
use refract::logging::{self, turn_id_middleware};
use refract::main_helper::ProxyConfig;
use refract::projections::{Projection, UpstreamAdapter};
use refract::specs::openai::ChatResponse;
use refract::streaming::{StreamHandler, StreamOptions};
use refract::*;

use axum::response::sse::KeepAlive;
use axum::{
    extract::{DefaultBodyLimit, State},
    http as ax_http, middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::Instrument;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "refract=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "refract.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Stdout is reserved for the readiness handshake; logs go to stderr and
    // the rolling file.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    let config = match ProxyConfig::from_env(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let sink: Option<Arc<dyn debug_utils::TransformSink>> = if args.enable_debug_capture {
        Some(Arc::new(debug_utils::FileSink::new("debug_capture")))
    } else {
        None
    };

    let state = Arc::new(AppState {
        client,
        config: Arc::new(config),
        args: args.clone(),
        sink,
    });

    let app = Router::new()
        .route("/", post(messages_handler))
        .route("/*path", post(messages_handler))
        .route("/health", get(health::liveness))
        .layer(DefaultBodyLimit::max(args.max_body_size))
        .layer(middleware::from_fn(turn_id_middleware))
        .with_state(state);

    let addr: std::net::SocketAddr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Invalid listen address: {}", e);
            std::process::exit(1);
        }
    };

    let socket = match if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()
    } else {
        tokio::net::TcpSocket::new_v6()
    } {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to create socket: {}", e);
            std::process::exit(1);
        }
    };
    // Disable Nagle so each SSE event is flushed to the agent immediately.
    if let Err(e) = socket.set_nodelay(true) {
        tracing::warn!("could not disable Nagle on the listener: {}", e);
    }
    if let Err(e) = socket.bind(addr) {
        eprintln!("Failed to bind to {}: {}", addr, e);
        std::process::exit(1);
    }
    let listener = match socket.listen(1024) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to listen on {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Failed to read listener address: {}", e);
            std::process::exit(1);
        }
    };

    // The one contract external launchers may rely on.
    println!("PROXY_READY:{}", local_addr.port());
    let _ = std::io::stdout().flush();

    tracing::info!("refract listening on {}", local_addr);

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {}", e);
    }
}

#[tracing::instrument(
    name = "proxy.request",
    skip_all,
    fields(request_id = tracing::field::Empty, model.advertised = tracing::field::Empty)
)]
async fn messages_handler(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Response {
    let span = tracing::Span::current();

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(
                ax_http::StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("malformed JSON body: {}", e),
            )
        }
    };
    let request: MessagesRequest = match serde_json::from_value(raw.clone()) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                ax_http::StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("payload deserialization failed: {}", e),
            )
        }
    };
    if let Err(e) = request.validate() {
        tracing::error!("[🖱️ ] Validation failed: {}", e);
        return e.into_response();
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    span.record("request_id", &request_id);
    span.record("model.advertised", &request.model);

    logging::log_request_summary(&request);

    let projection = UpstreamAdapter::project(&raw, &request, &state.config, state.sink.as_deref());
    if let Some(reason) = &projection.error {
        tracing::warn!("forwarding untransformed request: {}", reason);
    }

    let start_time = std::time::Instant::now();

    if projection.stream {
        match stream_upstream(&state, &projection).await {
            Ok(response) => {
                return stream_response(&state, response, request.model.clone(), request_id, start_time)
            }
            Err(e) => {
                // No bytes have reached the caller yet; one buffered retry.
                tracing::warn!(
                    "streaming attempt failed before response start, falling back to buffered mode: {}",
                    e
                );
            }
        }
    }

    buffered_turn(&state, &projection, &request.model).await
}

fn error_response(status: ax_http::StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "type": "error",
            "error": { "type": error_type, "message": message },
        })),
    )
        .into_response()
}

async fn send_upstream(state: &Arc<AppState>, body: &serde_json::Value) -> Result<reqwest::Response> {
    let response = state
        .client
        .post(&state.config.endpoint)
        .header(
            ax_http::header::AUTHORIZATION,
            state.config.authorization_value(),
        )
        .json(body)
        .send()
        .await
        .map_err(RefractError::Network)?;

    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "unreadable upstream error body".to_string());
        // Classification works from the failure text; fold the status code in
        // so bare numeric statuses classify too.
        let (mapped, _) = classify_upstream_failure(&format!("{} {}", status.as_u16(), text));
        Err(RefractError::Upstream(mapped, text).into())
    }
}

async fn stream_upstream(state: &Arc<AppState>, projection: &Projection) -> Result<reqwest::Response> {
    let mut body = projection.body.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream".to_string(), serde_json::Value::Bool(true));
    }
    send_upstream(state, &body).await
}

fn stream_response(
    state: &Arc<AppState>,
    response: reqwest::Response,
    model: String,
    request_id: String,
    start_time: std::time::Instant,
) -> Response {
    let bytes_stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    let lines_stream = FramedRead::new(
        tokio_util::io::StreamReader::new(bytes_stream),
        LinesCodec::new_with_max_length(constants::MAX_LINE_BYTES),
    );

    let (tx, rx) = mpsc::channel(100);
    let options = StreamOptions {
        loop_window: state.args.loop_window,
    };

    tokio::spawn(async move {
        let stream_span = tracing::info_span!(
            "stream",
            rid = %str_utils::prefix_chars(&request_id, 8),
            model = %model
        );
        StreamHandler::handle_stream(lines_stream, tx, options, model, request_id, start_time)
            .instrument(stream_span)
            .await;
    });

    let mut response = Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        ax_http::header::CACHE_CONTROL,
        ax_http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        ax_http::header::CONNECTION,
        ax_http::HeaderValue::from_static("keep-alive"),
    );
    // Tell intermediary proxies not to buffer the event stream.
    headers.insert(
        ax_http::HeaderName::from_static("x-accel-buffering"),
        ax_http::HeaderValue::from_static("no"),
    );
    response
}

async fn buffered_turn(
    state: &Arc<AppState>,
    projection: &Projection,
    advertised_model: &str,
) -> Response {
    let mut body = projection.body.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream".to_string(), serde_json::Value::Bool(false));
    }

    let response = match send_upstream(state, &body).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[☁️ ] Upstream request failed: {}", e);
            return e.into_response();
        }
    };

    let chat: ChatResponse = match response.json().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("[☁️ ] Upstream response unreadable: {}", e);
            return ObservedError::from(RefractError::Network(e)).into_response();
        }
    };

    let projected = UpstreamAdapter::project_response(chat, advertised_model);
    if let Some(sink) = state.sink.as_deref() {
        if let Ok(value) = serde_json::to_value(&projected) {
            sink.capture("final", &value);
        }
    }

    Json(projected).into_response()
}
