//! REST and Server-Sent Events surface.
//!
//! Every answer is an envelope `{"status": "success"|"error", "message": ..., "data": ...}`.
//! Bus calls block, so they run on tokio's blocking pool.

use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use warp::{
    http::StatusCode,
    hyper::body::Bytes,
    path::Tail,
    reply::Response,
    sse, Filter, Rejection, Reply,
};

use crate::{
    address::LogicalAddress,
    command::{parse_logical_address, BridgeCommand, RawCommandRequest},
    error::{Error, Result, ValidationError},
    hub::{EventHub, Subscription},
    logs::LogBuffer,
    protocol::PowerStatus,
    session::Session,
    supervisor::SessionSlot,
};

const MAX_BODY: u64 = 16 * 1024;
const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Shared by all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub slot: Arc<SessionSlot>,
    pub hub: EventHub,
    pub logs: LogBuffer,
}

#[derive(Serialize)]
struct Envelope<T> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

/// A successful answer.
struct Success<T> {
    message: String,
    data: Option<T>,
}

impl Success<()> {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }
}

impl<T> Success<T> {
    fn with(message: impl Into<String>, data: T) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

fn envelope<T: Serialize>(status: StatusCode, body: Envelope<T>) -> Response {
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn failure(status: StatusCode, message: String) -> Response {
    envelope::<()>(
        status,
        Envelope {
            status: "error",
            message: Some(message),
            data: None,
        },
    )
}

fn error_reply(err: &Error) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match err {
        Error::ServiceUnavailable => "CEC adapter not available".to_string(),
        other => other.to_string(),
    };
    failure(status, message)
}

fn reply<T: Serialize>(result: Result<Success<T>>) -> std::result::Result<Response, Rejection> {
    Ok(match result {
        Ok(ok) => envelope(
            StatusCode::OK,
            Envelope {
                status: "success",
                message: Some(ok.message),
                data: ok.data,
            },
        ),
        Err(e) => {
            debug!("request failed: {e}");
            error_reply(&e)
        }
    })
}

/// Run `f` on the blocking pool. A panic inside `f` resumes on the caller.
pub(crate) async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(v) => v,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

/// Run a blocking session call, if the bus is ready.
async fn with_session<T, F>(state: &ApiState, f: F) -> Result<T>
where
    F: FnOnce(&Session) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let session = state.slot.get()?;
    blocking(move || f(&session)).await
}

async fn run(state: &ApiState, command: std::result::Result<BridgeCommand, ValidationError>) -> Result<Success<()>> {
    let session = state.slot.get()?;
    let command = command?;
    let message = blocking(move || command.execute(&session)).await?;
    Ok(Success::message(message))
}

fn optional_address(tail: &Tail) -> std::result::Result<Option<LogicalAddress>, ValidationError> {
    match tail.as_str() {
        "" => Ok(None),
        s => parse_logical_address(s).map(Some),
    }
}

#[derive(Debug, Default, Deserialize)]
struct DevicesQuery {
    rescan: Option<String>,
}

impl DevicesQuery {
    fn force_rescan(&self) -> bool {
        self.rescan
            .as_deref()
            .map_or(false, |r| r == "1" || r.eq_ignore_ascii_case("true"))
    }
}

#[derive(Serialize)]
struct Health {
    version: &'static str,
    engine: String,
    cec_ready: bool,
}

#[derive(Serialize)]
struct AddressStatus {
    address: LogicalAddress,
    status: PowerStatus,
}

#[derive(Serialize)]
struct NamedAddress {
    address: LogicalAddress,
    name: &'static str,
}

async fn health(state: ApiState) -> std::result::Result<Response, Rejection> {
    let engine = with_session(&state, |s| Ok(s.engine_info())).await.unwrap_or_default();
    reply(Ok(Success::with(
        "Service is healthy",
        Health {
            version: env!("CARGO_PKG_VERSION"),
            engine,
            cec_ready: state.slot.is_ready(),
        },
    )))
}

async fn recent_logs(state: ApiState) -> std::result::Result<Response, Rejection> {
    reply(Ok(Success::with("Logs retrieved", state.logs.recent())))
}

async fn list_devices(state: ApiState, query: DevicesQuery) -> std::result::Result<Response, Rejection> {
    let force = query.force_rescan();
    reply(
        with_session(&state, move |s| s.list_devices(force))
            .await
            .map(|listing| Success::with(listing.message(), listing.devices)),
    )
}

async fn device_info(state: ApiState, address: String) -> std::result::Result<Response, Rejection> {
    reply(
        async {
            let session = state.slot.get()?;
            let address = parse_logical_address(&address)?;
            let device = blocking(move || session.get_device_info(address)).await?;
            Ok::<_, Error>(Success::with("Device info retrieved", device))
        }
        .await,
    )
}

async fn power_on(state: ApiState, tail: Tail) -> std::result::Result<Response, Rejection> {
    let command = optional_address(&tail).map(|a| BridgeCommand::PowerOn(a.unwrap_or(LogicalAddress::TV)));
    reply(run(&state, command).await)
}

async fn power_off(state: ApiState, tail: Tail) -> std::result::Result<Response, Rejection> {
    let command = optional_address(&tail).map(|a| BridgeCommand::PowerOff(a.unwrap_or(LogicalAddress::TV)));
    reply(run(&state, command).await)
}

async fn power_status(state: ApiState, tail: Tail) -> std::result::Result<Response, Rejection> {
    reply(
        async {
            let session = state.slot.get()?;
            let address = optional_address(&tail)?.unwrap_or(LogicalAddress::TV);
            let status = blocking(move || session.get_device_power_status(address)).await?;
            Ok::<_, Error>(Success::with("Power status retrieved", AddressStatus { address, status }))
        }
        .await,
    )
}

async fn volume_up(state: ApiState, tail: Tail) -> std::result::Result<Response, Rejection> {
    reply(run(&state, optional_address(&tail).map(BridgeCommand::VolumeUp)).await)
}

async fn volume_down(state: ApiState, tail: Tail) -> std::result::Result<Response, Rejection> {
    reply(run(&state, optional_address(&tail).map(BridgeCommand::VolumeDown)).await)
}

async fn volume_mute(state: ApiState, tail: Tail) -> std::result::Result<Response, Rejection> {
    reply(run(&state, optional_address(&tail).map(BridgeCommand::VolumeMute)).await)
}

async fn active_source(state: ApiState) -> std::result::Result<Response, Rejection> {
    reply(
        with_session(&state, |s| s.get_active_source())
            .await
            .map(|address| {
                Success::with(
                    "Active source retrieved",
                    NamedAddress {
                        address,
                        name: address.name(),
                    },
                )
            }),
    )
}

async fn set_source(state: ApiState, address: String) -> std::result::Result<Response, Rejection> {
    let command = parse_logical_address(&address).map(BridgeCommand::Source);
    reply(run(&state, command).await)
}

async fn set_hdmi(state: ApiState, port: String) -> std::result::Result<Response, Rejection> {
    reply(run(&state, BridgeCommand::parse("hdmi", port.as_bytes())).await)
}

async fn topology(state: ApiState) -> std::result::Result<Response, Rejection> {
    reply(
        with_session(&state, |s| s.get_bus_topology())
            .await
            .map(|t| Success::with("Bus topology retrieved", t)),
    )
}

async fn audio_status(state: ApiState) -> std::result::Result<Response, Rejection> {
    reply(
        with_session(&state, |s| s.get_audio_status())
            .await
            .map(|a| Success::with("Audio status retrieved", a)),
    )
}

async fn send_key(state: ApiState, body: Bytes) -> std::result::Result<Response, Rejection> {
    reply(run(&state, BridgeCommand::parse("key", &body)).await)
}

async fn raw_command(state: ApiState, body: Bytes) -> std::result::Result<Response, Rejection> {
    reply(
        async {
            let session = state.slot.get()?;
            let request: RawCommandRequest = serde_json::from_slice(&body)
                .map_err(|e| ValidationError::new("request body", e.to_string()))?;
            let command = request.validate()?;
            blocking(move || session.transmit(&command)).await?;
            Ok::<_, Error>(Success::message("Raw command sent"))
        }
        .await,
    )
}

/// Hub events as SSE `data:` frames. Ends when the subscription is closed.
fn event_stream(sub: Subscription) -> impl Stream<Item = std::result::Result<sse::Event, Infallible>> {
    stream::unfold(sub, |mut sub| async move {
        loop {
            let event = sub.recv().await?;
            match sse::Event::default().json_data(&event) {
                Ok(frame) => return Some((Ok(frame), sub)),
                Err(e) => debug!("unserializable event: {e}"),
            }
        }
    })
}

fn events(state: ApiState) -> impl Reply {
    let sub = state.hub.subscribe();
    debug!("SSE client connected");
    sse::reply(
        sse::keep_alive()
            .interval(KEEP_ALIVE)
            .text("keepalive")
            .stream(event_stream(sub)),
    )
}

async fn handle_rejection(err: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:?}"))
    };
    Ok(failure(status, message))
}

/// All routes below `/api`.
pub fn routes(state: ApiState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let state = warp::any().map(move || state.clone());
    let body = warp::body::content_length_limit(MAX_BODY).and(warp::body::bytes());

    let health = warp::path!("api" / "health")
        .and(warp::get())
        .and(state.clone())
        .and_then(health);
    let logs = warp::path!("api" / "logs")
        .and(warp::get())
        .and(state.clone())
        .and_then(recent_logs);
    let devices = warp::path!("api" / "devices")
        .and(warp::get())
        .and(state.clone())
        .and(warp::query::<DevicesQuery>())
        .and_then(list_devices);
    let device = warp::path!("api" / "devices" / String)
        .and(warp::get())
        .and(state.clone())
        .and_then(|address, state| device_info(state, address));

    let power_on = warp::path!("api" / "power" / "on" / ..)
        .and(warp::path::tail())
        .and(warp::post())
        .and(state.clone())
        .and_then(|tail, state| power_on(state, tail));
    let power_off = warp::path!("api" / "power" / "off" / ..)
        .and(warp::path::tail())
        .and(warp::post())
        .and(state.clone())
        .and_then(|tail, state| power_off(state, tail));
    let power_status = warp::path!("api" / "power" / "status" / ..)
        .and(warp::path::tail())
        .and(warp::get())
        .and(state.clone())
        .and_then(|tail, state| power_status(state, tail));

    let volume_up = warp::path!("api" / "volume" / "up" / ..)
        .and(warp::path::tail())
        .and(warp::post())
        .and(state.clone())
        .and_then(|tail, state| volume_up(state, tail));
    let volume_down = warp::path!("api" / "volume" / "down" / ..)
        .and(warp::path::tail())
        .and(warp::post())
        .and(state.clone())
        .and_then(|tail, state| volume_down(state, tail));
    let volume_mute = warp::path!("api" / "volume" / "mute" / ..)
        .and(warp::path::tail())
        .and(warp::post())
        .and(state.clone())
        .and_then(|tail, state| volume_mute(state, tail));

    let active = warp::path!("api" / "source" / "active")
        .and(warp::get())
        .and(state.clone())
        .and_then(active_source);
    let source = warp::path!("api" / "source" / String)
        .and(warp::post())
        .and(state.clone())
        .and_then(|address, state| set_source(state, address));
    let hdmi = warp::path!("api" / "hdmi" / String)
        .and(warp::post())
        .and(state.clone())
        .and_then(|port, state| set_hdmi(state, port));

    let topology = warp::path!("api" / "topology")
        .and(warp::get())
        .and(state.clone())
        .and_then(topology);
    let audio = warp::path!("api" / "audio" / "status")
        .and(warp::get())
        .and(state.clone())
        .and_then(audio_status);
    let key = warp::path!("api" / "key")
        .and(warp::post())
        .and(state.clone())
        .and(body.clone())
        .and_then(send_key);
    let command = warp::path!("api" / "command")
        .and(warp::post())
        .and(state.clone())
        .and(body)
        .and_then(raw_command);
    let events = warp::path!("api" / "events")
        .and(warp::get())
        .and(state)
        .map(events);

    health
        .or(logs)
        .or(devices)
        .or(device)
        .or(power_on)
        .or(power_off)
        .or(power_status)
        .or(volume_up)
        .or(volume_down)
        .or(volume_mute)
        .or(active)
        .or(source)
        .or(hdmi)
        .or(topology)
        .or(audio)
        .or(key)
        .or(command)
        .or(events)
        .recover(handle_rejection)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: ApiState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::result::Result<(), warp::Error> {
    let (bound, server) = warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(addr = %bound, "HTTP server listening");
    server.await;
    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{DeviceType, PhysicalAddress},
        command::Command,
        engine::{
            mock::{Call, MockDevice, MockEngine},
            EngineConfig,
        },
        protocol::Opcode,
        session::SessionTiming,
    };
    use serde_json::Value;

    fn la(raw: u8) -> LogicalAddress {
        LogicalAddress::new(raw).unwrap()
    }

    fn state(mock: Option<&MockEngine>) -> ApiState {
        let hub = EventHub::new();
        let slot = Arc::new(SessionSlot::new());
        if let Some(mock) = mock {
            let timing = SessionTiming {
                settle: Duration::ZERO,
                button_hold: Duration::ZERO,
                volume_hold: Duration::ZERO,
                post_open_settle: Duration::ZERO,
                ..SessionTiming::default()
            };
            let engine = EngineConfig {
                device_name: "Bridge".into(),
                device_type: DeviceType::RecordingDevice,
            };
            let session = Session::open(&mock.factory(), &engine, hub.callbacks(), timing).unwrap();
            session.open_adapter("/dev/cec0").unwrap();
            mock.clear_calls();
            slot.install(Arc::new(session));
        }
        ApiState {
            slot,
            hub,
            logs: LogBuffer::new(8),
        }
    }

    async fn call(state: &ApiState, method: &str, path: &str, body: &str) -> (StatusCode, Value) {
        let res = warp::test::request()
            .method(method)
            .path(path)
            .body(body.to_string())
            .reply(&routes(state.clone()))
            .await;
        let json = serde_json::from_slice(res.body()).unwrap_or(Value::Null);
        (res.status(), json)
    }

    #[tokio::test]
    async fn not_ready_is_503() {
        let st = state(None);
        let (status, body) = call(&st, "POST", "/api/power/on", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "error");
        assert_eq!(body["message"], "CEC adapter not available");

        let (status, body) = call(&st, "GET", "/api/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["cec_ready"], false);
    }

    #[tokio::test]
    async fn recent_logs_without_an_adapter() {
        let st = state(None);
        for message in ["first", "second"] {
            st.logs.push(crate::logs::LogMessage {
                level: "INFO".into(),
                timestamp: chrono::Utc::now(),
                message: message.into(),
            });
        }
        let (status, body) = call(&st, "GET", "/api/logs", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Logs retrieved");
        assert_eq!(body["data"][0]["message"], "first");
        assert_eq!(body["data"][1]["message"], "second");
        assert_eq!(body["data"][1]["level"], "INFO");
    }

    #[tokio::test]
    async fn power_defaults_to_the_tv() {
        let mock = MockEngine::new();
        let st = state(Some(&mock));
        let (status, body) = call(&st, "POST", "/api/power/on", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["message"], "Power on command sent to device 0");
        assert!(body.get("data").is_none());

        let (status, _) = call(&st, "POST", "/api/power/off/5", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            mock.calls(),
            vec![Call::PowerOn(LogicalAddress::TV), Call::Standby(la(5))]
        );
    }

    #[tokio::test]
    async fn invalid_input_is_400_without_bus_traffic() {
        let mock = MockEngine::new();
        let st = state(Some(&mock));
        for (method, path, body) in [
            ("POST", "/api/power/on/16", ""),
            ("POST", "/api/volume/up/x", ""),
            ("POST", "/api/hdmi/0", ""),
            ("POST", "/api/hdmi/16", ""),
            ("GET", "/api/devices/99", ""),
            ("POST", "/api/key", "{\"address\":0,\"key\":\"explode\"}"),
            ("POST", "/api/key", "not json"),
            ("POST", "/api/command", "{\"initiator\":1,\"destination\":0,\"opcode\":256}"),
        ] {
            let (status, body) = call(&st, method, path, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{method} {path}");
            assert_eq!(body["status"], "error");
        }
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn raw_command_parameter_limit() {
        let mock = MockEngine::new();
        let st = state(Some(&mock));
        let params = |n: usize| vec!["0"; n].join(",");
        let body = |n| format!("{{\"initiator\":1,\"destination\":0,\"opcode\":100,\"parameters\":[{}]}}", params(n));

        let (status, _) = call(&st, "POST", "/api/command", &body(15)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(mock.calls().is_empty());

        let (status, body) = call(&st, "POST", "/api/command", &body(14)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Raw command sent");
        assert_eq!(
            mock.calls(),
            vec![Call::Transmit(Command::new(la(1), la(0), 100u8, vec![0u8; 14]).unwrap())]
        );
    }

    #[tokio::test]
    async fn bus_failures_are_500_with_context() {
        let mock = MockEngine::new();
        mock.fail("standby");
        let st = state(Some(&mock));
        let (status, body) = call(&st, "POST", "/api/power/off/4", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = body["message"].as_str().unwrap();
        assert!(message.contains("standby"), "{message}");
        assert!(message.contains("device 4"), "{message}");
    }

    #[tokio::test]
    async fn device_listing_and_power_status() {
        let mock = MockEngine::new().with_device(4, MockDevice::at(0x2000).named("Player"));
        let st = state(Some(&mock));
        let (status, body) = call(&st, "GET", "/api/devices", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Devices retrieved");
        let devices = body["data"].as_array().unwrap();
        assert!(devices
            .iter()
            .any(|d| d["logical_address"] == 4 && d["osd_name"] == "Player" && d["hdmi_port"] == 2));

        let (status, body) = call(&st, "GET", "/api/power/status/4", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["address"], 4);
        assert_eq!(body["data"]["status"], "on");
        assert_eq!(PhysicalAddress::new(0x2000).port(), 2);
    }

    #[tokio::test]
    async fn key_by_name_and_by_code() {
        let mock = MockEngine::new();
        let st = state(Some(&mock));
        let (status, body) = call(&st, "POST", "/api/key", "{\"address\":4,\"key\":\"select\"}").await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let (status, _) = call(&st, "POST", "/api/key", "{\"address\":4,\"keycode\":0}").await;
        assert_eq!(status, StatusCode::OK);
        let presses = mock
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::KeyPress { keycode: 0, .. }))
            .count();
        assert_eq!(presses, 2);
    }

    #[tokio::test]
    async fn unknown_route_is_404_envelope() {
        let st = state(None);
        let (status, body) = call(&st, "GET", "/api/nothing", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn events_become_sse_frames() {
        use futures::StreamExt;

        let hub = EventHub::new();
        let sub = hub.subscribe();
        hub.callbacks()
            .on_command(&Command::new(la(0), la(15), Opcode::Standby, Vec::<u8>::new()).unwrap());
        sub.unsubscribe();
        let frames: Vec<_> = event_stream(sub).collect().await;
        // power_change followed by the command itself
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.is_ok()));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn events_route_is_an_event_stream() {
        let st = state(None);
        let hub = st.hub.clone();
        let filter = routes(st);
        let res = warp::test::request().path("/api/events").filter(&filter).await;
        let res = res.map(Reply::into_response).ok().unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "text/event-stream");
        drop(res);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
