//! The unified WebSocket handler: every device and controller connects to
//! the same `GET /ws` route and the hub figures out which one it is from
//! the first frame it sends (spec §4.6's CONNECTED -> CONTROLLER|DEVICE
//! state machine).
//!
//! One task owns the read half of each socket for its whole lifetime; all
//! writes — including fan-out writes from other tasks — go through the
//! `Conn` stored in the registry, never through this task's own half.

use crate::state::{wrap_socket_sink, AppState, Conn};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine;
use futures_util::StreamExt;
use hub_protocol::{
    encode_binary_frame, kind, parse_binary_frame, CommandRequest, CommandsRequest, DeviceCommand, DeviceMessage,
    Envelope, HttpProxyRequest, HttpResponseBin, LogSubscriptionRequest,
};
use tracing::{info, warn};

pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

/// What this socket has turned out to be, decided by its first meaningful
/// frame. `Connected` sockets have sent nothing yet.
enum Role {
    Connected,
    Controller,
    Device(String),
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let conn_id = app.registry.next_conn_id();
    let (sink, mut stream) = socket.split();
    let conn: Conn = wrap_socket_sink(sink);
    let mut role = Role::Connected;

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn_id, error = %e, "websocket read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                if let Role::Device(udid) = &role {
                    app.registry.reset_life(udid).await;
                }
                if handle_text(&app, conn_id, &conn, &mut role, text.as_str()).await.is_err() {
                    break;
                }
            }
            Message::Binary(bytes) => {
                if let Role::Device(udid) = &role {
                    app.registry.reset_life(udid).await;
                }
                handle_binary(&app, conn_id, &role, &bytes).await;
            }
            Message::Ping(_) => {
                if let Role::Device(udid) = &role {
                    app.registry.reset_life(udid).await;
                }
            }
            Message::Pong(_) => {
                if let Role::Device(udid) = &role {
                    app.registry.reset_life(udid).await;
                }
            }
            Message::Close(_) => break,
        }
    }

    cleanup(&app, conn_id, role).await;
}

/// `Err(())` means the caller should close the socket (auth failure or an
/// unrecognized frame from an unauthenticated connection).
async fn handle_text(app: &AppState, conn_id: u64, conn: &Conn, role: &mut Role, text: &str) -> Result<(), ()> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            warn!(conn_id, error = %e, "dropping malformed frame");
            return Ok(());
        }
    };

    if envelope.msg_type.starts_with("control/") {
        if !verify_control_frame(app, &envelope) {
            warn!(conn_id, msg_type = %envelope.msg_type, "closing socket: invalid or missing signature");
            return Err(());
        }
        app.registry.promote_to_controller(conn_id, conn.clone()).await;
        *role = Role::Controller;
        handle_control_frame(app, conn_id, conn, &envelope).await;
        return Ok(());
    }

    match envelope.msg_type.as_str() {
        kind::APP_STATE => {
            handle_app_state(app, conn_id, conn, role, &envelope).await;
        }
        kind::SYSTEM_LOG_PUSH => {
            if let Role::Device(udid) = role {
                let out = Envelope::new(kind::SYSTEM_LOG_PUSH, envelope.body.clone()).with_udid(udid.clone());
                for sub in app.registry.log_subscriber_conns(udid).await {
                    let arbiter = app.registry.arbiter();
                    let out = out.clone();
                    arbiter
                        .dispatch(async move {
                            let _ = crate::state::send_envelope(&sub, &out).await;
                        })
                        .await;
                }
            }
        }
        kind::HTTP_RESPONSE_BIN => {
            if let Role::Device(udid) = role {
                handle_http_response_bin(app, udid, &envelope).await;
            }
        }
        kind::TRANSFER_FETCH_COMPLETE => {
            if let Role::Device(udid) = role {
                let body: hub_protocol::TransferFetchComplete = match envelope.decode_body() {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(conn_id, error = %e, "malformed transfer/fetch/complete");
                        return Ok(());
                    }
                };
                app.dispatcher
                    .on_fetch_complete(
                        &app.registry,
                        udid,
                        body.request_id.as_deref(),
                        body.target_path.as_deref(),
                        body.success,
                        body.error.as_deref(),
                    )
                    .await;
            }
        }
        _ => match role {
            Role::Device(udid) => {
                let out = envelope.clone();
                let out = Envelope { udid: Some(udid.clone()), ..out };
                app.registry.broadcast_to_controllers(out).await;
            }
            Role::Connected => {
                warn!(conn_id, msg_type = %envelope.msg_type, "closing socket: unrecognized frame before authentication");
                return Err(());
            }
            Role::Controller => {
                warn!(conn_id, msg_type = %envelope.msg_type, "dropping unrecognized frame from controller");
            }
        },
    }
    Ok(())
}

fn verify_control_frame(app: &AppState, envelope: &Envelope) -> bool {
    let (Some(ts), Some(nonce), Some(sign)) = (envelope.ts, envelope.nonce.as_deref(), envelope.sign.as_deref()) else {
        return false;
    };
    let now = chrono::Utc::now().timestamp();
    let body_canonical = serde_json::to_vec(&envelope.body).unwrap_or_default();
    app.auth.verify_message(now, ts, nonce, sign, &envelope.msg_type, &body_canonical)
}

async fn handle_control_frame(app: &AppState, conn_id: u64, conn: &Conn, envelope: &Envelope) {
    match envelope.msg_type.as_str() {
        kind::CONTROL_DEVICES => {
            let snapshot = app.registry.device_snapshot().await;
            let body = serde_json::to_value(snapshot).unwrap_or_default();
            let mut reply = Envelope::new(kind::CONTROL_DEVICES, body);
            reply.request_id = envelope.request_id.clone();
            let _ = crate::state::send_envelope(conn, &reply).await;
        }
        kind::CONTROL_REFRESH => {
            let refresh = Envelope::new(kind::APP_STATE, serde_json::Value::Null);
            for device_conn in app.registry.alive_device_conns().await {
                let arbiter = app.registry.arbiter();
                let refresh = refresh.clone();
                arbiter
                    .dispatch(async move {
                        let _ = crate::state::send_envelope(&device_conn, &refresh).await;
                    })
                    .await;
            }
        }
        kind::CONTROL_COMMAND => {
            let Ok(req) = envelope.decode_body::<CommandRequest>() else {
                warn!(conn_id, "malformed control/command body");
                return;
            };
            if let Some(template) = hub_protocol::command_status_template(&req.command_type) {
                for device in &req.devices {
                    app.registry
                        .broadcast_device_message(DeviceMessage {
                            udid: Some(device.clone()),
                            message: template.replace("{device}", device),
                        })
                        .await;
                }
            }
            for device in &req.devices {
                let cmd = DeviceCommand {
                    command_type: req.command_type.clone(),
                    body: req.body.clone(),
                    request_id: req.request_id.clone(),
                };
                let out = Envelope::new(cmd.command_type.clone(), cmd.body.clone());
                let out = match &cmd.request_id {
                    Some(id) => out.with_request_id(id.clone()),
                    None => out,
                };
                let _ = app.registry.send_to_device_logged(device, out).await;
            }
        }
        kind::CONTROL_COMMANDS => {
            let Ok(req) = envelope.decode_body::<CommandsRequest>() else {
                warn!(conn_id, "malformed control/commands body");
                return;
            };
            for device in &req.devices {
                for cmd in &req.commands {
                    let out = Envelope::new(cmd.command_type.clone(), cmd.body.clone());
                    let out = match &cmd.request_id {
                        Some(id) => out.with_request_id(id.clone()),
                        None => out,
                    };
                    let _ = app.registry.send_to_device_logged(device, out).await;
                }
            }
        }
        kind::CONTROL_HTTP => {
            handle_http_proxy(app, conn_id, envelope, false).await;
        }
        kind::CONTROL_HTTP_BIN => {
            handle_http_proxy(app, conn_id, envelope, true).await;
        }
        kind::CONTROL_LOG_SUBSCRIBE => {
            let Ok(req) = envelope.decode_body::<LogSubscriptionRequest>() else {
                warn!(conn_id, "malformed control/log/subscribe body");
                return;
            };
            if app.registry.subscribe_log(&req.device, conn_id).await {
                let out = Envelope::new(kind::SYSTEM_LOG_SUBSCRIBE, serde_json::Value::Null);
                let _ = app.registry.send_to_device_logged(&req.device, out).await;
            }
        }
        kind::CONTROL_LOG_UNSUBSCRIBE => {
            let Ok(req) = envelope.decode_body::<LogSubscriptionRequest>() else {
                warn!(conn_id, "malformed control/log/unsubscribe body");
                return;
            };
            if app.registry.unsubscribe_log(&req.device, conn_id).await {
                let out = Envelope::new(kind::SYSTEM_LOG_UNSUBSCRIBE, serde_json::Value::Null);
                let _ = app.registry.send_to_device_logged(&req.device, out).await;
            }
        }
        other => {
            warn!(conn_id, msg_type = other, "dropping unrecognized control frame");
        }
    }
}

/// The controller addresses a single target device for an HTTP proxy
/// conversation via the envelope's `udid` field — the only addressing slot
/// `control/http`/`control/http-bin` carries beyond the proxy request body
/// itself.
async fn handle_http_proxy(app: &AppState, conn_id: u64, envelope: &Envelope, binary: bool) {
    let Some(device) = envelope.udid.as_deref() else {
        warn!(conn_id, "control/http(-bin) missing target udid");
        return;
    };
    let Ok(mut req) = envelope.decode_body::<HttpProxyRequest>() else {
        warn!(conn_id, "malformed control/http(-bin) body");
        return;
    };

    if req.path == "/webrtc/start" {
        merge_ice_servers(app, &mut req);
    }

    if binary {
        app.registry
            .install_binary_route(req.request_id.clone(), conn_id, vec![device.to_string()])
            .await;
    }

    let msg_type = if binary { kind::CONTROL_HTTP_BIN } else { kind::CONTROL_HTTP };
    let out = Envelope::new(msg_type, serde_json::to_value(&req).unwrap_or_default())
        .with_request_id(req.request_id.clone());
    let _ = app.registry.send_to_device_logged(device, out).await;
}

/// Merges the hub's configured ICE servers into a base64-encoded JSON body
/// under `iceServers`, leaving the body untouched if it isn't valid JSON.
fn merge_ice_servers(app: &AppState, req: &mut HttpProxyRequest) {
    let Some(body) = &req.body else { return };
    let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(body) else {
        return;
    };
    let Ok(mut parsed) = serde_json::from_slice::<serde_json::Value>(&raw) else {
        return;
    };
    if let Some(obj) = parsed.as_object_mut() {
        obj.insert("iceServers".to_string(), app.config.ice_servers.clone());
    }
    let re_encoded = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&parsed).unwrap_or_default());
    req.body = Some(re_encoded);
}

async fn handle_app_state(app: &AppState, conn_id: u64, conn: &Conn, role: &mut Role, envelope: &Envelope) {
    let Some(udid) = extract_udid(&envelope.body) else {
        warn!(conn_id, "app/state missing system.udid, dropping");
        return;
    };

    let is_new = app.registry.register_device(&udid, conn_id, conn.clone(), envelope.body.clone()).await;
    if !is_new {
        app.registry.update_device_state(&udid, envelope.body.clone()).await;
    }
    *role = Role::Device(udid.clone());

    let out = Envelope::new(kind::APP_STATE, envelope.body.clone()).with_udid(udid.clone());
    app.registry.broadcast_to_controllers(out).await;

    if !app.registry.log_subscriber_conns(&udid).await.is_empty() {
        let subscribe = Envelope::new(kind::SYSTEM_LOG_SUBSCRIBE, serde_json::Value::Null);
        let _ = crate::state::send_envelope(conn, &subscribe).await;
    }

    info!(udid, "device state updated");
}

async fn handle_http_response_bin(app: &AppState, udid: &str, envelope: &Envelope) {
    let Ok(body) = envelope.decode_body::<HttpResponseBin>() else {
        return;
    };
    let Some(route) = app.registry.binary_route(&body.request_id).await else {
        return;
    };
    let Some(controller) = app.registry.controller_conn(route.controller).await else {
        return;
    };
    let out = Envelope::new(kind::HTTP_RESPONSE_BIN, envelope.body.clone()).with_udid(udid.to_string());
    let _ = crate::state::send_envelope(&controller, &out).await;

    if body.body_size == 0 {
        app.registry.remove_binary_route(&body.request_id).await;
    }
}

async fn handle_binary(app: &AppState, conn_id: u64, role: &Role, bytes: &[u8]) {
    let Some((header, payload)) = parse_binary_frame(bytes) else {
        warn!(conn_id, "dropping undersized binary frame");
        return;
    };
    let request_id = header.request_id_hex();
    let route = app.registry.binary_route(&request_id).await;
    if route.is_none() && !matches!(role, Role::Device(_)) {
        warn!(conn_id, request_id, "dropping binary frame with no installed route");
        return;
    }

    let targets: Vec<Conn> = match (role, route) {
        (Role::Controller, Some(route)) => {
            let mut out = Vec::new();
            for udid in &route.devices {
                if let Some(c) = app.registry.device_conn(udid).await {
                    out.push(c);
                }
            }
            out
        }
        (Role::Device(_), Some(route)) => match app.registry.controller_conn(route.controller).await {
            Some(c) => vec![c],
            None => Vec::new(),
        },
        (Role::Device(_), None) => {
            // No route registered for this request id yet — a device-originated
            // binary frame with nowhere to go is broadcast to every controller
            // rather than dropped, since any of them may be the one waiting on it.
            app.registry.controller_conns().await
        }
        (Role::Controller, None) | (Role::Connected, _) => Vec::new(),
    };

    let frame = encode_binary_frame(header, payload);
    for target in targets {
        if let Err(e) = crate::state::send_binary(&target, frame.clone()).await {
            warn!(conn_id, request_id, error = %e, "binary fan-out write failed");
        }
    }

    if header.is_last() {
        app.registry.remove_binary_route(&request_id).await;
    }
}

async fn cleanup(app: &AppState, conn_id: u64, role: Role) {
    match role {
        Role::Controller => {
            app.registry.unregister_controller(conn_id).await;
        }
        Role::Device(udid) => {
            app.registry.unregister_device(&udid, conn_id).await;
            app.registry
                .broadcast_device_message(DeviceMessage { udid: Some(udid), message: "device disconnected".to_string() })
                .await;
        }
        Role::Connected => {}
    }
}

fn extract_udid(body: &serde_json::Value) -> Option<String> {
    body.get("system")?.get("udid")?.as_str().map(str::to_owned)
}
