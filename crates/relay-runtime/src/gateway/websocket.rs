use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;

use relay_core::auth::TokenVerifier;
use relay_core::channel::{ChannelId, ChannelKind};
use relay_core::config::RelayConfig;
use relay_core::error::RelayError;
use relay_core::message::MessageDraft;
use relay_core::protocol::{ClientFrame, ErrorCode, ServerFrame};
use relay_core::session::DisconnectReason;

use super::guards;
use crate::channels::ChannelIndex;
use crate::dispatch::Dispatcher;
use crate::hooks::RelayHooks;
use crate::metrics::{incr, Metrics};
use crate::registry::{Connection, ConnectionRegistry, OutboundFrame};

/// Shared state behind the `/ws` route.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub channels: Arc<ChannelIndex>,
    pub dispatcher: Arc<Dispatcher>,
    pub hooks: RelayHooks,
    pub metrics: Arc<Metrics>,
    pub verifier: Option<Arc<dyn TokenVerifier>>,
}

impl GatewayContext {
    /// Enqueue a control frame to a connection.
    pub(crate) fn send_frame(&self, conn: &Arc<Connection>, frame: &ServerFrame) {
        match serde_json::to_vec(frame) {
            Ok(bytes) => {
                self.registry
                    .send_to_connection(conn, OutboundFrame::control(Bytes::from(bytes)));
            }
            Err(e) => {
                incr(&self.metrics.errors);
                tracing::error!(error = %e, "control frame serialization failed");
            }
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<Arc<GatewayContext>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Drive one WebSocket connection from accept to teardown.
async fn handle_socket(socket: WebSocket, ctx: Arc<GatewayContext>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let conn = match ctx.registry.register() {
        Ok(conn) => conn,
        Err(e) => {
            // Over the admission cap: reject and close.
            let frame = ServerFrame::from_error(&e);
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = ws_sender.send(WsMessage::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };
    let conn_id = conn.id();
    tracing::debug!(conn = %conn_id, "websocket connection established");

    ctx.send_frame(
        &conn,
        &ServerFrame::ConnectionStatus {
            status: "connected".to_string(),
            reason: None,
        },
    );
    ctx.hooks.connect(conn_id);

    // Writer task: single consumer of the outbound queue, owns the sink.
    let write_timeout = ctx.config.server.write_timeout();
    let writer_conn = conn.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = writer_conn.outbound().recv().await {
            let text = String::from_utf8_lossy(&frame.bytes).into_owned();
            match timeout(write_timeout, ws_sender.send(WsMessage::Text(text.into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    writer_conn.flag_disconnect(DisconnectReason::TransportError);
                    break;
                }
                Err(_) => {
                    tracing::warn!(conn = %writer_conn.id(), "transport write timed out");
                    writer_conn.flag_disconnect(DisconnectReason::TransportError);
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    // Auth deadline: authentication required but not completed in time
    // forces a disconnect.
    let watchdog = if ctx.config.auth.required {
        let deadline = ctx.config.auth.timeout();
        let ctx_wd = ctx.clone();
        let conn_wd = conn.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if !conn_wd.is_authenticated() && conn_wd.state().is_live() {
                tracing::debug!(conn = %conn_wd.id(), "authentication deadline expired");
                ctx_wd.send_frame(
                    &conn_wd,
                    &ServerFrame::ConnectionStatus {
                        status: "disconnecting".to_string(),
                        reason: Some(DisconnectReason::AuthTimeout.as_str().to_string()),
                    },
                );
                conn_wd.flag_disconnect(DisconnectReason::AuthTimeout);
            }
        }))
    } else {
        None
    };

    let frame_timeout = ctx.config.server.frame_timeout();
    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                let text = match incoming {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => {
                        conn.flag_disconnect(DisconnectReason::TransportError);
                        break;
                    }
                };

                // Budgeted handling; on expiry the response is dropped and
                // the connection is unaffected.
                if timeout(frame_timeout, handle_text(&ctx, &conn, &text))
                    .await
                    .is_err()
                {
                    tracing::warn!(conn = %conn_id, "frame handler exceeded its budget");
                }
            }
            _ = &mut writer => break,
        }
    }

    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    let reason = conn
        .disconnect_reason()
        .unwrap_or(DisconnectReason::ClientClosed);
    if ctx.registry.unregister(conn_id, reason).is_some() {
        ctx.hooks.disconnect(conn_id, reason);
    }
    ctx.channels.cleanup(conn_id);
    tracing::debug!(conn = %conn_id, reason = reason.as_str(), "websocket connection closed");
}

/// Parse and dispatch one inbound text frame.
pub(crate) async fn handle_text(ctx: &GatewayContext, conn: &Arc<Connection>, text: &str) {
    conn.touch();

    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            // Malformed frames get an error reply, not a disconnect.
            ctx.send_frame(
                conn,
                &ServerFrame::Error {
                    code: ErrorCode::InvalidMessageFormat,
                    message: e.to_string(),
                    data: None,
                },
            );
            return;
        }
    };

    handle_frame(ctx, conn, frame).await;
}

/// Dispatch one parsed client frame.
pub(crate) async fn handle_frame(ctx: &GatewayContext, conn: &Arc<Connection>, frame: ClientFrame) {
    match frame {
        ClientFrame::Ping => {
            ctx.send_frame(conn, &ServerFrame::Pong);
        }
        ClientFrame::Authenticate { token } => handle_authenticate(ctx, conn, &token).await,
        ClientFrame::Subscribe { channel, filter } => {
            match ctx.channels.subscribe(conn, &channel, filter) {
                Ok(_) => {
                    ctx.hooks.subscribe(conn.id(), &channel);
                    ctx.send_frame(
                        conn,
                        &ServerFrame::SubscriptionResult {
                            channel: channel.clone(),
                            success: true,
                            error: None,
                        },
                    );
                    if ctx.channels.settings().replay_on_subscribe {
                        replay_history(ctx, conn, &channel);
                    }
                }
                Err(e) => {
                    ctx.send_frame(
                        conn,
                        &ServerFrame::SubscriptionResult {
                            channel,
                            success: false,
                            error: Some(e.code()),
                        },
                    );
                }
            }
        }
        ClientFrame::Unsubscribe { channel } => {
            ctx.channels.unsubscribe(conn, &channel);
            ctx.send_frame(
                conn,
                &ServerFrame::UnsubscriptionResult {
                    channel,
                    success: true,
                },
            );
        }
        ClientFrame::Message {
            channel,
            data,
            kind,
        } => handle_publish(ctx, conn, channel, data, kind),
    }
}

async fn handle_authenticate(ctx: &GatewayContext, conn: &Arc<Connection>, token: &str) {
    let Some(verifier) = &ctx.verifier else {
        ctx.send_frame(
            conn,
            &ServerFrame::AuthenticationResult {
                success: false,
                user_id: None,
                error: Some("invalid token".to_string()),
            },
        );
        return;
    };

    let verified = timeout(ctx.config.auth.verify_timeout(), verifier.verify(token)).await;
    match verified {
        Ok(Ok(identity)) => {
            let user_id = identity.user_id.clone();
            if let Err(e) = ctx.registry.attach_user(conn.id(), identity) {
                incr(&ctx.metrics.errors);
                tracing::error!(conn = %conn.id(), error = %e, "attach_user failed");
                ctx.send_frame(conn, &ServerFrame::from_error(&RelayError::Internal(
                    "authentication failed".to_string(),
                )));
                return;
            }
            ctx.send_frame(
                conn,
                &ServerFrame::AuthenticationResult {
                    success: true,
                    user_id: Some(user_id),
                    error: None,
                },
            );
            ctx.send_frame(
                conn,
                &ServerFrame::ConnectionStatus {
                    status: "authenticated".to_string(),
                    reason: None,
                },
            );
        }
        Ok(Err(e)) => {
            // The wire reveals only "invalid token"; the cause goes to the
            // log.
            tracing::debug!(conn = %conn.id(), error = %e, "authentication rejected");
            ctx.send_frame(
                conn,
                &ServerFrame::AuthenticationResult {
                    success: false,
                    user_id: None,
                    error: Some("invalid token".to_string()),
                },
            );
        }
        Err(_) => {
            tracing::warn!(conn = %conn.id(), "token verification timed out");
            ctx.send_frame(
                conn,
                &ServerFrame::AuthenticationResult {
                    success: false,
                    user_id: None,
                    error: Some("invalid token".to_string()),
                },
            );
        }
    }
}

fn handle_publish(
    ctx: &GatewayContext,
    conn: &Arc<Connection>,
    channel: ChannelId,
    data: serde_json::Value,
    kind: Option<String>,
) {
    let Some(spec) = ctx.channels.spec(&channel) else {
        ctx.send_frame(
            conn,
            &ServerFrame::from_error(&RelayError::ChannelNotFound(channel.to_string())),
        );
        return;
    };

    // Capability guards ahead of dispatch.
    let guard = if spec.kind == ChannelKind::System {
        guards::requires_role(conn, relay_core::session::Role::Admin)
            .or_else(|_| guards::requires_permission(conn, "system:publish"))
    } else if spec.requires_auth {
        guards::requires_auth(conn)
    } else {
        Ok(())
    };
    if let Err(e) = guard {
        ctx.send_frame(conn, &ServerFrame::from_error(&e));
        return;
    }

    let window = ctx.registry.rate_settings().window();
    let limit = ctx
        .registry
        .rate_settings()
        .limit_on_channel(conn.role(), &spec);
    let decision = conn.check_rate(window, limit);
    if let Some(e) = decision.to_error() {
        incr(&ctx.metrics.rate_limited);
        ctx.send_frame(conn, &ServerFrame::from_error(&e));
        return;
    }

    let mut draft = MessageDraft::new(data);
    if let Some(kind) = kind {
        draft = draft.with_kind(kind);
    }
    if let Some(user_id) = conn.user_id() {
        draft = draft.with_source(user_id.to_string());
    }

    if let Err(e) = ctx.dispatcher.publish(&channel, draft) {
        ctx.send_frame(conn, &ServerFrame::from_error(&e));
    }
}

/// Enqueue recent history to a fresh subscriber. Replayed frames precede
/// any live frame published after the subscribe returned.
fn replay_history(ctx: &GatewayContext, conn: &Arc<Connection>, channel: &ChannelId) {
    let count = ctx.channels.settings().replay_count;
    for message in ctx.channels.history(channel, count) {
        match serde_json::to_vec(&message) {
            Ok(bytes) => {
                incr(&ctx.metrics.serializations);
                ctx.registry.send_to_connection(
                    conn,
                    OutboundFrame::new(Bytes::from(bytes), message.priority()),
                );
            }
            Err(e) => {
                incr(&ctx.metrics.errors);
                tracing::error!(channel = %channel, error = %e, "history replay serialization failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::channel::ChannelSpec;
    use relay_core::config::ChannelSettings;
    use relay_core::rate_limit::RateLimitSettings;
    use relay_core::session::Role;

    use crate::gateway::verifier::StaticTokenVerifier;
    use crate::queue::OfflineQueue;

    use serde_json::json;

    fn context(config: RelayConfig, verifier: Option<Arc<dyn TokenVerifier>>) -> GatewayContext {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new(
            config.rate_limit.clone(),
            config.server.outbound_capacity,
            config.auth.required,
            metrics.clone(),
        ));
        let channels = Arc::new(ChannelIndex::new(config.channels.clone()));
        let queue = Arc::new(OfflineQueue::new(config.queue.clone(), metrics.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            channels.clone(),
            queue,
            RelayHooks::new(),
            metrics.clone(),
        ));
        GatewayContext {
            config,
            registry,
            channels,
            dispatcher,
            hooks: RelayHooks::new(),
            metrics,
            verifier,
        }
    }

    fn default_context() -> GatewayContext {
        let config = RelayConfig {
            channels: ChannelSettings {
                static_channels: vec![
                    ChannelSpec::new("market-data"),
                    ChannelSpec::new("portfolio").with_requires_auth(true),
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(StaticTokenVerifier::new().with_user("good-token", "u-1"));
        context(config, Some(verifier))
    }

    fn drain(conn: &Arc<Connection>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Some(frame) = conn.outbound().try_recv() {
            frames.push(serde_json::from_slice(&frame.bytes).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let ctx = default_context();
        let conn = ctx.registry.register().unwrap();

        handle_text(&ctx, &conn, r#"{"type":"ping"}"#).await;

        let frames = drain(&conn);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "pong");
    }

    #[tokio::test]
    async fn test_malformed_frame_replies_error_without_disconnect() {
        let ctx = default_context();
        let conn = ctx.registry.register().unwrap();

        handle_text(&ctx, &conn, "{ not json").await;

        let frames = drain(&conn);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["code"], "INVALID_MESSAGE_FORMAT");
        assert!(conn.state().is_live());
        assert!(ctx.registry.get(conn.id()).is_some());
    }

    #[tokio::test]
    async fn test_authentication_success_and_failure() {
        let ctx = default_context();
        let conn = ctx.registry.register().unwrap();

        handle_text(&ctx, &conn, r#"{"type":"authenticate","token":"bad"}"#).await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["type"], "authentication_result");
        assert_eq!(frames[0]["success"], false);
        assert_eq!(frames[0]["error"], "invalid token");

        handle_text(&ctx, &conn, r#"{"type":"authenticate","token":"good-token"}"#).await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["success"], true);
        assert_eq!(frames[0]["user_id"], "u-1");
        assert_eq!(frames[1]["type"], "connection_status");
        assert_eq!(frames[1]["status"], "authenticated");
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn test_auth_required_channel_flow() {
        let ctx = default_context();
        let conn = ctx.registry.register().unwrap();

        // Unauthenticated subscribe to an auth-required channel fails.
        handle_text(&ctx, &conn, r#"{"type":"subscribe","channel":"portfolio"}"#).await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["type"], "subscription_result");
        assert_eq!(frames[0]["success"], false);
        assert_eq!(frames[0]["error"], "CHANNEL_ACCESS_DENIED");

        // After authenticating, the retry succeeds.
        handle_text(&ctx, &conn, r#"{"type":"authenticate","token":"good-token"}"#).await;
        drain(&conn);
        handle_text(&ctx, &conn, r#"{"type":"subscribe","channel":"portfolio"}"#).await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["success"], true);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_channel() {
        let ctx = default_context();
        let conn = ctx.registry.register().unwrap();

        handle_text(&ctx, &conn, r#"{"type":"subscribe","channel":"nope"}"#).await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["success"], false);
        assert_eq!(frames[0]["error"], "CHANNEL_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_always_ok() {
        let ctx = default_context();
        let conn = ctx.registry.register().unwrap();

        handle_text(&ctx, &conn, r#"{"type":"unsubscribe","channel":"market-data"}"#).await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["type"], "unsubscription_result");
        assert_eq!(frames[0]["success"], true);
    }

    #[tokio::test]
    async fn test_rate_limit_on_publish() {
        let config = RelayConfig {
            rate_limit: RateLimitSettings {
                window_ms: 60_000,
                max_messages: 5,
                ..Default::default()
            },
            channels: ChannelSettings {
                static_channels: vec![ChannelSpec::new("market-data")],
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = context(config, None);
        let conn = ctx.registry.register().unwrap();

        for _ in 0..5 {
            handle_text(
                &ctx,
                &conn,
                r#"{"type":"message","channel":"market-data","data":{"n":1}}"#,
            )
            .await;
        }
        assert!(drain(&conn).is_empty());

        // The sixth message inside the window is rejected.
        handle_text(
            &ctx,
            &conn,
            r#"{"type":"message","channel":"market-data","data":{"n":6}}"#,
        )
        .await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["code"], "RATE_LIMIT_EXCEEDED");
        assert!(frames[0]["data"]["retry_after_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let ctx = default_context();
        let publisher = ctx.registry.register().unwrap();
        let subscriber = ctx.registry.register().unwrap();
        ctx.channels
            .subscribe(&subscriber, &ChannelId::new("market-data"), None)
            .unwrap();

        handle_text(
            &ctx,
            &publisher,
            r#"{"type":"message","channel":"market-data","data":{"symbol":"AAPL"},"kind":"market_update"}"#,
        )
        .await;

        let frames = drain(&subscriber);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "market_update");
        assert_eq!(frames[0]["data"]["symbol"], "AAPL");
    }

    #[tokio::test]
    async fn test_system_channel_requires_privilege() {
        let config = RelayConfig {
            channels: ChannelSettings {
                static_channels: vec![
                    ChannelSpec::new("system").with_kind(ChannelKind::System)
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        let verifier = StaticTokenVerifier::new().with_user("user-token", "u-1");
        verifier.insert(
            "admin-token",
            relay_core::session::VerifiedIdentity {
                user_id: relay_core::session::UserId::new("root"),
                role: Role::Admin,
                permissions: vec![],
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            },
        );
        let ctx = context(config, Some(Arc::new(verifier)));

        let conn = ctx.registry.register().unwrap();
        handle_text(&ctx, &conn, r#"{"type":"authenticate","token":"user-token"}"#).await;
        drain(&conn);
        handle_text(
            &ctx,
            &conn,
            r#"{"type":"message","channel":"system","data":{}}"#,
        )
        .await;
        let frames = drain(&conn);
        assert_eq!(frames[0]["code"], "AUTHORIZATION_FAILED");

        let admin = ctx.registry.register().unwrap();
        handle_text(&ctx, &admin, r#"{"type":"authenticate","token":"admin-token"}"#).await;
        drain(&admin);
        handle_text(
            &ctx,
            &admin,
            r#"{"type":"message","channel":"system","data":{}}"#,
        )
        .await;
        assert!(drain(&admin).is_empty());
    }

    #[tokio::test]
    async fn test_history_replay_on_subscribe() {
        let config = RelayConfig {
            channels: ChannelSettings {
                replay_on_subscribe: true,
                replay_count: 2,
                static_channels: vec![ChannelSpec::new("market-data")],
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = context(config, None);
        let channel = ChannelId::new("market-data");

        for n in 0..3 {
            ctx.dispatcher
                .publish(&channel, MessageDraft::new(json!({ "n": n })))
                .unwrap();
        }

        let conn = ctx.registry.register().unwrap();
        handle_text(&ctx, &conn, r#"{"type":"subscribe","channel":"market-data"}"#).await;

        let frames = drain(&conn);
        assert_eq!(frames[0]["type"], "subscription_result");
        // The two most recent messages, oldest first.
        assert_eq!(frames[1]["data"]["n"], 1);
        assert_eq!(frames[2]["data"]["n"], 2);
    }
}
