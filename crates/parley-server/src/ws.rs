//! WebSocket transport at `GET /ws`.
//!
//! One task reads frames and drives the router; a second task drains the
//! connection's outbound queue into the socket. Replies (`ack`, `history`,
//! `error`) travel through the same queue as pushed events, so a client
//! sees them in a single consistent order. Replies wait for room in the
//! queue; pushes on behalf of other users never do.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};

use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::protocol::{ClientFrame, SendIntent, SendTarget, ServerEvent};
use parley_shared::types::UserId;
use parley_shared::ChatError;

use crate::api::AppState;
use crate::presence::ConnectionHandle;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    serve_connection(sink, stream, state).await;
}

/// Run one connection from the handshake to its disconnect.
async fn serve_connection<W, R>(mut sink: W, mut stream: R, state: AppState)
where
    W: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
{
    let user = match authenticate(&mut stream).await {
        Ok(user) => user,
        Err(err) => {
            tracing::debug!(error = %err, "websocket authentication failed");
            let _ = send_event(&mut sink, &ServerEvent::error(None, &err)).await;
            let _ = sink.close().await;
            return;
        }
    };

    let (handle, mut outbound) = ConnectionHandle::channel(state.config.outbound_queue);
    let connection = handle.id();

    let online_peers = match state.router.mark_online(user, handle.clone()).await {
        Ok(peers) => peers,
        Err(err) => {
            tracing::info!(user = %user, error = %err, "websocket connection rejected");
            let _ = send_event(&mut sink, &ServerEvent::error(None, &err)).await;
            let _ = sink.close().await;
            return;
        }
    };

    let greeting = ServerEvent::Authenticated {
        user_id: user,
        connection_id: connection,
        protocol: PROTOCOL_VERSION.to_string(),
        online_peers,
    };
    if send_event(&mut sink, &greeting).await.is_err() {
        let _ = state.router.mark_offline(user, connection).await;
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            if send_event(&mut sink, &event).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, user, &handle, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(user = %user, error = %e, "websocket read error");
                break;
            }
        }
    }

    if let Err(e) = state.router.mark_offline(user, connection).await {
        tracing::warn!(user = %user, error = %e, "failed to record disconnect");
    }
    writer.abort();
}

/// The first frame must be `authenticate`.
async fn authenticate<R>(stream: &mut R) -> Result<UserId, ChatError>
where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let first = tokio::time::timeout(AUTH_TIMEOUT, stream.next())
        .await
        .map_err(|_| ChatError::AccessDenied("authentication timed out".into()))?;

    match first {
        Some(Ok(Message::Text(text))) => match ClientFrame::from_json(&text) {
            Ok(ClientFrame::Authenticate { user_id }) => Ok(user_id),
            Ok(_) => Err(ChatError::AccessDenied(
                "the first frame must be authenticate".into(),
            )),
            Err(e) => Err(ChatError::Validation(format!("malformed frame: {e}"))),
        },
        _ => Err(ChatError::AccessDenied("connection closed before authenticating".into())),
    }
}

async fn send_event<W>(sink: &mut W, event: &ServerEvent) -> Result<(), axum::Error>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
{
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode event");
            return Ok(());
        }
    };
    sink.send(Message::Text(json)).await
}

async fn handle_frame(state: &AppState, user: UserId, handle: &ConnectionHandle, text: &str) {
    let frame = match ClientFrame::from_json(text) {
        Ok(frame) => frame,
        Err(e) => {
            let err = ChatError::Validation(format!("malformed frame: {e}"));
            return respond(handle, ServerEvent::error(None, &err)).await;
        }
    };
    state.router.presence().touch(user);

    let router = &state.router;
    let response = match frame {
        ClientFrame::Authenticate { .. } => Some(ServerEvent::error(
            None,
            &ChatError::Validation("already authenticated".into()),
        )),

        ClientFrame::Send {
            request_id,
            to,
            conversation_id,
            content,
            kind,
            file,
            client_ref,
        } => {
            if !state.user_limiter.check(user).await {
                tracing::warn!(user = %user, "send rate limit exceeded");
                let err = ChatError::Validation("rate limit exceeded, slow down".into());
                return respond(handle, ServerEvent::error(request_id, &err)).await;
            }
            let target = match (to, conversation_id) {
                (Some(to), None) => SendTarget::User(to),
                (None, Some(id)) => SendTarget::Conversation(id),
                _ => {
                    let err = ChatError::Validation(
                        "exactly one of `to` or `conversation_id` is required".into(),
                    );
                    return respond(handle, ServerEvent::error(request_id, &err)).await;
                }
            };
            let intent = SendIntent {
                sender_id: user,
                target,
                content,
                kind,
                file,
                client_ref,
            };
            match router.submit(intent).await {
                Ok(submitted) => {
                    // Ack first, so delivery notices never precede it.
                    let ack = ServerEvent::Ack {
                        request_id,
                        message: Some(submitted.message),
                    };
                    respond(handle, ack).await;
                    router.report_deliveries(&submitted.deliveries);
                    None
                }
                Err(e) => Some(ServerEvent::error(request_id, &e)),
            }
        }

        ClientFrame::History {
            request_id,
            conversation_id,
            limit,
            before,
        } => Some(
            match router
                .load_history(&conversation_id, user, limit, before)
                .await
            {
                Ok(messages) => ServerEvent::History {
                    request_id,
                    conversation_id,
                    messages,
                },
                Err(e) => ServerEvent::error(request_id, &e),
            },
        ),

        ClientFrame::Read {
            request_id,
            message_id,
        } => Some(match router.mark_read(message_id, user).await {
            Ok(_) => ServerEvent::Ack {
                request_id,
                message: None,
            },
            Err(e) => ServerEvent::error(request_id, &e),
        }),

        ClientFrame::Delete {
            request_id,
            message_id,
        } => Some(match router.delete_message(message_id, user).await {
            Ok(()) => ServerEvent::Ack {
                request_id,
                message: None,
            },
            Err(e) => ServerEvent::error(request_id, &e),
        }),

        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => {
            let result = if is_typing {
                router.start_typing(&conversation_id, user).await
            } else {
                router.stop_typing(&conversation_id, user).await
            };
            result.err().map(|e| ServerEvent::error(None, &e))
        }

        ClientFrame::Signal { to, payload } => router
            .relay_signal(user, to, payload)
            .await
            .err()
            .map(|e| ServerEvent::error(None, &e)),

        ClientFrame::Ping => Some(ServerEvent::Pong),
    };

    if let Some(event) = response {
        respond(handle, event).await;
    }
}

async fn respond(handle: &ConnectionHandle, event: ServerEvent) {
    if !handle.reply(event).await {
        tracing::debug!(connection = %handle.id(), "reply to a closed connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::channel::mpsc;
    use parley_shared::types::{ConversationId, MessageStatus};
    use parley_shared::ErrorKind;
    use parley_store::NewUser;
    use tokio::task::JoinHandle;

    use crate::api::tests::test_state;
    use crate::rate_limit::UserRateLimiter;

    /// A client on the far side of in-memory channels standing in for the
    /// socket.
    struct Client {
        to_server: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        from_server: mpsc::UnboundedReceiver<Message>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn connect(state: &AppState) -> Self {
            let (to_server, inbound) = mpsc::unbounded();
            let (outbound, from_server) = mpsc::unbounded();
            let sink = outbound.sink_map_err(axum::Error::new);
            let task = tokio::spawn(serve_connection(sink, inbound, state.clone()));
            Self {
                to_server,
                from_server,
                task,
            }
        }

        async fn login(state: &AppState, user: UserId) -> Self {
            let mut client = Self::connect(state);
            client.send(serde_json::json!({ "type": "authenticate", "user_id": user }));
            let greeting = client.next_event().await;
            assert!(
                matches!(greeting, Some(ServerEvent::Authenticated { user_id, .. }) if user_id == user),
                "unexpected greeting {greeting:?}"
            );
            client
        }

        fn send(&self, frame: serde_json::Value) {
            self.send_text(frame.to_string());
        }

        fn send_text(&self, text: String) {
            self.to_server.unbounded_send(Ok(Message::Text(text))).unwrap();
        }

        /// The next event, or `None` once the server closed the socket.
        async fn next_event(&mut self) -> Option<ServerEvent> {
            let next = tokio::time::timeout(Duration::from_secs(15), self.from_server.next())
                .await
                .expect("timed out waiting for the server");
            match next {
                Some(Message::Text(text)) => Some(serde_json::from_str(&text).unwrap()),
                Some(other) => panic!("unexpected frame {other:?}"),
                None => None,
            }
        }

        async fn expect(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
            loop {
                let event = self.next_event().await.expect("socket closed");
                if pred(&event) {
                    return event;
                }
            }
        }
    }

    async fn user(state: &AppState, name: &str) -> UserId {
        let new = NewUser::new(name, name.to_uppercase());
        state
            .store
            .run(move |db| db.create_user(&new))
            .await
            .unwrap()
            .id
    }

    fn state() -> AppState {
        test_state(None, UserRateLimiter::default())
    }

    #[tokio::test]
    async fn test_first_frame_must_authenticate() {
        let state = state();
        let mut client = Client::connect(&state);
        client.send(serde_json::json!({ "type": "ping" }));

        let event = client.next_event().await;
        assert!(matches!(
            event,
            Some(ServerEvent::Error { kind: ErrorKind::AccessDenied, request_id: None, .. })
        ));
        assert_eq!(client.next_event().await, None);
        client.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_user_is_rejected() {
        let state = state();
        let mut client = Client::connect(&state);
        client.send(serde_json::json!({ "type": "authenticate", "user_id": UserId::new() }));

        assert!(matches!(
            client.next_event().await,
            Some(ServerEvent::Error { kind: ErrorKind::AccessDenied, .. })
        ));
        assert_eq!(client.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let state = state();
        let mut client = Client::connect(&state);

        let event = client.next_event().await;
        assert!(matches!(
            event,
            Some(ServerEvent::Error { kind: ErrorKind::AccessDenied, ref message, .. })
                if message.contains("timed out")
        ));
        assert_eq!(client.next_event().await, None);
    }

    #[tokio::test]
    async fn test_send_acks_with_request_id_before_delivery() {
        let state = state();
        let alice = user(&state, "alice").await;
        let bob = user(&state, "bob").await;
        let mut a = Client::login(&state, alice).await;
        let mut b = Client::login(&state, bob).await;

        a.send(serde_json::json!({
            "type": "send",
            "request_id": "req-1",
            "to": bob,
            "content": "hello",
            "client_ref": "tmp-1",
        }));

        let mut ack = None;
        loop {
            match a.next_event().await.expect("socket closed") {
                ServerEvent::Ack { request_id, message } => {
                    assert_eq!(request_id.as_deref(), Some("req-1"));
                    ack = message;
                }
                ServerEvent::MessageDelivered { message_id, status, .. } => {
                    let acked = ack.as_ref().expect("delivery notice arrived before the ack");
                    assert_eq!(message_id, acked.id);
                    assert_eq!(status, MessageStatus::Delivered);
                    break;
                }
                _ => {}
            }
        }
        let acked = ack.unwrap();
        assert_eq!(acked.client_ref.as_deref(), Some("tmp-1"));
        assert_eq!(acked.conversation_id, ConversationId::direct(alice, bob).unwrap());

        let pushed = b
            .expect(|e| matches!(e, ServerEvent::MessageSent { .. }))
            .await;
        assert_eq!(pushed, ServerEvent::MessageSent { message: acked });
    }

    #[tokio::test]
    async fn test_bad_frames_get_validation_errors() {
        let state = state();
        let alice = user(&state, "alice").await;
        let bob = user(&state, "bob").await;
        let mut a = Client::login(&state, alice).await;

        a.send_text("{not json".into());
        assert!(matches!(
            a.next_event().await,
            Some(ServerEvent::Error { kind: ErrorKind::Validation, request_id: None, .. })
        ));

        a.send(serde_json::json!({
            "type": "send",
            "request_id": "both",
            "to": bob,
            "conversation_id": ConversationId::direct(alice, bob).unwrap(),
            "content": "hi",
        }));
        let event = a.expect(|e| matches!(e, ServerEvent::Error { .. })).await;
        assert!(matches!(
            event,
            ServerEvent::Error { kind: ErrorKind::Validation, request_id: Some(ref id), .. } if id == "both"
        ));

        a.send(serde_json::json!({ "type": "send", "request_id": "none", "content": "hi" }));
        let event = a.expect(|e| matches!(e, ServerEvent::Error { .. })).await;
        assert!(matches!(
            event,
            ServerEvent::Error { request_id: Some(ref id), .. } if id == "none"
        ));

        // The connection survives all of the above.
        a.send(serde_json::json!({ "type": "ping" }));
        assert_eq!(a.next_event().await, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn test_send_over_user_limit_reports_error() {
        let state = test_state(None, UserRateLimiter::new(0.0, 1.0));
        let alice = user(&state, "alice").await;
        let bob = user(&state, "bob").await;
        let mut a = Client::login(&state, alice).await;

        for request_id in ["first", "second"] {
            a.send(serde_json::json!({
                "type": "send",
                "request_id": request_id,
                "to": bob,
                "content": "hi",
            }));
        }
        a.expect(|e| matches!(e, ServerEvent::Ack { .. })).await;
        let event = a.expect(|e| matches!(e, ServerEvent::Error { .. })).await;
        assert!(matches!(
            event,
            ServerEvent::Error { kind: ErrorKind::Validation, request_id: Some(ref id), .. } if id == "second"
        ));
    }

    #[tokio::test]
    async fn test_history_reply_carries_request_id() {
        let state = state();
        let alice = user(&state, "alice").await;
        let bob = user(&state, "bob").await;
        let mut a = Client::login(&state, alice).await;
        let direct = ConversationId::direct(alice, bob).unwrap();

        a.send(serde_json::json!({
            "type": "history",
            "request_id": "h1",
            "conversation_id": direct,
        }));
        let event = a.expect(|e| matches!(e, ServerEvent::History { .. })).await;
        assert!(matches!(
            event,
            ServerEvent::History { request_id: Some(ref id), ref messages, .. }
                if id == "h1" && messages.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_closing_the_socket_marks_offline() {
        let state = state();
        let alice = user(&state, "alice").await;
        let a = Client::login(&state, alice).await;
        assert!(state.router.presence().is_online(alice));

        a.to_server.close_channel();
        a.task.await.unwrap();

        assert!(!state.router.presence().is_online(alice));
        let stored = state
            .store
            .run(move |db| db.find_user(alice))
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_online);
    }
}
