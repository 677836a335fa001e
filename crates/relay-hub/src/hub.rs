use crate::upstream::{with_idle_timeout, UpstreamClient};
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use relay_core::store::{ConversationRecord, MessageRecord, SessionStore, StoreError};
use relay_core::wire::{
    answer_id, decode_request, encode_event, format_ts, ClientRequest, ConversationRefPayload,
    ConversationRenamedPayload, ConversationView, ConversationsPayload, MessageRole, MessageView,
    MessagesPayload, NewMessagePayload, ServerEvent,
};
use relay_core::{
    reconcile_stream, DeliverySink, FallbackReason, ReasoningExtractor, ReconcileOutcome,
    Reconciler, RequestScope,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

pub const DEFAULT_FALLBACK_REPLY: &str =
    "Sorry, the assistant is unavailable right now. Please try again in a moment.";

const OUTBOUND_QUEUE: usize = 256;
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub max_connections: usize,
    pub max_inbound_bytes: usize,
    pub write_timeout: Duration,
    pub fallback_reply: String,
    pub debug: bool,
}

pub struct Client {
    conn_id: String,
    remote: Option<SocketAddr>,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_event(&self, event: &ServerEvent) -> bool {
        let text = match encode_event(event) {
            Ok(text) => text,
            Err(err) => {
                error!(
                    event = "encode_failed",
                    conn_id = %self.conn_id,
                    kind = event.kind(),
                    error = %err
                );
                return false;
            }
        };
        self.sender.send(Message::Text(text)).await.is_ok()
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

/// Delivery path for one request. Sends after the socket is gone are dropped.
struct ClientSink {
    client: Arc<Client>,
}

#[async_trait]
impl DeliverySink for ClientSink {
    async fn push(&self, event: ServerEvent) {
        if !self.client.send_event(&event).await {
            debug!(event = "push_dropped", conn_id = %self.client.conn_id, kind = event.kind());
        }
    }
}

pub struct HubState {
    config: HubConfig,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    store: Arc<dyn SessionStore>,
    upstream: UpstreamClient,
    extractor: ReasoningExtractor,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        store: Arc<dyn SessionStore>,
        upstream: UpstreamClient,
        extractor: ReasoningExtractor,
    ) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            store,
            upstream,
            extractor,
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn register_client(&self, client: Arc<Client>) -> bool {
        let mut clients = self.clients.write().await;
        if clients.len() >= self.config.max_connections {
            warn!(
                event = "connection_refused",
                conn_id = %client.conn_id,
                active = clients.len(),
                max = self.config.max_connections
            );
            return false;
        }
        clients.insert(client.conn_id.clone(), client.clone());
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            remote = ?client.remote,
            active = clients.len()
        );
        true
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        client.close(CLOSE_NORMAL, reason).await;
        self.clients.write().await.remove(&client.conn_id);
        info!(event = "client_disconnected", conn_id = %client.conn_id, reason = reason);
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            remote: Some(remote),
            sender: tx,
        });
        if !self.register_client(client.clone()).await {
            let details = format!("connection limit {} reached", self.config.max_connections);
            client
                .send_event(&ServerEvent::error("server busy", Some(details)))
                .await;
            client.close(CLOSE_TRY_AGAIN_LATER, "busy").await;
            drop(client);
            let _ = write_task.await;
            return;
        }

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            self.handle_frame(&client, &data).await;
        }

        self.remove_client(&client, "disconnect").await;
        drop(client);
        let _ = write_task.await;
    }

    /// Decodes and serves one inbound frame. Failures are answered with an
    /// `error` event; the connection stays open.
    async fn handle_frame(self: &Arc<Self>, client: &Arc<Client>, data: &[u8]) {
        if self.config.debug {
            debug!(
                event = "message_received",
                conn_id = %client.conn_id,
                raw = %String::from_utf8_lossy(data)
            );
        }
        let request = match decode_request(data, self.config.max_inbound_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                client
                    .send_event(&ServerEvent::error("invalid request", Some(err.to_string())))
                    .await;
                return;
            }
        };
        let kind = request.kind();
        if let Err(err) = self.dispatch(client, request).await {
            warn!(event = "request_failed", conn_id = %client.conn_id, kind = kind, error = %err);
            client
                .send_event(&ServerEvent::error(
                    store_error_message(&err),
                    Some(err.to_string()),
                ))
                .await;
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        client: &Arc<Client>,
        request: ClientRequest,
    ) -> Result<(), StoreError> {
        match request {
            ClientRequest::NewMessage(payload) => self.start_exchange(client, payload).await,
            ClientRequest::GetConversations(payload) => {
                let conversations = self.store.list_conversations(&payload.user_id)?;
                let event = ServerEvent::Conversations(ConversationsPayload {
                    conversations: conversations.iter().map(ConversationView::from).collect(),
                });
                client.send_event(&event).await;
                Ok(())
            }
            ClientRequest::GetMessages(payload) => {
                let records = self.store.list_messages(&payload.conversation_id)?;
                let event = ServerEvent::Messages(MessagesPayload {
                    conversation_id: payload.conversation_id,
                    messages: message_views(&records),
                });
                client.send_event(&event).await;
                Ok(())
            }
            ClientRequest::CreateConversation(payload) => {
                let record = self
                    .store
                    .create_conversation(&payload.user_id, payload.title.as_deref())?;
                info!(
                    event = "conversation_created",
                    conn_id = %client.conn_id,
                    conversation_id = %record.id
                );
                client
                    .send_event(&ServerEvent::ConversationCreated(ConversationRefPayload {
                        conversation_id: record.id,
                    }))
                    .await;
                Ok(())
            }
            ClientRequest::DeleteConversation(payload) => {
                self.store
                    .delete_conversation(&payload.conversation_id, &payload.user_id)?;
                info!(
                    event = "conversation_deleted",
                    conn_id = %client.conn_id,
                    conversation_id = %payload.conversation_id
                );
                client
                    .send_event(&ServerEvent::ConversationDeleted(ConversationRefPayload {
                        conversation_id: payload.conversation_id,
                    }))
                    .await;
                Ok(())
            }
            ClientRequest::RenameConversation(payload) => {
                let record = self.store.rename_conversation(
                    &payload.conversation_id,
                    &payload.user_id,
                    &payload.title,
                )?;
                client
                    .send_event(&ServerEvent::ConversationRenamed(
                        ConversationRenamedPayload {
                            conversation_id: record.id,
                            title: record.title,
                        },
                    ))
                    .await;
                Ok(())
            }
        }
    }

    /// Persists the user turn and hands the upstream call to its own task.
    async fn start_exchange(
        self: &Arc<Self>,
        client: &Arc<Client>,
        payload: NewMessagePayload,
    ) -> Result<(), StoreError> {
        let requested = payload
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let known = match requested {
            Some(id) => self.store.conversation(id)?.is_some(),
            None => false,
        };
        let conversation = self
            .store
            .resolve_or_create_conversation(requested, &payload.user_id)?;
        if !known {
            info!(
                event = "conversation_created",
                conn_id = %client.conn_id,
                conversation_id = %conversation.id,
                implicit = true
            );
            client
                .send_event(&ServerEvent::ConversationCreated(ConversationRefPayload {
                    conversation_id: conversation.id.clone(),
                }))
                .await;
        }

        let message = self.store.append_user_query(
            &conversation.id,
            &payload.message,
            payload.helper.as_deref(),
        )?;
        client
            .send_event(&ServerEvent::Message(MessageView::user_turn(&message)))
            .await;

        let hub = Arc::clone(self);
        let client = Arc::clone(client);
        tokio::spawn(async move {
            hub.run_exchange(client, conversation, message).await;
        });
        Ok(())
    }

    async fn run_exchange(
        self: Arc<Self>,
        client: Arc<Client>,
        conversation: ConversationRecord,
        message: MessageRecord,
    ) {
        let sink = ClientSink { client };
        let mut scope = RequestScope {
            conversation_id: conversation.id,
            message_id: message.id,
            created_at: message.created_at,
            known_upstream_session: conversation.upstream_session_id,
        };
        let request = self.upstream.request(
            &message.query,
            scope.known_upstream_session.as_deref(),
            message.helper.as_deref(),
        );

        let outcome = match self.upstream.open(&request).await {
            Ok(opened) => {
                if opened.session_dropped {
                    scope.known_upstream_session = None;
                    if let Err(err) = self
                        .store
                        .set_upstream_session_id(&scope.conversation_id, None)
                    {
                        warn!(
                            event = "upstream_session_clear_failed",
                            conversation_id = %scope.conversation_id,
                            error = %err
                        );
                    }
                }
                let reconciler = Reconciler::new(scope.clone(), self.extractor.clone());
                let chunks = with_idle_timeout(
                    opened.response.bytes_stream(),
                    self.upstream.config().idle_timeout,
                );
                reconcile_stream(chunks, reconciler, self.store.as_ref(), &sink).await
            }
            Err(err) => {
                warn!(event = "upstream_unavailable", message_id = %scope.message_id, error = %err);
                ReconcileOutcome::Fallback(FallbackReason::Transport(err.to_string()))
            }
        };

        match outcome {
            ReconcileOutcome::Completed {
                text,
                upstream_session_id,
                ..
            } => {
                info!(
                    event = "exchange_completed",
                    conn_id = %sink.client.conn_id,
                    conversation_id = %scope.conversation_id,
                    message_id = %scope.message_id,
                    upstream_session_id = upstream_session_id.as_deref().unwrap_or(""),
                    chars = text.chars().count()
                );
            }
            ReconcileOutcome::Fallback(reason) => {
                self.emit_fallback(&sink, &scope, &reason).await;
            }
        }
    }

    async fn emit_fallback(
        &self,
        sink: &ClientSink,
        scope: &RequestScope,
        reason: &FallbackReason,
    ) {
        warn!(
            event = "fallback_reply",
            conversation_id = %scope.conversation_id,
            message_id = %scope.message_id,
            reason = %reason
        );
        let reply = self.config.fallback_reply.clone();
        sink.push(ServerEvent::StreamingMessage(MessageView {
            id: answer_id(&scope.message_id),
            conversation_id: scope.conversation_id.clone(),
            role: MessageRole::Assistant,
            content: reply.clone(),
            thinks: Vec::new(),
            is_streaming: false,
            created_at: format_ts(scope.created_at),
        }))
        .await;
        if let Err(err) = self.store.finalize_answer(&scope.message_id, &reply, &[]) {
            error!(event = "fallback_persist_failed", message_id = %scope.message_id, error = %err);
        }
    }
}

fn message_views(records: &[MessageRecord]) -> Vec<MessageView> {
    let mut views = Vec::with_capacity(records.len() * 2);
    for record in records {
        views.push(MessageView::user_turn(record));
        if let Some(answer) = MessageView::assistant_turn(record) {
            views.push(answer);
        }
    }
    views
}

fn store_error_message(err: &StoreError) -> &'static str {
    match err {
        StoreError::ConversationNotFound(_) => "conversation not found",
        StoreError::MessageNotFound(_) => "message not found",
        StoreError::NotOwner { .. } => "not allowed",
        StoreError::AlreadyFinalized(_) => "answer already finalized",
        StoreError::Backend(_) => "storage unavailable",
    }
}
