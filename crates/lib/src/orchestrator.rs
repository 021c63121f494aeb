//! Stream orchestrator: owns the per-chat stream lifecycle, cancellation,
//! session switching, regenerate/retry truncation, and title generation.
//!
//! Per chat id the lifecycle is: Idle (no table entry) → Thinking (entry
//! mapped to no message yet) → Streaming (entry mapped to the growing
//! message) → Idle. Removing a chat's entry *is* the cancellation signal;
//! the consumption loop notices the missing entry at its next decoded event
//! and finalizes with whatever content had accumulated. The state lock is
//! never held across an awaited network read.

use crate::chat::{Chat, ChatId, Message, Role, DEFAULT_TITLE};
use crate::llm::{Backend, ChatMessage, LlmError, StreamEvent};
use crate::registry::ChatRegistry;
use crate::store::{ChatStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// How long a previous failure stays visible after the next send starts.
const ERROR_CLEAR_DELAY: Duration = Duration::from_millis(400);

const EVENT_CAPACITY: usize = 256;

const TITLE_SYSTEM_PROMPT: &str = "You generate chat titles. Reply with only a title of three to six words for the conversation, without quotes or trailing punctuation.";
const TITLE_PROMPT_PREFIX: &str = "Write a short title for a conversation that starts with this message:\n\n";

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Change notification emitted after every delta fold, state transition, and
/// session switch. Observers must tolerate bursts while streaming.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Request sent, no content received yet.
    Thinking { chat_id: ChatId },
    /// One content fragment was folded into the in-flight message.
    Delta { chat_id: ChatId, delta: String },
    /// The stream finished, was cancelled, or ended without content.
    StreamEnded { chat_id: ChatId },
    /// The stream failed; the chat is back in Idle and remains usable.
    StreamError { chat_id: ChatId, message: String },
    ChatSelected { index: Option<usize> },
    ChatListChanged,
    TitleUpdated { chat_id: ChatId, title: String },
}

/// Most recent failure for a chat. Cleared shortly after the next send
/// attempt for that chat.
#[derive(Debug, Clone)]
pub struct ChatError {
    pub message: String,
    /// Transport-level loss, as opposed to a protocol/auth/backend failure.
    pub connectivity: bool,
}

/// One in-flight stream. Presence in the table is the busy signal; `message`
/// distinguishes thinking (None) from streaming (Some). The epoch separates
/// a run from its replacement when a new send implicitly cancels it.
struct StreamSlot {
    epoch: u64,
    message: Option<Message>,
}

#[derive(Default)]
struct State {
    registry: ChatRegistry,
    /// Messages of the selected chat: persisted ∪ in-flight.
    visible: Vec<Message>,
    streams: HashMap<ChatId, StreamSlot>,
    errors: HashMap<ChatId, ChatError>,
    next_epoch: u64,
}

impl State {
    fn selected_is(&self, chat_id: &str) -> bool {
        self.registry.selected_chat().map(|c| c.id.as_str()) == Some(chat_id)
    }

    /// Update (or append, exactly once) the visible copy of an in-flight
    /// message.
    fn sync_visible(&mut self, msg: &Message) {
        if !self.selected_is(&msg.chat_id) {
            return;
        }
        match self.visible.iter_mut().find(|m| m.id == msg.id) {
            Some(slot) => *slot = msg.clone(),
            None => self.visible.push(msg.clone()),
        }
    }

    /// Replace any slot for the chat with a fresh Thinking slot and return
    /// its epoch. Removal and insertion happen in one step, so a superseded
    /// run can never observe the slot as absent and mistake the replacement
    /// for an explicit cancel.
    fn claim(&mut self, chat_id: &str) -> u64 {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.streams.insert(
            chat_id.to_string(),
            StreamSlot {
                epoch,
                message: None,
            },
        );
        epoch
    }
}

/// Owns the session lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    backend: Backend,
    store: Arc<dyn ChatStore>,
    state: Arc<RwLock<State>>,
    events: broadcast::Sender<ChatEvent>,
}

/// What the consumption loop should do after looking at the table.
enum RunCheck {
    Continue,
    Cancelled,
    Superseded,
}

impl Orchestrator {
    pub fn new(backend: Backend, store: Arc<dyn ChatStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            store,
            state: Arc::new(RwLock::new(State::default())),
            events,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChatEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    /// Load all chats from storage into the registry.
    pub async fn load(&self) -> Result<(), StoreError> {
        let chats = self.store.all_chats().await?;
        self.state.write().await.registry.set_chats(chats);
        self.emit(ChatEvent::ChatListChanged);
        Ok(())
    }

    /// Create a chat, register it, and select it.
    pub async fn new_chat(
        &self,
        model: &str,
        system_prompt: &str,
        options: crate::chat::GenOptions,
    ) -> Result<Chat, StoreError> {
        let mut chat = self.store.create_chat(model).await?;
        if !system_prompt.is_empty() || !options.is_empty() {
            chat.system_prompt = system_prompt.to_string();
            chat.options = options;
            self.store.update_chat(&chat).await?;
        }
        let index = {
            let mut s = self.state.write().await;
            s.registry.push(chat.clone());
            s.registry.chats().len() - 1
        };
        self.emit(ChatEvent::ChatListChanged);
        self.select_chat(Some(index)).await?;
        Ok(chat)
    }

    /// Delete a chat and whatever transient state it holds.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        self.store.delete_chat(chat_id).await?;
        {
            let mut s = self.state.write().await;
            let was_selected = s.selected_is(chat_id);
            s.registry.remove(chat_id);
            s.streams.remove(chat_id);
            s.errors.remove(chat_id);
            if was_selected {
                s.visible.clear();
            }
        }
        self.emit(ChatEvent::ChatListChanged);
        Ok(())
    }

    /// Switch the selected chat: load its persisted messages, append the
    /// in-flight message if one exists. Other chats' streams are untouched.
    pub async fn select_chat(&self, index: Option<usize>) -> Result<(), StoreError> {
        let chat_id = {
            let s = self.state.read().await;
            index.and_then(|i| s.registry.chats().get(i)).map(|c| c.id.clone())
        };
        let persisted = match &chat_id {
            Some(id) => self.store.messages(id).await?,
            None => Vec::new(),
        };
        {
            let mut s = self.state.write().await;
            s.registry.select(index);
            s.visible = persisted;
            if let Some(id) = &chat_id {
                if let Some(slot) = s.streams.get(id) {
                    if let Some(partial) = slot.message.clone() {
                        s.visible.push(partial);
                    }
                }
            }
        }
        self.emit(ChatEvent::ChatSelected { index });
        Ok(())
    }

    pub async fn chats(&self) -> Vec<Chat> {
        self.state.read().await.registry.chats().to_vec()
    }

    pub async fn selected_index(&self) -> Option<usize> {
        self.state.read().await.registry.selected_index()
    }

    /// The selected chat's messages: persisted plus the in-flight one.
    pub async fn visible_messages(&self) -> Vec<Message> {
        self.state.read().await.visible.clone()
    }

    /// True while the chat has an in-flight stream (thinking or streaming).
    pub async fn is_busy(&self, chat_id: &str) -> bool {
        self.state.read().await.streams.contains_key(chat_id)
    }

    /// The in-flight message, if the chat is actively streaming (None while
    /// idle or still thinking).
    pub async fn in_flight(&self, chat_id: &str) -> Option<Message> {
        self.state
            .read()
            .await
            .streams
            .get(chat_id)
            .and_then(|slot| slot.message.clone())
    }

    pub async fn chat_error(&self, chat_id: &str) -> Option<ChatError> {
        self.state.read().await.errors.get(chat_id).cloned()
    }

    /// Number of chats with an in-flight stream.
    pub async fn active_streams(&self) -> usize {
        self.state.read().await.streams.len()
    }

    /// Persist a user message and start generating the reply. Any stream
    /// already running for this chat is superseded by the new slot.
    pub async fn send_prompt(
        &self,
        chat_id: &str,
        text: &str,
        images: Vec<String>,
    ) -> Result<(), StoreError> {
        let message = Message::user(chat_id, text, images);
        let epoch = { self.state.write().await.claim(chat_id) };
        self.clear_error_later(chat_id);
        if let Err(e) = self.store.add_message(&message).await {
            self.release(chat_id, epoch).await;
            return Err(e);
        }
        {
            let mut s = self.state.write().await;
            if s.selected_is(chat_id) {
                s.visible.push(message.clone());
            }
        }
        self.start_generation(chat_id, epoch).await
    }

    /// Remove the chat's table entry. The consumption loop notices at its
    /// next decoded event and finalizes with the accumulated content;
    /// bytes already in flight are discarded.
    pub async fn cancel(&self, chat_id: &str) {
        let removed = self.state.write().await.streams.remove(chat_id).is_some();
        if removed {
            log::debug!("chat {}: cancellation requested", chat_id);
        }
    }

    /// Truncate history at the target message and re-run generation. An
    /// assistant target is removed together with everything after it; a user
    /// target is removed and re-sent as a fresh user turn.
    pub async fn regenerate(&self, chat_id: &str, message_id: &str) -> Result<(), StoreError> {
        let history = self.store.messages(chat_id).await?;
        let Some(index) = history.iter().position(|m| m.id == message_id) else {
            return Ok(());
        };
        let target = history[index].clone();
        let removed: Vec<String> = history[index..].iter().map(|m| m.id.clone()).collect();
        // Claim before touching storage so a run still streaming is
        // superseded, not cancelled, while the tail is deleted.
        let epoch = { self.state.write().await.claim(chat_id) };
        self.clear_error_later(chat_id);
        if let Err(e) = self.store.delete_messages(chat_id, &removed).await {
            self.release(chat_id, epoch).await;
            return Err(e);
        }
        {
            let mut s = self.state.write().await;
            if s.selected_is(chat_id) {
                s.visible.retain(|m| !removed.contains(&m.id));
            }
        }
        match target.role {
            Role::User => self.send_prompt(chat_id, &target.content, target.images).await,
            Role::Assistant => self.start_generation(chat_id, epoch).await,
        }
    }

    /// Drop a trailing assistant message if there is one, then re-run
    /// generation over the unchanged remaining history.
    pub async fn retry_last(&self, chat_id: &str) -> Result<(), StoreError> {
        let epoch = { self.state.write().await.claim(chat_id) };
        self.clear_error_later(chat_id);
        let history = match self.store.messages(chat_id).await {
            Ok(h) => h,
            Err(e) => {
                self.release(chat_id, epoch).await;
                return Err(e);
            }
        };
        if let Some(last) = history.last() {
            if last.role == Role::Assistant {
                if let Err(e) = self
                    .store
                    .delete_messages(chat_id, &[last.id.clone()])
                    .await
                {
                    self.release(chat_id, epoch).await;
                    return Err(e);
                }
                let mut s = self.state.write().await;
                if s.selected_is(chat_id) {
                    let last_id = last.id.clone();
                    s.visible.retain(|m| m.id != last_id);
                }
            }
        }
        self.start_generation(chat_id, epoch).await
    }

    /// Spawn the consumption loop for an already-claimed slot over the
    /// chat's current persisted history.
    async fn start_generation(&self, chat_id: &str, epoch: u64) -> Result<(), StoreError> {
        let chat = {
            let s = self.state.read().await;
            s.registry.chat(chat_id).cloned()
        };
        let chat = match chat {
            Some(c) => Some(c),
            None => match self.store.get_chat(chat_id).await {
                Ok(c) => c,
                Err(e) => {
                    self.release(chat_id, epoch).await;
                    return Err(e);
                }
            },
        };
        let Some(chat) = chat else {
            self.release(chat_id, epoch).await;
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        };
        let history = match self.store.messages(chat_id).await {
            Ok(h) => h,
            Err(e) => {
                self.release(chat_id, epoch).await;
                return Err(e);
            }
        };
        self.emit(ChatEvent::Thinking {
            chat_id: chat_id.to_string(),
        });
        let this = self.clone();
        let id = chat_id.to_string();
        tokio::spawn(async move {
            this.run_generation(id, epoch, chat, history).await;
        });
        Ok(())
    }

    /// Drop a claimed slot after a setup failure, unless a newer claim has
    /// already replaced it.
    async fn release(&self, chat_id: &str, epoch: u64) {
        let mut s = self.state.write().await;
        if s.streams.get(chat_id).is_some_and(|slot| slot.epoch == epoch) {
            s.streams.remove(chat_id);
        }
    }

    async fn run_generation(&self, chat_id: ChatId, epoch: u64, chat: Chat, history: Vec<Message>) {
        let wire: Vec<ChatMessage> = history.iter().map(to_wire).collect();
        let system = (!chat.system_prompt.trim().is_empty()).then_some(chat.system_prompt.as_str());
        let mut stream = match self
            .backend
            .stream_chat(&chat.model, wire, system, &chat.options)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                self.fail(&chat_id, epoch, e).await;
                return;
            }
        };

        // Working copy of the growing message; the table holds a mirror.
        let mut assembled: Option<Message> = None;
        while let Some(event) = stream.next().await {
            let event = match event {
                Ok(ev) => ev,
                Err(e) => {
                    self.fail(&chat_id, epoch, e).await;
                    return;
                }
            };
            match event {
                StreamEvent::Delta(delta) => {
                    let mut s = self.state.write().await;
                    match check_run(&s, &chat_id, epoch) {
                        RunCheck::Continue => {}
                        RunCheck::Cancelled => {
                            drop(s);
                            self.finalize(&chat_id, epoch, assembled.take()).await;
                            return;
                        }
                        RunCheck::Superseded => return,
                    }
                    let msg =
                        assembled.get_or_insert_with(|| Message::assistant_partial(&chat_id));
                    msg.content.push_str(&delta);
                    let mirror = msg.clone();
                    s.sync_visible(&mirror);
                    if let Some(slot) = s.streams.get_mut(&chat_id) {
                        slot.message = Some(mirror);
                    }
                    drop(s);
                    self.emit(ChatEvent::Delta {
                        chat_id: chat_id.clone(),
                        delta,
                    });
                }
                StreamEvent::Done { content } => {
                    {
                        let s = self.state.read().await;
                        match check_run(&s, &chat_id, epoch) {
                            RunCheck::Superseded => return,
                            // Cancelled or still active: either way this is
                            // the last event; finalize below.
                            _ => {}
                        }
                    }
                    // The terminal frame is authoritative for the full
                    // content.
                    match assembled.as_mut() {
                        Some(m) => m.content = content,
                        None if !content.is_empty() => {
                            let mut m = Message::assistant_partial(&chat_id);
                            m.content = content;
                            assembled = Some(m);
                        }
                        None => {}
                    }
                    self.finalize(&chat_id, epoch, assembled.take()).await;
                    return;
                }
            }
        }
        // Stream exhausted without a terminal frame.
        {
            let s = self.state.read().await;
            if matches!(check_run(&s, &chat_id, epoch), RunCheck::Superseded) {
                return;
            }
        }
        self.finalize(&chat_id, epoch, assembled.take()).await;
    }

    /// Leave the streaming state: timestamp and persist the assembled
    /// message (if any content was produced), drop the table entry.
    async fn finalize(&self, chat_id: &str, epoch: u64, assembled: Option<Message>) {
        let message = assembled.map(|mut m| {
            m.done = true;
            m.created_at = Utc::now();
            m
        });
        {
            let mut s = self.state.write().await;
            // Only drop the entry if it still belongs to this run; a newer
            // send may have taken the slot since cancellation was detected.
            if s.streams.get(chat_id).is_some_and(|slot| slot.epoch == epoch) {
                s.streams.remove(chat_id);
            }
            if let Some(m) = &message {
                s.sync_visible(m);
            }
        }
        if let Some(m) = &message {
            if let Err(e) = self.store.add_message(m).await {
                log::warn!("chat {}: persisting assistant message failed: {}", chat_id, e);
            }
        }
        self.emit(ChatEvent::StreamEnded {
            chat_id: chat_id.to_string(),
        });
    }

    /// Record a per-chat error and return the chat to Idle. Never fatal.
    async fn fail(&self, chat_id: &str, epoch: u64, error: LlmError) {
        let connectivity = error.is_connectivity();
        let message = if connectivity {
            format!("lost connection to the {}: {}", self.backend.name(), error)
        } else {
            error.to_string()
        };
        {
            let mut s = self.state.write().await;
            match check_run(&s, chat_id, epoch) {
                RunCheck::Continue => {}
                // Already cancelled or replaced: the failure of this run is
                // of no interest any more.
                RunCheck::Cancelled | RunCheck::Superseded => return,
            }
            s.streams.remove(chat_id);
            s.errors.insert(
                chat_id.to_string(),
                ChatError {
                    message: message.clone(),
                    connectivity,
                },
            );
        }
        log::warn!("chat {}: stream failed: {}", chat_id, message);
        self.emit(ChatEvent::StreamError {
            chat_id: chat_id.to_string(),
            message,
        });
    }

    /// Keep the previous failure on screen briefly before the new attempt
    /// replaces it.
    fn clear_error_later(&self, chat_id: &str) {
        let state = self.state.clone();
        let id = chat_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ERROR_CLEAR_DELAY).await;
            state.write().await.errors.remove(&id);
        });
    }

    /// Generate a title from the chat's first user message as an independent
    /// side-stream. Not tracked in the stream table: it cannot be cancelled
    /// by entry removal and neither blocks nor is blocked by the chat stream.
    pub async fn generate_title(&self, chat_id: &str) -> Result<(), StoreError> {
        let chat = {
            let s = self.state.read().await;
            s.registry.chat(chat_id).cloned()
        };
        let chat = match chat {
            Some(c) => c,
            None => self
                .store
                .get_chat(chat_id)
                .await?
                .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?,
        };
        let first_user = self
            .store
            .messages(chat_id)
            .await?
            .into_iter()
            .find(|m| m.role == Role::User);
        let Some(first_user) = first_user else {
            return Ok(());
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.run_title_stream(chat, first_user.content).await;
        });
        Ok(())
    }

    async fn run_title_stream(&self, chat: Chat, first_user: String) {
        let prompt = format!("{}{}", TITLE_PROMPT_PREFIX, first_user);
        let mut stream = match self
            .backend
            .stream_chat(
                &chat.model,
                vec![ChatMessage::user(prompt)],
                Some(TITLE_SYSTEM_PROMPT),
                &crate::chat::GenOptions::default(),
            )
            .await
        {
            Ok(s) => s,
            Err(e) => {
                log::warn!("chat {}: title generation failed: {}", chat.id, e);
                return;
            }
        };
        let mut accumulated = String::new();
        loop {
            match stream.next().await {
                Some(Ok(StreamEvent::Delta(delta))) => {
                    accumulated.push_str(&delta);
                    self.set_title(&chat.id, live_title(&accumulated), false).await;
                }
                Some(Ok(StreamEvent::Done { content })) => {
                    accumulated = content;
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("chat {}: title stream failed: {}", chat.id, e);
                    return;
                }
                None => break,
            }
        }
        let title = strip_think(&accumulated).trim().to_string();
        let title = if title.is_empty() {
            DEFAULT_TITLE.to_string()
        } else {
            title
        };
        self.set_title(&chat.id, title, true).await;
    }

    async fn set_title(&self, chat_id: &str, title: String, persist: bool) {
        let updated = {
            let mut s = self.state.write().await;
            match s.registry.chat_mut(chat_id) {
                Some(c) => {
                    c.title = title.clone();
                    Some(c.clone())
                }
                None => None,
            }
        };
        if persist {
            // Chats resolved through the store fallback never hit the
            // registry; update their stored record directly.
            let chat = match updated {
                Some(c) => Some(c),
                None => match self.store.get_chat(chat_id).await {
                    Ok(Some(mut c)) => {
                        c.title = title.clone();
                        Some(c)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("chat {}: loading chat for title update failed: {}", chat_id, e);
                        None
                    }
                },
            };
            if let Some(chat) = chat {
                if let Err(e) = self.store.update_chat(&chat).await {
                    log::warn!("chat {}: persisting title failed: {}", chat_id, e);
                }
            }
        }
        self.emit(ChatEvent::TitleUpdated {
            chat_id: chat_id.to_string(),
            title,
        });
    }
}

fn check_run(state: &State, chat_id: &str, epoch: u64) -> RunCheck {
    match state.streams.get(chat_id) {
        Some(slot) if slot.epoch == epoch => RunCheck::Continue,
        // A newer send took the slot; its loop owns the chat now, and this
        // run's partial output must not be persisted over the new history.
        Some(_) => RunCheck::Superseded,
        None => RunCheck::Cancelled,
    }
}

fn to_wire(message: &Message) -> ChatMessage {
    ChatMessage {
        role: message.role.as_str().to_string(),
        content: message.content.clone(),
        images: (!message.images.is_empty()).then(|| message.images.clone()),
    }
}

/// Title shown while the stream is still running: the placeholder while a
/// reasoning model is inside an unclosed thinking tag, the stripped text
/// otherwise.
fn live_title(accumulated: &str) -> String {
    let trimmed = accumulated.trim_start();
    if trimmed.starts_with(THINK_OPEN) && !trimmed.contains(THINK_CLOSE) {
        return DEFAULT_TITLE.to_string();
    }
    let title = strip_think(accumulated).trim().to_string();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

/// Remove a leading `<think>…</think>` span. An unclosed tag means the whole
/// text was reasoning.
fn strip_think(text: &str) -> String {
    let trimmed = text.trim_start();
    match trimmed.strip_prefix(THINK_OPEN) {
        Some(rest) => match rest.find(THINK_CLOSE) {
            Some(end) => rest[end + THINK_CLOSE.len()..].to_string(),
            None => String::new(),
        },
        None => text.to_string(),
    }
}
