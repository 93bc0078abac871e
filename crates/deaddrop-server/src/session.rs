use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deaddrop_shared::constants::{CODE_ALLOC_MAX_ATTEMPTS, MAX_MESSAGE_SIZE};
use deaddrop_shared::protocol::{MessageBody, ServerEvent, StoredMessage};
use deaddrop_shared::types::{ClientToken, PairingCode};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::storage::FileStore;
use crate::ws::{self, ConnectionSender};

/// One participant's seat. A session holds at most two of these, ever;
/// a seat outlives its connection so the same peer can rejoin.
struct ClientSlot {
    channel_id: Uuid,
    connected: bool,
    sender: Option<ConnectionSender>,
}

struct Session {
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    /// Set on the first message or completed upload; never cleared.
    has_activity: bool,
    clients: HashMap<ClientToken, ClientSlot>,
    history: Vec<StoredMessage>,
    last_timestamp_ms: i64,
    storage_used: u64,
    /// Pending deletion timer. Set iff zero clients are connected.
    cleanup: Option<JoinHandle<()>>,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_activity: now,
            has_activity: false,
            clients: HashMap::new(),
            history: Vec::new(),
            last_timestamp_ms: 0,
            storage_used: 0,
            cleanup: None,
        }
    }

    fn connected_count(&self) -> usize {
        self.clients.values().filter(|c| c.connected).count()
    }

    fn cancel_cleanup(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.cancel_cleanup();
    }

    /// Push an event to every connected member, including the sender of
    /// whatever triggered it. Senders are unbounded channels, so this is
    /// safe to call while holding the session lock; that is what gives
    /// each client snapshot-then-live ordering.
    fn broadcast(&self, event: &ServerEvent) {
        for slot in self.clients.values() {
            if slot.connected {
                if let Some(tx) = &slot.sender {
                    ws::send_event(tx, event);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct JoinOutcome {
    pub token: ClientToken,
    pub rejoined: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    pub active: usize,
    pub max: i64,
    pub available: i64,
    pub usage_percent: f64,
    pub unlimited: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StorageStatus {
    pub current: u64,
    pub limit: i64,
    pub file_count: u64,
    pub unlimited: bool,
}

/// Registry of live sessions plus all lifecycle policy: admission,
/// reconnect identity, history fan-out, quota reads, and tiered expiry.
///
/// Locking: the registry mutex guards the map; each session has its own
/// mutex. The registry lock may be held while taking a session lock
/// (deletion path) but never the other way around. No filesystem I/O
/// happens under a session lock.
pub struct SessionManager {
    sessions: Mutex<HashMap<PairingCode, Arc<Mutex<Session>>>>,
    store: Arc<FileStore>,
    config: Arc<ServerConfig>,
}

impl SessionManager {
    pub fn new(store: Arc<FileStore>, config: Arc<ServerConfig>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            config,
        })
    }

    /// Mint a pairing code and register an empty session under it. The
    /// storage tree is pre-created best-effort; upload paths re-create it
    /// on demand if this fails.
    pub async fn create_session(&self) -> Result<PairingCode, ServerError> {
        let code = {
            let mut sessions = self.sessions.lock().await;

            if !self.config.unlimited_sessions()
                && sessions.len() as i64 >= self.config.max_active_sessions
            {
                return Err(ServerError::SessionCapReached {
                    active: sessions.len(),
                    max: self.config.max_active_sessions,
                });
            }

            let mut picked = None;
            for _ in 0..CODE_ALLOC_MAX_ATTEMPTS {
                let candidate = PairingCode::random();
                if !sessions.contains_key(&candidate) {
                    picked = Some(candidate);
                    break;
                }
            }
            let code = picked.ok_or(ServerError::CodeSpaceExhausted)?;

            sessions.insert(code.clone(), Arc::new(Mutex::new(Session::new())));
            code
        };

        if let Err(e) = self.store.create_session_tree(&code).await {
            warn!(code = %code, error = %e, "Failed to pre-create session tree");
        }

        info!(code = %code, "Session created");
        Ok(code)
    }

    async fn get(&self, code: &PairingCode) -> Result<Arc<Mutex<Session>>, ServerError> {
        self.sessions
            .lock()
            .await
            .get(code)
            .cloned()
            .ok_or(ServerError::InvalidCode)
    }

    pub async fn session_exists(&self, code: &PairingCode) -> bool {
        self.sessions.lock().await.contains_key(code)
    }

    /// Admit a connection into a session's room.
    ///
    /// A presented token that matches an existing seat reconnects it; a
    /// missing or unknown token claims a fresh seat if the session has one
    /// to give. The history snapshot and any `userConnected` notification
    /// are queued to the joiner inside the critical section, so no
    /// concurrent broadcast can be lost or reordered around the snapshot.
    pub async fn join_session(
        &self,
        code: &PairingCode,
        presented: Option<ClientToken>,
        channel_id: Uuid,
        sender: ConnectionSender,
    ) -> Result<JoinOutcome, ServerError> {
        let session = self.get(code).await?;
        let mut state = session.lock().await;
        let was_full = state.connected_count() >= 2;

        if let Some(token) = presented {
            if let Some(slot) = state.clients.get_mut(&token) {
                slot.connected = true;
                slot.channel_id = channel_id;
                slot.sender = Some(sender.clone());
                state.cancel_cleanup();

                ws::send_event(
                    &sender,
                    &ServerEvent::SessionJoined {
                        client_token: token,
                        history: state.history.clone(),
                    },
                );
                if !was_full && state.connected_count() == 2 {
                    state.broadcast(&ServerEvent::UserConnected);
                }

                info!(code = %code, client = %token, "Client reconnected");
                return Ok(JoinOutcome {
                    token,
                    rejoined: true,
                });
            }
        }

        // Both seats taken, connected or not: a disconnected peer keeps
        // its seat for the whole grace window.
        if was_full || state.clients.len() >= 2 {
            return Err(ServerError::SessionFull);
        }

        let token = ClientToken::new();
        state.clients.insert(
            token,
            ClientSlot {
                channel_id,
                connected: true,
                sender: Some(sender.clone()),
            },
        );
        state.cancel_cleanup();

        ws::send_event(
            &sender,
            &ServerEvent::SessionJoined {
                client_token: token,
                history: state.history.clone(),
            },
        );
        if state.connected_count() == 2 {
            state.broadcast(&ServerEvent::UserConnected);
        }

        info!(code = %code, client = %token, "Client joined");
        Ok(JoinOutcome {
            token,
            rejoined: false,
        })
    }

    /// Transport closed. Marks the owning seat disconnected and, if the
    /// room is now empty, starts the tiered deletion timer. A channel id
    /// superseded by a reconnect no longer matches its seat and is
    /// ignored.
    pub async fn handle_disconnect(self: &Arc<Self>, code: &PairingCode, channel_id: Uuid) {
        let Ok(session) = self.get(code).await else {
            return;
        };
        let mut state = session.lock().await;

        let owner = state
            .clients
            .iter()
            .find(|(_, slot)| slot.connected && slot.channel_id == channel_id)
            .map(|(token, _)| *token);
        let Some(token) = owner else {
            return;
        };

        if let Some(slot) = state.clients.get_mut(&token) {
            slot.connected = false;
            slot.sender = None;
        }
        debug!(code = %code, client = %token, "Client disconnected");

        state.broadcast(&ServerEvent::UserDisconnected);

        if state.connected_count() == 0 {
            let grace = self.grace_for(&state);
            self.schedule_cleanup(code, &mut state, grace);
        }
    }

    /// Stamp, append, and fan out a message. The caller must be a
    /// currently connected member of the session.
    pub async fn append_message(
        &self,
        code: &PairingCode,
        token: ClientToken,
        body: MessageBody,
    ) -> Result<StoredMessage, ServerError> {
        if body.payload_len() > MAX_MESSAGE_SIZE {
            return Err(ServerError::BadRequest(format!(
                "Message exceeds {MAX_MESSAGE_SIZE} bytes"
            )));
        }

        let session = self.get(code).await?;
        let mut state = session.lock().await;

        match state.clients.get(&token) {
            Some(slot) if slot.connected => {}
            _ => return Err(ServerError::NotConnected),
        }

        // Monotonic per session so clients can deduplicate reliably.
        let timestamp = Utc::now()
            .timestamp_millis()
            .max(state.last_timestamp_ms + 1);
        state.last_timestamp_ms = timestamp;

        let stored = StoredMessage {
            body,
            sender: token,
            timestamp,
        };
        state.history.push(stored.clone());
        state.has_activity = true;
        state.touch();

        state.broadcast(&ServerEvent::ReceiveMessage(stored.clone()));
        Ok(stored)
    }

    /// Advisory quota gate. Scan failures allow the upload: a flaky disk
    /// must not turn into a denial of service.
    pub async fn check_quota(
        &self,
        code: &PairingCode,
        additional: u64,
    ) -> Result<(), ServerError> {
        self.get(code).await?;

        if self.config.unlimited_storage() {
            return Ok(());
        }
        let limit = self.config.max_session_storage_bytes as u64;

        let current = match self.store.session_usage(code).await {
            Ok(usage) => usage.bytes,
            Err(e) => {
                warn!(code = %code, error = %e, "Quota scan failed, allowing upload");
                return Ok(());
            }
        };

        if current.saturating_add(additional) > limit {
            return Err(ServerError::QuotaExceeded { current, limit });
        }
        Ok(())
    }

    /// Record bytes that landed on disk. Counts as activity.
    pub async fn account_storage(
        &self,
        code: &PairingCode,
        added: u64,
    ) -> Result<(), ServerError> {
        let session = self.get(code).await?;
        let mut state = session.lock().await;
        state.storage_used = state.storage_used.saturating_add(added);
        state.has_activity = true;
        state.touch();
        debug!(code = %code, added, total = state.storage_used, "Storage accounted");
        Ok(())
    }

    pub async fn storage_status(&self, code: &PairingCode) -> Result<StorageStatus, ServerError> {
        self.get(code).await?;

        let usage = match self.store.session_usage(code).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(code = %code, error = %e, "Usage scan failed, reporting zero");
                Default::default()
            }
        };

        Ok(StorageStatus {
            current: usage.bytes,
            limit: self.config.max_session_storage_bytes,
            file_count: usage.file_count,
            unlimited: self.config.unlimited_storage(),
        })
    }

    pub async fn stats(&self) -> SessionStats {
        let active = self.sessions.lock().await.len();
        let max = self.config.max_active_sessions;
        if self.config.unlimited_sessions() {
            SessionStats {
                active,
                max,
                available: -1,
                usage_percent: 0.0,
                unlimited: true,
            }
        } else {
            SessionStats {
                active,
                max,
                available: (max - active as i64).max(0),
                usage_percent: if max > 0 {
                    active as f64 * 100.0 / max as f64
                } else {
                    100.0
                },
                unlimited: false,
            }
        }
    }

    fn grace_for(&self, state: &Session) -> Duration {
        Duration::from_secs(if state.has_activity {
            self.config.active_session_grace_secs
        } else {
            self.config.unused_session_grace_secs
        })
    }

    /// Arm the deletion timer. The spawned task holds only the pairing
    /// code; when it fires it re-looks the session up and re-verifies
    /// emptiness under the mutex, so it can never race a reconnect.
    fn schedule_cleanup(self: &Arc<Self>, code: &PairingCode, state: &mut Session, grace: Duration) {
        state.cancel_cleanup();

        debug!(code = %code, grace_secs = grace.as_secs(), "Cleanup timer armed");
        let manager = Arc::clone(self);
        let code = code.clone();
        state.cleanup = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.expire_if_idle(&code).await;
        }));
    }

    /// Delete the session iff it still has zero connected clients.
    /// Registry entry and on-disk tree go together.
    async fn expire_if_idle(&self, code: &PairingCode) {
        let age_secs = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(code) else {
                return;
            };
            let session = Arc::clone(session);
            let state = session.lock().await;
            if state.connected_count() > 0 {
                return;
            }
            let age_secs = Utc::now()
                .signed_duration_since(state.created_at)
                .num_seconds();
            drop(state);
            sessions.remove(code);
            age_secs
        };

        info!(code = %code, age_secs, "Session expired");
        if let Err(e) = self.store.delete_session_tree(code).await {
            warn!(code = %code, error = %e, "Failed to delete expired session tree");
        }
    }

    /// One sweeper pass: re-apply the tiered grace rule to every empty
    /// session that has no armed timer (expired timers, crashed timers,
    /// sessions that never saw a join), then clear orphaned directories
    /// left behind by earlier crashes.
    pub async fn sweep_once(self: &Arc<Self>) {
        let snapshot: Vec<(PairingCode, Arc<Mutex<Session>>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(code, session)| (code.clone(), Arc::clone(session)))
                .collect()
        };

        let mut live = HashSet::with_capacity(snapshot.len());
        let mut expired = Vec::new();

        for (code, session) in snapshot {
            live.insert(code.as_str().to_string());

            let mut state = session.lock().await;
            if state.connected_count() > 0 {
                continue;
            }
            if state.cleanup.as_ref().is_some_and(|h| !h.is_finished()) {
                continue;
            }

            let grace = self.grace_for(&state);
            let idle = Utc::now()
                .signed_duration_since(state.last_activity)
                .to_std()
                .unwrap_or_default();

            if idle >= grace {
                expired.push(code);
            } else {
                self.schedule_cleanup(&code, &mut state, grace - idle);
            }
        }

        for code in &expired {
            self.expire_if_idle(code).await;
        }

        self.store.sweep_orphans(&live).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    async fn manager_with(config: ServerConfig) -> (Arc<SessionManager>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            FileStore::new(
                dir.path().to_path_buf(),
                "http://localhost:8080".to_string(),
            )
            .await
            .unwrap(),
        );
        (SessionManager::new(store, Arc::new(config)), dir)
    }

    async fn default_manager() -> (Arc<SessionManager>, TempDir) {
        manager_with(ServerConfig::default()).await
    }

    fn channel() -> (ConnectionSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> ServerEvent {
        match rx.try_recv().expect("expected a queued frame") {
            Message::Text(text) => serde_json::from_str(&text).expect("valid event json"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    fn text(content: &str) -> MessageBody {
        MessageBody::Text {
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_two_peer_cap() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();
        let (tx_c, _rx_c) = channel();

        manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();
        manager
            .join_session(&code, None, Uuid::new_v4(), tx_b)
            .await
            .unwrap();

        let err = manager
            .join_session(&code, None, Uuid::new_v4(), tx_c)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::SessionFull));

        let session = manager.get(&code).await.unwrap();
        assert_eq!(session.lock().await.clients.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_never_oversubscribe() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let code = code.clone();
            let (tx, _rx) = channel();
            handles.push(tokio::spawn(async move {
                manager
                    .join_session(&code, None, Uuid::new_v4(), tx)
                    .await
                    .is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);

        let session = manager.get(&code).await.unwrap();
        let state = session.lock().await;
        assert_eq!(state.clients.len(), 2);
        assert_eq!(state.connected_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_peer_keeps_its_seat() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, _rx_a) = channel();
        let (tx_b, _rx_b) = channel();
        let chan_b = Uuid::new_v4();

        manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();
        manager
            .join_session(&code, None, chan_b, tx_b)
            .await
            .unwrap();
        manager.handle_disconnect(&code, chan_b).await;

        // Only one peer connected, but both seats are claimed.
        let (tx_c, _rx_c) = channel();
        let err = manager
            .join_session(&code, None, Uuid::new_v4(), tx_c)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::SessionFull));
    }

    #[tokio::test]
    async fn test_rejoin_keeps_token_and_replays_history() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, mut rx_a) = channel();
        let chan_a = Uuid::new_v4();
        let joined = manager
            .join_session(&code, None, chan_a, tx_a)
            .await
            .unwrap();
        assert!(!joined.rejoined);
        next_event(&mut rx_a); // sessionJoined

        manager
            .append_message(&code, joined.token, text("hi"))
            .await
            .unwrap();
        manager.handle_disconnect(&code, chan_a).await;

        let (tx_a2, mut rx_a2) = channel();
        let outcome = manager
            .join_session(&code, Some(joined.token), Uuid::new_v4(), tx_a2)
            .await
            .unwrap();
        assert!(outcome.rejoined);
        assert_eq!(outcome.token, joined.token);

        match next_event(&mut rx_a2) {
            ServerEvent::SessionJoined {
                client_token,
                history,
            } => {
                assert_eq!(client_token, joined.token);
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].sender, joined.token);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Reconnect must cancel the pending deletion timer.
        let session = manager.get(&code).await.unwrap();
        assert!(session.lock().await.cleanup.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_precedes_live_events() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, mut rx_a) = channel();
        let a = manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();
        next_event(&mut rx_a); // sessionJoined

        manager.append_message(&code, a.token, text("one")).await.unwrap();
        manager.append_message(&code, a.token, text("two")).await.unwrap();

        let (tx_b, mut rx_b) = channel();
        manager
            .join_session(&code, None, Uuid::new_v4(), tx_b)
            .await
            .unwrap();

        match next_event(&mut rx_b) {
            ServerEvent::SessionJoined { history, .. } => {
                assert_eq!(history.len(), 2);
                assert!(history[0].timestamp < history[1].timestamp);
            }
            other => panic!("expected snapshot first, got {other:?}"),
        }
        assert!(matches!(next_event(&mut rx_b), ServerEvent::UserConnected));
    }

    #[tokio::test]
    async fn test_presence_events_reach_the_peer() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, mut rx_a) = channel();
        manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();
        next_event(&mut rx_a); // sessionJoined

        let (tx_b, _rx_b) = channel();
        let chan_b = Uuid::new_v4();
        manager
            .join_session(&code, None, chan_b, tx_b)
            .await
            .unwrap();
        assert!(matches!(next_event(&mut rx_a), ServerEvent::UserConnected));

        manager.handle_disconnect(&code, chan_b).await;
        assert!(matches!(
            next_event(&mut rx_a),
            ServerEvent::UserDisconnected
        ));
    }

    #[tokio::test]
    async fn test_broadcast_includes_sender() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, mut rx_a) = channel();
        let a = manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();
        next_event(&mut rx_a); // sessionJoined

        manager.append_message(&code, a.token, text("hi")).await.unwrap();
        match next_event(&mut rx_a) {
            ServerEvent::ReceiveMessage(msg) => {
                assert_eq!(msg.sender, a.token);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_append_requires_connected_member() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let stranger = ClientToken::new();
        let err = manager
            .append_message(&code, stranger, text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotConnected));

        let (tx_a, _rx_a) = channel();
        let chan_a = Uuid::new_v4();
        let a = manager
            .join_session(&code, None, chan_a, tx_a)
            .await
            .unwrap();
        manager.handle_disconnect(&code, chan_a).await;

        let err = manager
            .append_message(&code, a.token, text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotConnected));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, _rx_a) = channel();
        let a = manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();

        let huge = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let err = manager
            .append_message(&code, a.token, text(&huge))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, _rx_a) = channel();
        let a = manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();

        let mut last = 0;
        for i in 0..5 {
            let stored = manager
                .append_message(&code, a.token, text(&format!("m{i}")))
                .await
                .unwrap();
            assert!(stored.timestamp > last);
            last = stored.timestamp;
        }
    }

    #[tokio::test]
    async fn test_session_cap() {
        let (manager, _dir) = manager_with(ServerConfig {
            max_active_sessions: 1,
            ..ServerConfig::default()
        })
        .await;

        manager.create_session().await.unwrap();
        let err = manager.create_session().await.unwrap_err();
        assert!(matches!(err, ServerError::SessionCapReached { .. }));
    }

    #[tokio::test]
    async fn test_unused_session_swept() {
        let (manager, dir) = manager_with(ServerConfig {
            unused_session_grace_secs: 0,
            ..ServerConfig::default()
        })
        .await;

        let code = manager.create_session().await.unwrap();
        assert!(dir.path().join(code.as_str()).is_dir());

        manager.sweep_once().await;

        assert!(!manager.session_exists(&code).await);
        assert!(!dir.path().join(code.as_str()).exists());

        let (tx, _rx) = channel();
        let err = manager
            .join_session(&code, None, Uuid::new_v4(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidCode));
    }

    #[tokio::test]
    async fn test_disconnect_arms_timer_and_fire_deletes() {
        let (manager, dir) = manager_with(ServerConfig {
            unused_session_grace_secs: 0,
            active_session_grace_secs: 0,
            ..ServerConfig::default()
        })
        .await;

        let code = manager.create_session().await.unwrap();
        let (tx_a, _rx_a) = channel();
        let chan_a = Uuid::new_v4();
        manager
            .join_session(&code, None, chan_a, tx_a)
            .await
            .unwrap();

        manager.handle_disconnect(&code, chan_a).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!manager.session_exists(&code).await);
        assert!(!dir.path().join(code.as_str()).exists());
    }

    #[tokio::test]
    async fn test_reconnect_cancels_timer() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, _rx_a) = channel();
        let chan_a = Uuid::new_v4();
        let a = manager
            .join_session(&code, None, chan_a, tx_a)
            .await
            .unwrap();
        manager.handle_disconnect(&code, chan_a).await;

        {
            let session = manager.get(&code).await.unwrap();
            assert!(session.lock().await.cleanup.is_some());
        }

        let (tx_a2, _rx_a2) = channel();
        manager
            .join_session(&code, Some(a.token), Uuid::new_v4(), tx_a2)
            .await
            .unwrap();

        let session = manager.get(&code).await.unwrap();
        assert!(session.lock().await.cleanup.is_none());
    }

    #[tokio::test]
    async fn test_expiry_never_removes_connected_session() {
        let (manager, _dir) = manager_with(ServerConfig {
            unused_session_grace_secs: 0,
            active_session_grace_secs: 0,
            ..ServerConfig::default()
        })
        .await;

        let code = manager.create_session().await.unwrap();
        let (tx_a, _rx_a) = channel();
        manager
            .join_session(&code, None, Uuid::new_v4(), tx_a)
            .await
            .unwrap();

        manager.expire_if_idle(&code).await;
        manager.sweep_once().await;

        assert!(manager.session_exists(&code).await);
    }

    #[tokio::test]
    async fn test_stale_channel_disconnect_ignored() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();

        let (tx_a, _rx_a) = channel();
        let old_chan = Uuid::new_v4();
        let a = manager
            .join_session(&code, None, old_chan, tx_a)
            .await
            .unwrap();

        // Same identity reconnects on a new channel; the old transport
        // closing afterwards must not mark the seat disconnected.
        let (tx_a2, _rx_a2) = channel();
        manager
            .join_session(&code, Some(a.token), Uuid::new_v4(), tx_a2)
            .await
            .unwrap();
        manager.handle_disconnect(&code, old_chan).await;

        let session = manager.get(&code).await.unwrap();
        assert_eq!(session.lock().await.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_quota_denied_and_allowed() {
        let (manager, dir) = manager_with(ServerConfig {
            max_session_storage_bytes: 1000,
            ..ServerConfig::default()
        })
        .await;

        let code = manager.create_session().await.unwrap();
        tokio::fs::write(
            dir.path().join(code.as_str()).join("files").join("1-a.bin"),
            vec![0u8; 800],
        )
        .await
        .unwrap();

        manager.check_quota(&code, 100).await.unwrap();

        let err = manager.check_quota(&code, 300).await.unwrap_err();
        match err {
            ServerError::QuotaExceeded { current, limit } => {
                assert_eq!(current, 800);
                assert_eq!(limit, 1000);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quota_unlimited() {
        let (manager, _dir) = default_manager().await;
        let code = manager.create_session().await.unwrap();
        manager.check_quota(&code, u64::MAX / 2).await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_and_storage_status() {
        let (manager, _dir) = manager_with(ServerConfig {
            max_active_sessions: 4,
            max_session_storage_bytes: 2048,
            ..ServerConfig::default()
        })
        .await;

        let code = manager.create_session().await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.available, 3);
        assert!(!stats.unlimited);
        assert!((stats.usage_percent - 25.0).abs() < f64::EPSILON);

        let status = manager.storage_status(&code).await.unwrap();
        assert_eq!(status.current, 0);
        assert_eq!(status.limit, 2048);
        assert!(!status.unlimited);
    }
}
