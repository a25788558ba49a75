//! Sessions and the session manager.
//!
//! A session is the server-side state of one conversation: the committed
//! message history plus the engine-private token cache (`ModelContext`). The
//! manager owns all live sessions, keeps LRU order, expires idle ones, and
//! evicts over capacity. A background reaper drives [`SessionManager::gc`]
//! on a fixed interval.
//!
//! Ownership is one-directional: manager → session → cache. Serving contexts
//! hold an `Arc<Session>` for the duration of a request; nothing points back.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::context::ServingContext;
use super::scheduler::{run_session_turns, ModelScheduler};
use super::types::Message;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `true` when `history` is a structural prefix of `incoming`: pairwise
/// equal messages for the first `history.len()` positions.
pub(crate) fn is_prefix(history: &[Message], incoming: &[Message]) -> bool {
    incoming.len() >= history.len() && history.iter().zip(incoming).all(|(h, i)| h == i)
}

// ── Session ───────────────────────────────────────────────────────────────────

struct SessionState {
    /// Model the session is currently bound to.
    model: String,
    /// Committed conversation history.
    history: Vec<Message>,
    /// Engine-private token cache, type-erased. At most one execution owns
    /// it at any instant; the per-session queue enforces that without this
    /// mutex being held across execution.
    cache: Option<Box<dyn Any + Send>>,
    /// Bumped whenever the cache is dropped or the history reset, so an
    /// in-flight execution that took the cache out knows not to put a stale
    /// one back.
    cache_epoch: u64,
    last_active: Instant,
    closed: bool,
}

/// One conversation's server-side state.
pub struct Session {
    id: String,
    created_at: Instant,
    state: Mutex<SessionState>,
    /// Ingress of the per-session actor; a full inbox is backpressure.
    ingress: mpsc::Sender<Arc<ServingContext>>,
}

impl Session {
    fn new(id: String, model: String, ingress: mpsc::Sender<Arc<ServingContext>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            state: Mutex::new(SessionState {
                model,
                history: Vec::new(),
                cache: None,
                cache_epoch: 0,
                last_active: now,
                closed: false,
            }),
            ingress,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> String {
        lock(&self.state).model.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn touch(&self) {
        lock(&self.state).last_active = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.state).last_active.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn mark_closed(&self) {
        let mut st = lock(&self.state);
        st.closed = true;
        st.cache = None;
        st.cache_epoch += 1;
    }

    pub fn history_snapshot(&self) -> Vec<Message> {
        lock(&self.state).history.clone()
    }

    /// Conversational auto-diff against the committed history.
    ///
    /// Returns the message list the engine should see: the incremental
    /// suffix when `incoming` extends the history, otherwise the full list
    /// after resetting the session (history cleared, cache dropped). A
    /// request naming a different model than the session is bound to is
    /// treated as a divergence and rebinds the session.
    pub fn apply_incoming(&self, model: &str, incoming: &[Message]) -> Vec<Message> {
        let mut st = lock(&self.state);
        st.last_active = Instant::now();

        if st.model != model {
            debug!(session_id = %self.id, from = %st.model, to = %model, "session rebound to new model");
            st.model = model.to_owned();
            Self::reset_locked(&mut st);
            return incoming.to_vec();
        }

        if st.history.is_empty() {
            return incoming.to_vec();
        }
        if is_prefix(&st.history, incoming) {
            return incoming[st.history.len()..].to_vec();
        }

        Self::reset_locked(&mut st);
        incoming.to_vec()
    }

    fn reset_locked(st: &mut SessionState) {
        st.history.clear();
        st.cache = None;
        st.cache_epoch += 1;
    }

    /// Commit a finished turn: the client's full incoming list plus the
    /// assistant's accumulated text. Callers only invoke this on `stop` or
    /// `length`.
    pub fn commit_turn(&self, mut client_messages: Vec<Message>, assistant_text: String) {
        let mut st = lock(&self.state);
        client_messages.push(Message::new("assistant", assistant_text));
        st.history = client_messages;
        st.last_active = Instant::now();
    }

    // ── Engine-private cache slot ─────────────────────────────────────────────

    /// Take the cache out for the duration of one execution. The returned
    /// epoch must be passed back to [`Session::restore_cache`].
    pub fn take_cache(&self) -> (Option<Box<dyn Any + Send>>, u64) {
        let mut st = lock(&self.state);
        (st.cache.take(), st.cache_epoch)
    }

    /// Put the cache back after an execution. Refused (and the cache
    /// dropped) when the session was reset or closed in the meantime.
    pub fn restore_cache(&self, cache: Box<dyn Any + Send>, epoch: u64) -> bool {
        let mut st = lock(&self.state);
        if st.closed || st.cache_epoch != epoch {
            return false;
        }
        st.cache = Some(cache);
        true
    }

    /// Drop the cache and invalidate any copy currently held by an
    /// execution.
    pub fn drop_cache(&self) {
        let mut st = lock(&self.state);
        st.cache = None;
        st.cache_epoch += 1;
    }

    pub(crate) fn ingress(&self) -> &mpsc::Sender<Arc<ServingContext>> {
        &self.ingress
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.state);
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &st.model)
            .field("history_len", &st.history.len())
            .field("closed", &st.closed)
            .finish()
    }
}

// ── Session manager ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionManagerOptions {
    /// Idle time after which a session is reclaimable.
    pub idle_ttl: Duration,
    /// Hard cap on live sessions; LRU eviction beyond this.
    pub max_sessions: usize,
    /// Upper bound on removals per [`SessionManager::gc`] pass.
    pub gc_batch: usize,
    /// Per-session pending-queue capacity (the actor inbox).
    pub pending_capacity: usize,
    /// Reaper wake-up interval.
    pub reap_interval: Duration,
}

impl Default for SessionManagerOptions {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(30 * 60),
            max_sessions: 1024,
            gc_batch: 64,
            pending_capacity: 64,
            reap_interval: Duration::from_secs(60),
        }
    }
}

struct Entry {
    session: Arc<Session>,
    /// Key into the LRU map; higher = more recently used.
    stamp: u64,
}

struct ManagerState {
    map: HashMap<String, Entry>,
    /// LRU order: lowest stamp is the least recently used session.
    lru: BTreeMap<u64, String>,
    next_stamp: u64,
}

/// Owner of all live sessions, keyed by session id.
pub struct SessionManager {
    opts: SessionManagerOptions,
    scheduler: ModelScheduler,
    inner: Mutex<ManagerState>,
}

impl SessionManager {
    pub fn new(opts: SessionManagerOptions, scheduler: ModelScheduler) -> Self {
        Self {
            opts,
            scheduler,
            inner: Mutex::new(ManagerState {
                map: HashMap::new(),
                lru: BTreeMap::new(),
                next_stamp: 0,
            }),
        }
    }

    pub fn options(&self) -> &SessionManagerOptions {
        &self.opts
    }

    /// Look up a session, creating it (bound to `model`) on a miss. A hit
    /// refreshes `last_active` and moves the session to the LRU front.
    ///
    /// Must run inside a tokio runtime: creation spawns the session's actor.
    pub fn get_or_create(&self, session_id: &str, model: &str) -> Arc<Session> {
        let mut st = lock(&self.inner);

        if let Some(session) = st.map.get(session_id).map(|e| Arc::clone(&e.session)) {
            session.touch();
            Self::touch_locked(&mut st, session_id);
            return session;
        }

        let (tx, rx) = mpsc::channel(self.opts.pending_capacity);
        let session = Arc::new(Session::new(session_id.to_owned(), model.to_owned(), tx));
        tokio::spawn(run_session_turns(
            session_id.to_owned(),
            rx,
            self.scheduler.clone(),
        ));

        let stamp = Self::next_stamp_locked(&mut st);
        st.lru.insert(stamp, session_id.to_owned());
        st.map.insert(
            session_id.to_owned(),
            Entry {
                session: Arc::clone(&session),
                stamp,
            },
        );
        debug!(session_id, model, "session created");

        Self::evict_over_capacity_locked(&mut st, self.opts.max_sessions);
        session
    }

    /// Look up a session without creating it. Closed sessions are invisible.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut st = lock(&self.inner);
        let session = {
            let e = st.map.get(session_id)?;
            if e.session.is_closed() {
                return None;
            }
            Arc::clone(&e.session)
        };
        Self::touch_locked(&mut st, session_id);
        session.touch();
        Some(session)
    }

    /// Refresh `last_active` and the LRU position.
    pub fn touch(&self, session_id: &str) {
        let mut st = lock(&self.inner);
        if let Some(e) = st.map.get(session_id) {
            e.session.touch();
            Self::touch_locked(&mut st, session_id);
        }
    }

    /// Mark closed and remove. The session object (and its cache) is
    /// released when the last reference drops.
    pub fn close(&self, session_id: &str) -> bool {
        let mut st = lock(&self.inner);
        Self::erase_locked(&mut st, session_id)
    }

    /// Reclaim from the LRU back: closed or idle-expired sessions, up to
    /// `gc_batch`, stopping at the first fresh entry; then evict over
    /// capacity. Returns the number removed.
    pub fn gc(&self) -> usize {
        let mut st = lock(&self.inner);
        let mut removed = 0;

        while removed < self.opts.gc_batch {
            let Some((_, id)) = st.lru.first_key_value() else {
                break;
            };
            let id = id.clone();
            let expired = match st.map.get(&id) {
                Some(e) => e.session.is_closed() || e.session.idle_for() > self.opts.idle_ttl,
                None => true,
            };
            if !expired {
                // LRU order means everything after this entry is fresher.
                break;
            }
            info!(session_id = %id, "session reclaimed");
            Self::erase_locked(&mut st, &id);
            removed += 1;
        }

        removed + Self::evict_over_capacity_locked(&mut st, self.opts.max_sessions)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the background reaper. The task runs until aborted.
    pub fn start_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(mgr.opts.reap_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it.
            tick.tick().await;
            loop {
                tick.tick().await;
                let removed = mgr.gc();
                if removed > 0 {
                    info!(removed, remaining = mgr.len(), "session gc pass");
                }
            }
        })
    }

    // ── locked helpers ────────────────────────────────────────────────────────

    fn next_stamp_locked(st: &mut ManagerState) -> u64 {
        st.next_stamp += 1;
        st.next_stamp
    }

    fn touch_locked(st: &mut ManagerState, session_id: &str) {
        let new_stamp = Self::next_stamp_locked(st);
        if let Some(e) = st.map.get_mut(session_id) {
            st.lru.remove(&e.stamp);
            e.stamp = new_stamp;
            st.lru.insert(new_stamp, session_id.to_owned());
        }
    }

    fn erase_locked(st: &mut ManagerState, session_id: &str) -> bool {
        match st.map.remove(session_id) {
            Some(e) => {
                st.lru.remove(&e.stamp);
                e.session.mark_closed();
                true
            }
            None => false,
        }
    }

    fn evict_over_capacity_locked(st: &mut ManagerState, max_sessions: usize) -> usize {
        let mut evicted = 0;
        while st.map.len() > max_sessions {
            let Some((_, id)) = st.lru.first_key_value() else {
                break;
            };
            let id = id.clone();
            info!(session_id = %id, "session evicted (capacity)");
            Self::erase_locked(st, &id);
            evicted += 1;
        }
        evicted
    }
}
