//! Session repository: binds users to access codes and to a shared,
//! cursor-addressed document.
//!
//! Owns two maps (access code to live session, user to active session)
//! and mediates every request against the record store and the document
//! engine. Each session guards its document with its own lock so
//! unrelated sessions never contend; the maps themselves are locked only
//! for brief lookups and inserts.
//!
//! Every operation returns a [`Reply`] carrying the outbound message and
//! a routing decision: errors and session-setup responses go back to the
//! requester only, while successful edits are echoed to every participant
//! of the affected session (the origin included, so clients converge on
//! the server's ordering).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use inklet_doc::{Document, Position};

use crate::idgen::IdGen;
use crate::protocol::{Cursor, MessageKind, ProtocolError, Request, Response};
use crate::store::{DataStore, DocRecord, StoreError, UserRecord};

/// Where a reply is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Back to the originating connection only.
    Unicast,
    /// To every connection bound to one of these participant user ids.
    Broadcast { participants: Vec<String> },
}

/// What goes back on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reply(Response),
    /// Write/erase success: the request echoed byte-for-byte.
    Echo(Request),
}

impl Outbound {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::Reply(response) => response.encode(),
            Self::Echo(request) => request.encode(),
        }
    }
}

/// The repository's answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message: Outbound,
    pub routing: Routing,
}

impl Reply {
    fn unicast(response: Response) -> Self {
        Self {
            message: Outbound::Reply(response),
            routing: Routing::Unicast,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::unicast(Response::error(message))
    }
}

/// One live editing session: an access code, the authoritative document,
/// and the users currently bound to it.
pub struct Session {
    access_code: String,
    /// Blob key the document text is persisted under when the session
    /// is reclaimed.
    blob_key: String,
    document: Mutex<Document>,
    participants: Mutex<HashSet<String>>,
}

impl Session {
    fn new(access_code: String, blob_key: String, text: &str) -> Arc<Self> {
        Arc::new(Self {
            access_code,
            blob_key,
            document: Mutex::new(Document::from_text(text)),
            participants: Mutex::new(HashSet::new()),
        })
    }

    pub fn access_code(&self) -> &str {
        &self.access_code
    }
}

/// Access-code and user-session bookkeeping plus request dispatch.
pub struct Repository {
    store: DataStore,
    ids: IdGen,
    /// Access code → session. Brief lock, never held across awaits on
    /// other repository locks.
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// User id → that user's active session.
    active: Mutex<HashMap<String, Arc<Session>>>,
}

impl Repository {
    pub fn new(data_dir: impl AsRef<Path>, ids: IdGen) -> Result<Self, StoreError> {
        Ok(Self {
            store: DataStore::open(data_dir)?,
            ids,
            sessions: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Dispatch one decoded request and decide its routing.
    pub async fn process(&self, request: Request) -> Reply {
        match request {
            Request::Register { username, password } => self.register(username, password),
            Request::Login { username, password } => self.login(username, password),
            Request::Create { user_id, filename } => self.create(user_id, filename).await,
            Request::Load { user_id, filename } => self.load(user_id, filename).await,
            Request::Join {
                user_id,
                access_code,
            } => self.join(user_id, access_code).await,
            Request::Write {
                user_id,
                cursor,
                text,
            } => self.write(user_id, cursor, text).await,
            Request::Erase {
                user_id,
                cursor,
                count,
            } => self.erase(user_id, cursor, count).await,
        }
    }

    fn register(&self, username: String, password: String) -> Reply {
        let record = UserRecord {
            id: self.ids.record_id(),
            username,
            password,
        };
        match self.store.users.create(record) {
            Ok(Some(id)) => {
                log::info!("Registered user {id}");
                Reply::unicast(Response::ok(
                    MessageKind::Register,
                    vec!["User successfully created".into()],
                ))
            }
            Ok(None) => Reply::error("Create user error"),
            Err(e) => self.internal("register", e),
        }
    }

    fn login(&self, username: String, password: String) -> Reply {
        match self.store.users.read_by_key(&username) {
            Ok(Some(user)) if user.password == password => {
                log::info!("User {} logged in", user.id);
                Reply::unicast(Response::ok(MessageKind::Login, vec![user.id]))
            }
            Ok(_) => Reply::error("Authorization error"),
            Err(e) => self.internal("login", e),
        }
    }

    async fn create(&self, user_id: String, filename: String) -> Reply {
        if !self.user_exists(&user_id) {
            return Reply::error("User not found error");
        }
        let record = DocRecord {
            id: self.ids.record_id(),
            owner: user_id.clone(),
            filename: filename.clone(),
        };
        match self.store.docs.create(record) {
            Ok(Some(_)) => {}
            Ok(None) => return Reply::error("Create document error"),
            Err(e) => return self.internal("create", e),
        }
        let blob_key = DocRecord::blob_key(&user_id, &filename);
        match self.store.blobs.init(&blob_key) {
            Ok(true) => {}
            Ok(false) => return Reply::error("Document with specified name already exists!"),
            Err(e) => return self.internal("create", e),
        }
        match self.start_tracking(&user_id, &blob_key, "").await {
            Some(access_code) => {
                log::info!("User {user_id} created '{filename}' with code {access_code}");
                Reply::unicast(Response::ok(MessageKind::Create, vec![access_code]))
            }
            None => Reply::error("Server internal error when producing access code. Try again"),
        }
    }

    async fn load(&self, user_id: String, filename: String) -> Reply {
        if !self.user_exists(&user_id) {
            return Reply::error("User not found error");
        }
        let key = format!("{user_id}/{filename}");
        match self.store.docs.read_by_key(&key) {
            Ok(Some(_)) => {}
            Ok(None) => return Reply::error("Load document error"),
            Err(e) => return self.internal("load", e),
        }
        let blob_key = DocRecord::blob_key(&user_id, &filename);
        let text = match self.store.blobs.read(&blob_key) {
            Ok(Some(text)) => text,
            Ok(None) => return Reply::error(format!("Cannot open file {filename}")),
            Err(e) => return self.internal("load", e),
        };
        match self.start_tracking(&user_id, &blob_key, &text).await {
            Some(access_code) => {
                log::info!("User {user_id} loaded '{filename}' as code {access_code}");
                Reply::unicast(Response::ok(MessageKind::Load, vec![text, access_code]))
            }
            None => Reply::error("Server internal error when producing access code. Try again"),
        }
    }

    async fn join(&self, user_id: String, access_code: String) -> Reply {
        if !self.user_exists(&user_id) {
            return Reply::error("User not found error");
        }
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(&access_code).cloned()
        };
        let Some(session) = session else {
            return Reply::error("Invalid access code!");
        };
        self.activate(&user_id, &session).await;
        let text = session.document.lock().await.text();
        log::info!("User {user_id} joined session {access_code}");
        Reply::unicast(Response::ok(MessageKind::Join, vec![text]))
    }

    async fn write(&self, user_id: String, cursor: Cursor, text: String) -> Reply {
        let Some(session) = self.active_session(&user_id).await else {
            return Reply::error("Write error");
        };
        let pos = Position::new(cursor.line as usize, cursor.column as usize);
        {
            let mut doc = session.document.lock().await;
            if !doc.set_cursor(pos) {
                log::error!(
                    "[{},{}] Cannot place cursor on write msg!",
                    cursor.line,
                    cursor.column
                );
                return Reply::error("Cannot place cursor on write msg!");
            }
            doc.write(&text);
        }
        log::info!("[{},{}] wrote '{}'", cursor.line, cursor.column, text);
        let participants = session.participants.lock().await.iter().cloned().collect();
        Reply {
            message: Outbound::Echo(Request::Write {
                user_id,
                cursor,
                text,
            }),
            routing: Routing::Broadcast { participants },
        }
    }

    async fn erase(&self, user_id: String, cursor: Cursor, count: u32) -> Reply {
        let Some(session) = self.active_session(&user_id).await else {
            return Reply::error("Erase error");
        };
        let pos = Position::new(cursor.line as usize, cursor.column as usize);
        {
            let mut doc = session.document.lock().await;
            if !doc.set_cursor(pos) {
                log::error!(
                    "[{},{}] Cannot place cursor on erase msg!",
                    cursor.line,
                    cursor.column
                );
                return Reply::error("Cannot place cursor on erase msg!");
            }
            doc.erase(count as usize);
        }
        log::info!("[{},{}] erased {}", cursor.line, cursor.column, count);
        let participants = session.participants.lock().await.iter().cloned().collect();
        Reply {
            message: Outbound::Echo(Request::Erase {
                user_id,
                cursor,
                count,
            }),
            routing: Routing::Broadcast { participants },
        }
    }

    /// Drop a disconnected user from their session; reclaim the session
    /// once its participant set empties.
    pub async fn disconnect(&self, user_id: &str) {
        let session = {
            let mut active = self.active.lock().await;
            active.remove(user_id)
        };
        if let Some(session) = session {
            log::debug!("User {user_id} left session {}", session.access_code);
            self.leave(user_id, &session).await;
        }
    }

    fn user_exists(&self, user_id: &str) -> bool {
        !user_id.is_empty()
            && matches!(self.store.users.read(user_id), Ok(Some(_)))
    }

    async fn active_session(&self, user_id: &str) -> Option<Arc<Session>> {
        self.active.lock().await.get(user_id).cloned()
    }

    /// Mint an access code and start tracking a fresh session for it.
    /// `None` means the generated code collided with a live session;
    /// the caller surfaces a retryable error.
    async fn start_tracking(&self, user_id: &str, blob_key: &str, text: &str) -> Option<String> {
        let access_code = self.ids.access_code();
        let session = {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&access_code) {
                log::warn!("Access code collision on {access_code}");
                return None;
            }
            let session = Session::new(access_code.clone(), blob_key.to_string(), text);
            sessions.insert(access_code.clone(), session.clone());
            session
        };
        self.activate(user_id, &session).await;
        Some(access_code)
    }

    /// Make `session` the user's active session, leaving the previous
    /// one (if any) behind.
    async fn activate(&self, user_id: &str, session: &Arc<Session>) {
        let previous = {
            let mut active = self.active.lock().await;
            active.insert(user_id.to_string(), session.clone())
        };
        session
            .participants
            .lock()
            .await
            .insert(user_id.to_string());
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, session) {
                self.leave(user_id, &previous).await;
            }
        }
    }

    async fn leave(&self, user_id: &str, session: &Arc<Session>) {
        let now_empty = {
            let mut participants = session.participants.lock().await;
            participants.remove(user_id);
            participants.is_empty()
        };
        if now_empty {
            self.reclaim(session).await;
        }
    }

    /// Drop an empty session, persisting its text first so a later load
    /// picks up where the session left off.
    async fn reclaim(&self, session: &Arc<Session>) {
        {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&session.access_code);
        }
        let text = session.document.lock().await.text();
        if let Err(e) = self.store.blobs.write(&session.blob_key, &text) {
            log::error!(
                "Failed to persist document for session {}: {e}",
                session.access_code
            );
        }
        log::info!("Session {} reclaimed (empty)", session.access_code);
    }

    fn internal(&self, op: &str, error: StoreError) -> Reply {
        log::error!("Store failure during {op}: {error}");
        Reply::error("Server internal error. Try again")
    }
}
