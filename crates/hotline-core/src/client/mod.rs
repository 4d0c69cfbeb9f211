//! The client engine.
//!
//! Mirrors the server session state machine from the other side:
//! handshake, login with complemented credentials, agreement, then an
//! active loop. Replies are correlated back to their requests through
//! an `active_tasks` map keyed by request ID; a background task sends a
//! keep-alive every five minutes.

mod ui;

pub use ui::{ClientUi, NullUi};

use crate::error::{Error, Result};
use crate::protocol::{
    field, negate, tran, Field, Transaction, TransactionReader, CLIENT_HANDSHAKE, SERVER_HANDSHAKE,
};
use crate::rng::{IdSource, RandomIds};
use crate::user::User;
use crate::KEEPALIVE_INTERVAL_SECS;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client preferences supplied by the front end.
#[derive(Debug, Clone)]
pub struct ClientPrefs {
    /// User name presented to the server.
    pub username: String,
    /// Icon ID.
    pub icon_id: u16,
}

impl Default for ClientPrefs {
    fn default() -> Self {
        Self { username: "unnamed".into(), icon_id: 145 }
    }
}

/// Protocol-visible state of a connected client.
pub struct Client {
    prefs: ClientPrefs,
    ui: Box<dyn ClientUi>,
    ids: Box<dyn IdSource>,
    /// Requests awaiting replies, by request ID.
    active_tasks: HashMap<u32, Transaction>,
    /// Current online user list.
    pub user_list: Vec<User>,
    /// Our access bitmap as granted by the server.
    pub user_access: Option<[u8; 8]>,
    /// Server name from the login reply.
    pub server_name: String,
    reader: Option<OwnedReadHalf>,
    writer: Option<mpsc::Sender<Transaction>>,
    framer: TransactionReader,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Client {
    /// Create a disconnected client.
    pub fn new(prefs: ClientPrefs, ui: Box<dyn ClientUi>) -> Self {
        Self {
            prefs,
            ui,
            ids: Box::new(RandomIds::new()),
            active_tasks: HashMap::new(),
            user_list: Vec::new(),
            user_access: None,
            server_name: String::new(),
            reader: None,
            writer: None,
            framer: TransactionReader::new(),
            tasks: Vec::new(),
        }
    }

    /// Swap the ID source (tests inject a fixed sequence).
    pub fn with_ids(mut self, ids: Box<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    /// Connect, handshake and log in. On return the session is waiting
    /// for the agreement text.
    pub async fn join_server(&mut self, addr: &str, login: &str, password: &str) -> Result<()> {
        let mut socket = tokio::time::timeout(
            Duration::from_secs(crate::HANDSHAKE_DEADLINE_SECS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Protocol(format!("connect {}: {}", addr, e)))?;

        socket.write_all(&CLIENT_HANDSHAKE).await?;
        let mut reply = [0u8; 8];
        socket.read_exact(&mut reply).await?;
        if reply != SERVER_HANDSHAKE {
            return Err(Error::Protocol("handshake rejected".into()));
        }
        info!(%addr, "connected");

        let (rd, wr) = socket.into_split();
        self.reader = Some(rd);
        let (tx, rx) = mpsc::channel::<Transaction>(32);
        self.tasks.push(tokio::spawn(write_loop(rx, wr)));

        // Keep-alive pings ride the same outbox.
        let keepalive = tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let ping = Transaction::request(tran::KEEP_ALIVE, 0, vec![]);
                if keepalive.send(ping).await.is_err() {
                    return;
                }
            }
        }));
        self.writer = Some(tx);

        self.send(Transaction::request(
            tran::LOGIN,
            0,
            vec![
                Field::new(field::USER_NAME, self.prefs.username.clone().into_bytes()),
                Field::from_u16(field::USER_ICON_ID, self.prefs.icon_id),
                Field::new(field::USER_LOGIN, negate(login.as_bytes())),
                Field::new(field::USER_PASSWORD, negate(password.as_bytes())),
            ],
        ))
        .await
    }

    /// Send a transaction, assigning a fresh request ID to requests and
    /// tracking them for reply correlation.
    pub async fn send(&mut self, mut t: Transaction) -> Result<()> {
        if !t.is_reply {
            t.id = self.ids.next_id();
            self.active_tasks.insert(t.id, t.clone());
        }
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| Error::Protocol("not connected".into()))?;
        writer
            .send(t)
            .await
            .map_err(|_| Error::Protocol("connection closed".into()))
    }

    /// Send a public chat line.
    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        self.send(Transaction::request(
            tran::CHAT_SEND,
            0,
            vec![Field::new(field::DATA, text.as_bytes().to_vec())],
        ))
        .await
    }

    /// Request the online user list.
    pub async fn request_user_list(&mut self) -> Result<()> {
        self.send(Transaction::request(tran::GET_USER_NAME_LIST, 0, vec![])).await
    }

    /// Request the flat news board.
    pub async fn request_news(&mut self) -> Result<()> {
        self.send(Transaction::request(tran::GET_MSGS, 0, vec![])).await
    }

    /// Request a directory listing. `path` is `/`-separated, empty for
    /// the file root.
    pub async fn request_file_list(&mut self, path: &str) -> Result<()> {
        let mut fields = Vec::new();
        if !path.is_empty() {
            fields.push(Field::new(field::FILE_PATH, crate::files::encode_file_path(path)));
        }
        self.send(Transaction::request(tran::GET_FILE_NAME_LIST, 0, fields)).await
    }

    /// Read and handle inbound transactions until the connection drops.
    ///
    /// Cancellation-safe: a dropped `run` future can be restarted and
    /// picks up where the stream left off.
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = {
                let rd = self
                    .reader
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("not connected".into()))?;
                rd.read(&mut buf).await?
            };
            if n == 0 {
                return Ok(());
            }
            self.framer.push(&buf[..n]);
            while let Some(t) = self.framer.try_read()? {
                self.handle_transaction(t).await?;
            }
        }
    }

    /// Handle one inbound transaction, recovering the type of replies
    /// from the originating request.
    pub async fn handle_transaction(&mut self, mut t: Transaction) -> Result<()> {
        if t.is_reply {
            match self.active_tasks.remove(&t.id) {
                Some(origin) => t.ty = origin.ty,
                None => {
                    warn!(id = t.id, "reply with no matching request");
                    return Ok(());
                }
            }
            if t.error_code != 0 {
                let msg = t
                    .field_data(field::ERROR)
                    .map(|d| String::from_utf8_lossy(d).into_owned())
                    .unwrap_or_else(|| "unknown error".into());
                self.ui.modal("Error", &msg);
                return Ok(());
            }
        }
        debug!(ty = t.ty, is_reply = t.is_reply, "received transaction");

        match t.ty {
            tran::CHAT_MSG => {
                let line = String::from_utf8_lossy(t.field_data(field::DATA).unwrap_or_default())
                    .into_owned();
                self.ui.chat_line(&line);
            }
            tran::LOGIN => {
                if let Some(name) = t.field_data(field::SERVER_NAME) {
                    self.server_name = String::from_utf8_lossy(name).into_owned();
                }
            }
            tran::SHOW_AGREEMENT => {
                let text = String::from_utf8_lossy(t.field_data(field::DATA).unwrap_or_default())
                    .into_owned();
                if self.ui.agreement(&text) {
                    self.send(Transaction::request(
                        tran::AGREED,
                        0,
                        vec![
                            Field::new(
                                field::USER_NAME,
                                self.prefs.username.clone().into_bytes(),
                            ),
                            Field::from_u16(field::USER_ICON_ID, self.prefs.icon_id),
                            Field::new(field::USER_FLAGS, vec![0x00, 0x00]),
                            Field::new(field::OPTIONS, vec![0x00, 0x00]),
                        ],
                    ))
                    .await?;
                } else {
                    return Err(Error::Protocol("agreement declined".into()));
                }
            }
            tran::USER_ACCESS => {
                if let Some(data) = t.field_data(field::USER_ACCESS) {
                    if data.len() == 8 {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(data);
                        self.user_access = Some(bytes);
                    }
                }
                // We are active now; pull the initial user list.
                self.request_user_list().await?;
            }
            tran::GET_USER_NAME_LIST => {
                let mut users = Vec::new();
                for f in t.fields.iter().filter(|f| f.id == field::USERNAME_WITH_INFO) {
                    users.push(User::from_bytes(&f.data)?);
                }
                self.user_list = users;
                self.ui.user_list(&self.user_list);
            }
            tran::NOTIFY_CHANGE_USER => {
                let user = User {
                    id: t.field(field::USER_ID).map(|f| f.as_u16()).unwrap_or(0),
                    icon: t.field(field::USER_ICON_ID).map(|f| f.as_u16()).unwrap_or(0),
                    flags: t.field(field::USER_FLAGS).map(|f| f.as_u16()).unwrap_or(0),
                    name: t.field_data(field::USER_NAME).unwrap_or_default().to_vec(),
                };
                match self.user_list.iter_mut().find(|u| u.id == user.id) {
                    Some(existing) => *existing = user,
                    None => self.user_list.push(user),
                }
                self.ui.user_list(&self.user_list);
            }
            tran::NOTIFY_DELETE_USER => {
                let id = t.field(field::USER_ID).map(|f| f.as_u16()).unwrap_or(0);
                self.user_list.retain(|u| u.id != id);
                self.ui.user_list(&self.user_list);
            }
            tran::GET_FILE_NAME_LIST => {
                let mut listing = String::new();
                for f in t.fields.iter().filter(|f| f.id == field::FILE_NAME_WITH_INFO) {
                    let entry = crate::files::FileNameWithInfo::from_bytes(&f.data)?;
                    let name = String::from_utf8_lossy(&entry.name).into_owned();
                    if entry.is_folder() {
                        listing.push_str(&format!("{}/ ({} items)\n", name, entry.size));
                    } else {
                        listing.push_str(&format!("{} ({} bytes)\n", name, entry.size));
                    }
                }
                self.ui.modal("Files", &listing);
            }
            tran::GET_MSGS => {
                let text = String::from_utf8_lossy(t.field_data(field::DATA).unwrap_or_default())
                    .replace('\r', "\n");
                self.ui.modal("News", &text);
            }
            tran::SERVER_MSG => {
                let from = String::from_utf8_lossy(
                    t.field_data(field::USER_NAME).unwrap_or(b"Server"),
                )
                .into_owned();
                let body = String::from_utf8_lossy(t.field_data(field::DATA).unwrap_or_default())
                    .replace('\r', "\n");
                self.ui.modal(&format!("Message from {}", from), &body);
            }
            tran::KEEP_ALIVE => {}
            other => {
                debug!(ty = other, "unhandled transaction type");
            }
        }
        Ok(())
    }

    /// Requests still waiting on a reply.
    pub fn pending_requests(&self) -> usize {
        self.active_tasks.len()
    }

    /// A cloneable handle for pushing chat lines from outside the read
    /// loop. Chat sends get no reply, so they bypass the correlation
    /// map.
    pub fn chat_sender(&self) -> Result<ChatSender> {
        let tx = self
            .writer
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::Protocol("not connected".into()))?;
        Ok(ChatSender { tx, ids: std::sync::Arc::new(std::sync::Mutex::new(RandomIds::new())) })
    }
}

/// Fire-and-forget chat sender usable concurrently with [`Client::run`].
#[derive(Clone)]
pub struct ChatSender {
    tx: mpsc::Sender<Transaction>,
    ids: std::sync::Arc<std::sync::Mutex<RandomIds>>,
}

impl ChatSender {
    /// Send one public chat line.
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let id = {
            let mut ids = self.ids.lock().unwrap_or_else(|p| p.into_inner());
            ids.next_id()
        };
        let t = Transaction::request(
            tran::CHAT_SEND,
            id,
            vec![Field::new(field::DATA, text.as_bytes().to_vec())],
        );
        self.tx.send(t).await.map_err(|_| Error::Protocol("connection closed".into()))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Tear the writer and keep-alive tasks down so the socket
        // actually closes with us.
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Writer task: serialize outbound transactions in order.
async fn write_loop(mut rx: mpsc::Receiver<Transaction>, mut wr: OwnedWriteHalf) {
    while let Some(t) = rx.recv().await {
        if let Err(e) = wr.write_all(&t.to_bytes()).await {
            debug!(error = %e, "client write failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SeqIds;
    use std::sync::{Arc, Mutex};

    /// Records every UI callback for assertions.
    #[derive(Default, Clone)]
    struct RecordingUi {
        chat: Arc<Mutex<Vec<String>>>,
        lists: Arc<Mutex<Vec<usize>>>,
        modals: Arc<Mutex<Vec<String>>>,
    }

    impl ClientUi for RecordingUi {
        fn chat_line(&mut self, line: &str) {
            self.chat.lock().unwrap().push(line.to_string());
        }
        fn user_list(&mut self, users: &[User]) {
            self.lists.lock().unwrap().push(users.len());
        }
        fn modal(&mut self, title: &str, body: &str) {
            self.modals.lock().unwrap().push(format!("{}: {}", title, body));
        }
        fn agreement(&mut self, _text: &str) -> bool {
            true
        }
    }

    fn test_client(ui: RecordingUi) -> Client {
        Client::new(ClientPrefs::default(), Box::new(ui))
            .with_ids(Box::new(SeqIds::reference()))
    }

    #[tokio::test]
    async fn test_reply_correlation_recovers_type() {
        let ui = RecordingUi::default();
        let mut client = test_client(ui.clone());
        // Pretend we sent a GET_MSGS request under ID 42.
        client
            .active_tasks
            .insert(42, Transaction::request(tran::GET_MSGS, 42, vec![]));

        let mut reply = Transaction::reply_to(
            &Transaction::request(tran::GET_MSGS, 42, vec![]),
            vec![Field::new(field::DATA, b"board text".to_vec())],
        );
        // On the wire a reply's type can be zeroed; the map restores it.
        reply.ty = 0;
        client.handle_transaction(reply).await.expect("handle");

        assert_eq!(client.pending_requests(), 0);
        assert_eq!(ui.modals.lock().unwrap().as_slice(), ["News: board text"]);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let ui = RecordingUi::default();
        let mut client = test_client(ui.clone());
        let reply =
            Transaction::reply_to(&Transaction::request(tran::GET_MSGS, 7, vec![]), vec![]);
        client.handle_transaction(reply).await.expect("handle");
        assert!(ui.modals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_modal() {
        let ui = RecordingUi::default();
        let mut client = test_client(ui.clone());
        let req = Transaction::request(tran::CHAT_SEND, 9, vec![]);
        client.active_tasks.insert(9, req.clone());
        let err = Transaction::error_reply(&req, "You are not allowed to participate in chat.");
        client.handle_transaction(err).await.expect("handle");
        assert_eq!(
            ui.modals.lock().unwrap().as_slice(),
            ["Error: You are not allowed to participate in chat."]
        );
    }

    #[tokio::test]
    async fn test_chat_and_user_list_updates() {
        let ui = RecordingUi::default();
        let mut client = test_client(ui.clone());

        let chat = Transaction::request(
            tran::CHAT_MSG,
            1,
            vec![Field::new(field::DATA, b"\r  someone:  hai".to_vec())],
        );
        client.handle_transaction(chat).await.expect("handle");
        assert_eq!(ui.chat.lock().unwrap().len(), 1);

        let joined = Transaction::request(
            tran::NOTIFY_CHANGE_USER,
            2,
            vec![
                Field::from_u16(field::USER_ID, 5),
                Field::from_u16(field::USER_FLAGS, 0),
                Field::new(field::USER_NAME, b"someone".to_vec()),
                Field::from_u16(field::USER_ICON_ID, 145),
            ],
        );
        client.handle_transaction(joined).await.expect("handle");
        assert_eq!(client.user_list.len(), 1);

        // A second notify for the same ID updates instead of appending.
        let renamed = Transaction::request(
            tran::NOTIFY_CHANGE_USER,
            3,
            vec![
                Field::from_u16(field::USER_ID, 5),
                Field::from_u16(field::USER_FLAGS, 0),
                Field::new(field::USER_NAME, b"renamed".to_vec()),
                Field::from_u16(field::USER_ICON_ID, 145),
            ],
        );
        client.handle_transaction(renamed).await.expect("handle");
        assert_eq!(client.user_list.len(), 1);
        assert_eq!(client.user_list[0].name, b"renamed");

        let left = Transaction::request(
            tran::NOTIFY_DELETE_USER,
            4,
            vec![Field::from_u16(field::USER_ID, 5)],
        );
        client.handle_transaction(left).await.expect("handle");
        assert!(client.user_list.is_empty());
    }
}
