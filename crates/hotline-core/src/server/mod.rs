//! The server engine.
//!
//! Each accepted connection runs a handshake, a login exchange, then an
//! active loop with two tasks: a reader that frames and dispatches
//! transactions, and a writer that drains the session's outbox to the
//! socket. A second listener serves the file-transfer side channel.
//! Timers (idle ticker, transfer inactivity) run on their own tasks,
//! and a root watch channel fans cancellation out to every session.

mod dispatcher;
mod handlers;
mod state;
mod transfer;

pub use dispatcher::{dispatch, handler_for, Handler, RequiredField};
pub use state::{err_reply, reply, ClientSession, PrivateChat, ServerState, OUTBOX_CAPACITY};
pub use transfer::{flatten_file_bytes, run_transfer_listener};

use crate::account::{seed_defaults, AccountStore};
use crate::error::{Error, Result};
use crate::logging::RedactedBytes;
use crate::news::ThreadedNews;
use crate::protocol::{
    field, negate, tran, Field, Transaction, TransactionReader, CLIENT_HANDSHAKE, SERVER_HANDSHAKE,
};
use crate::user::{flag, with_flag};
use crate::{DEFAULT_FLAT_NEWS_LIMIT, DEFAULT_TRANSFER_CAP, HANDSHAKE_DEADLINE_SECS};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Version number reported in login replies.
pub const SERVER_VERSION: u16 = 151;

/// Server configuration, populated by the binary from flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server name shown to clients.
    pub name: String,
    /// Address to bind both listeners on.
    pub bind_addr: String,
    /// Main protocol port; the transfer listener uses the next port.
    pub port: u16,
    /// Root of the served file tree.
    pub file_root: PathBuf,
    /// Directory holding Agreement.txt, MessageBoard.txt,
    /// ThreadedNews.yaml and Users/.
    pub data_dir: PathBuf,
    /// Maximum concurrent users.
    pub max_users: usize,
    /// Maximum concurrent transfers per user.
    pub transfer_cap: usize,
    /// Flat news size cap in bytes; the tail is truncated.
    pub flat_news_limit: usize,
    /// Seconds of inactivity before a user is flagged away.
    pub idle_threshold_secs: u64,
    /// Agreement text shown after login.
    pub agreement: String,
    /// Whether mutations are written through to disk.
    pub persist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Hotline Server".into(),
            bind_addr: "0.0.0.0".into(),
            port: 5500,
            file_root: PathBuf::from("Files"),
            data_dir: PathBuf::from("."),
            max_users: 100,
            transfer_cap: DEFAULT_TRANSFER_CAP,
            flat_news_limit: DEFAULT_FLAT_NEWS_LIMIT,
            idle_threshold_secs: 600,
            agreement: String::new(),
            persist: false,
        }
    }
}

impl Config {
    /// Main listener address.
    pub fn main_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    /// Transfer listener address (main port + 1).
    pub fn transfer_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port + 1)
    }

    /// Path of the flat news board.
    pub fn message_board_path(&self) -> PathBuf {
        self.data_dir.join("MessageBoard.txt")
    }

    /// Path of the threaded news board.
    pub fn threaded_news_path(&self) -> PathBuf {
        self.data_dir.join("ThreadedNews.yaml")
    }

    /// Path of the agreement text.
    pub fn agreement_path(&self) -> PathBuf {
        self.data_dir.join("Agreement.txt")
    }

    /// Directory of per-login account files.
    pub fn users_dir(&self) -> PathBuf {
        self.data_dir.join("Users")
    }
}

/// The server: shared state behind one coarse mutex.
pub struct HotlineServer {
    /// All mutable server state.
    pub state: Mutex<ServerState>,
}

impl HotlineServer {
    /// Wrap prepared state.
    pub fn new(state: ServerState) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(state) })
    }

    /// Load persisted state from `config`'s data directory: accounts
    /// (seeding the defaults into an empty directory), both news boards
    /// and the agreement text. Creates missing directories.
    pub fn bootstrap(mut config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.file_root)?;
        let store = AccountStore::open(config.users_dir())?;
        let mut accounts = store.load_all()?;
        if accounts.is_empty() {
            info!("no accounts found, seeding admin and guest");
            accounts = seed_defaults(&store)?;
        }
        let flat_news = std::fs::read(config.message_board_path()).unwrap_or_default();
        let threaded_news = match std::fs::read_to_string(config.threaded_news_path()) {
            Ok(raw) => ThreadedNews::from_yaml(&raw)
                .map_err(|e| Error::Storage(format!("corrupt ThreadedNews.yaml: {}", e)))?,
            Err(_) => ThreadedNews::default(),
        };
        if let Ok(agreement) = std::fs::read_to_string(config.agreement_path()) {
            config.agreement = agreement;
        }
        config.persist = true;

        let mut state = ServerState::new(config);
        state.accounts = accounts;
        state.flat_news = flat_news;
        state.threaded_news = threaded_news;
        state.account_store = Some(store);
        Ok(Self::new(state))
    }

    /// Lock the state mutex.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind both listeners from the configuration and serve until
    /// `shutdown` fires.
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let (main_addr, transfer_addr) = {
            let state = self.lock();
            (state.config.main_addr(), state.config.transfer_addr())
        };
        let main = TcpListener::bind(&main_addr)
            .await
            .map_err(|e| Error::Protocol(format!("bind {}: {}", main_addr, e)))?;
        let transfers = TcpListener::bind(&transfer_addr)
            .await
            .map_err(|e| Error::Protocol(format!("bind {}: {}", transfer_addr, e)))?;
        info!(main = %main_addr, transfers = %transfer_addr, "hotline server listening");
        self.serve(main, transfers, shutdown).await
    }

    /// Serve on pre-bound listeners. Tests bind port 0 and call this.
    pub async fn serve(
        self: &Arc<Self>,
        main: TcpListener,
        transfers: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let ticker = Arc::clone(self);
        let ticker_shutdown = shutdown.clone();
        tokio::spawn(async move { ticker.idle_ticker(ticker_shutdown).await });

        let xfer = Arc::clone(self);
        let xfer_shutdown = shutdown.clone();
        tokio::spawn(async move { run_transfer_listener(xfer, transfers, xfer_shutdown).await });

        let mut shutdown_rx = shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = main.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(self);
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, addr, conn_shutdown).await {
                            debug!(%addr, error = %e, "session closed");
                        }
                    });
                }
            }
        }

        // Root cancellation: wake every session so its reader exits and
        // closes the connection.
        let state = self.lock();
        for session in state.clients.values() {
            session.shutdown.notify_one();
        }
        info!("hotline server stopped");
        Ok(())
    }

    /// Periodic idle bookkeeping: bump per-session idle counters and
    /// flag users away once they cross the threshold.
    async fn idle_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = interval.tick() => {}
            }
            let mut state = self.lock();
            let threshold = state.config.idle_threshold_secs;
            let mut newly_idle = Vec::new();
            for (id, session) in state.clients.iter_mut() {
                if !session.agreed {
                    continue;
                }
                session.idle_seconds += 1;
                if session.idle_seconds >= threshold && !session.idle {
                    session.idle = true;
                    session.flags = with_flag(session.flags, flag::AWAY, true);
                    newly_idle.push(*id);
                }
            }
            for id in newly_idle {
                let out = change_user_notification(&mut state, id);
                route(&mut state, id, out);
            }
        }
    }

    /// Run one main-port connection through its whole life cycle.
    async fn handle_connection(
        self: &Arc<Self>,
        mut socket: TcpStream,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        handshake(&mut socket).await?;
        debug!(%addr, "handshake complete");

        let mut framer = TransactionReader::new();
        let login = read_one_transaction(&mut socket, &mut framer).await?;
        let (session_id, outbox_rx, session_shutdown) =
            match self.login(&login, &addr).await {
                Ok(parts) => parts,
                Err(LoginFailure(msg)) => {
                    let rejection = Transaction::error_reply(&login, &msg);
                    let _ = socket.write_all(&rejection.to_bytes()).await;
                    return Ok(());
                }
            };

        let (mut rd, wr) = socket.into_split();
        let writer = tokio::spawn(drain_outbox(outbox_rx, wr));

        // Active loop: frame, dispatch, route, until the peer hangs up
        // or someone asks us to stop.
        let mut buf = vec![0u8; 4096];
        let result = loop {
            tokio::select! {
                _ = session_shutdown.notified() => break Ok(()),
                _ = shutdown.changed() => break Ok(()),
                read = rd.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => n,
                        Err(e) => break Err(Error::from(e)),
                    };
                    framer.push(&buf[..n]);
                    match self.pump(session_id, &mut framer) {
                        Ok(()) => {}
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        writer.abort();
        let mut state = self.lock();
        let farewells = state.remove_session(session_id);
        route(&mut state, session_id, farewells);
        drop(state);
        debug!(%addr, session_id, "session removed");
        result
    }

    /// Drain every framed transaction through the dispatcher.
    fn pump(&self, session_id: u16, framer: &mut TransactionReader) -> Result<()> {
        while let Some(t) = framer.try_read()? {
            let mut state = self.lock();
            let agreed = state.session(session_id).map(|s| s.agreed).unwrap_or(false);
            let out = if !agreed && !matches!(t.ty, tran::AGREED | tran::KEEP_ALIVE) {
                warn!(session_id, ty = t.ty, "transaction before agreement, dropping");
                Vec::new()
            } else {
                dispatch(&mut state, session_id, &t)?
            };
            route(&mut state, session_id, out);

            if t.ty != tran::KEEP_ALIVE {
                let wake = clear_idle(&mut state, session_id);
                route(&mut state, session_id, wake);
            }

            // Kicks requested by the handler (disconnect user).
            let kicked = std::mem::take(&mut state.pending_disconnects);
            for target in kicked {
                if let Some(session) = state.session(target) {
                    info!(user_id = target, "disconnecting user");
                    session.shutdown.notify_one();
                }
            }
        }
        Ok(())
    }

    /// Validate credentials and install the session. Returns the new
    /// session ID, the outbox receiver for the writer task and the
    /// per-session shutdown handle.
    async fn login(
        self: &Arc<Self>,
        t: &Transaction,
        addr: &SocketAddr,
    ) -> std::result::Result<
        (u16, mpsc::Receiver<Transaction>, Arc<tokio::sync::Notify>),
        LoginFailure,
    > {
        if t.ty != tran::LOGIN {
            return Err(LoginFailure("Expected login.".into()));
        }
        let login_bytes = t.field_data(field::USER_LOGIN).map(negate).unwrap_or_default();
        let login = if login_bytes.is_empty() {
            "guest".to_string()
        } else {
            String::from_utf8_lossy(&login_bytes).into_owned()
        };
        let password = t.field_data(field::USER_PASSWORD).unwrap_or_default();

        let mut state = self.lock();
        debug!(login = %login, password = %RedactedBytes(password), "login attempt");
        if state.clients.len() >= state.config.max_users {
            return Err(LoginFailure("The server is full.".into()));
        }
        let account = match state.accounts.get(&login) {
            Some(account) if account.verify_wire_password(password) => account.clone(),
            _ => {
                warn!(login = %login, %addr, "login rejected");
                return Err(LoginFailure("Incorrect login.".into()));
            }
        };

        let session_id = state.assign_user_id();
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let mut session = ClientSession::new(session_id, addr.to_string(), account);
        if let Some(name) = t.field_data(field::USER_NAME) {
            session.user_name = name.to_vec();
        }
        if let Some(icon) = t.field(field::USER_ICON_ID) {
            session.icon = icon.as_u16();
        }
        session.outbox = Some(tx);
        let session_shutdown = Arc::clone(&session.shutdown);
        state.clients.insert(session_id, session);
        info!(login = %login, session_id, %addr, "user logged in");

        let server_name = state.config.name.clone();
        let agreement = state.config.agreement.clone();
        let greeting = reply(
            session_id,
            t,
            vec![
                Field::from_u16(field::VERSION, SERVER_VERSION),
                Field::from_u16(field::BANNER_ID, 0),
                Field::new(field::SERVER_NAME, server_name.into_bytes()),
            ],
        );
        let show_agreement = {
            let id = state.next_tran_id();
            Transaction::request(
                tran::SHOW_AGREEMENT,
                id,
                vec![Field::new(field::DATA, agreement.into_bytes())],
            )
            .to_client(session_id)
        };
        route(&mut state, session_id, vec![greeting, show_agreement]);

        Ok((session_id, rx, session_shutdown))
    }
}

/// Login rejection message delivered as an error reply before closing.
struct LoginFailure(String);

/// Perform the server side of the 12-byte main-port handshake.
async fn handshake(socket: &mut TcpStream) -> Result<()> {
    let mut buf = [0u8; 12];
    tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_DEADLINE_SECS),
        socket.read_exact(&mut buf),
    )
    .await
    .map_err(|_| Error::Timeout)??;

    if buf[0..8] != CLIENT_HANDSHAKE[0..8] || buf[8..10] != CLIENT_HANDSHAKE[8..10] {
        // Magic + error code 1, then close.
        let mut rejection = SERVER_HANDSHAKE;
        rejection[7] = 1;
        let _ = socket.write_all(&rejection).await;
        return Err(Error::Protocol("bad handshake".into()));
    }
    socket.write_all(&SERVER_HANDSHAKE).await?;
    Ok(())
}

/// Read whole frames off `socket` until one transaction is complete.
async fn read_one_transaction(
    socket: &mut TcpStream,
    framer: &mut TransactionReader,
) -> Result<Transaction> {
    let mut buf = vec![0u8; 4096];
    loop {
        if let Some(t) = framer.try_read()? {
            return Ok(t);
        }
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::Protocol("connection closed during login".into()));
        }
        framer.push(&buf[..n]);
    }
}

/// Writer task: serialize outbound transactions in enqueue order.
async fn drain_outbox(mut rx: mpsc::Receiver<Transaction>, mut wr: OwnedWriteHalf) {
    while let Some(t) = rx.recv().await {
        if let Err(e) = wr.write_all(&t.to_bytes()).await {
            debug!(error = %e, "outbox write failed");
            return;
        }
    }
}

/// Enqueue transactions on their destination sessions' outboxes. A
/// transaction with no destination goes back to `origin`. Enqueue never
/// blocks: a full outbox marks the session stuck and tears it down.
pub fn route(state: &mut ServerState, origin: u16, transactions: Vec<Transaction>) {
    let mut stuck = Vec::new();
    for t in transactions {
        let dest = t.client_id.unwrap_or(origin);
        let Some(session) = state.session(dest) else { continue };
        let Some(outbox) = &session.outbox else { continue };
        match outbox.try_send(t) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(dest, "outbox full, dropping session");
                stuck.push(dest);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
    for dest in stuck {
        if let Some(session) = state.session(dest) {
            session.shutdown.notify_one();
        }
    }
}

/// Reset the idle clock after a non-keep-alive transaction; if the
/// session had been flagged away, clear the flag and tell the others.
pub fn clear_idle(state: &mut ServerState, session_id: u16) -> Vec<Transaction> {
    let Some(session) = state.session_mut(session_id) else {
        return Vec::new();
    };
    session.idle_seconds = 0;
    if !session.idle {
        return Vec::new();
    }
    session.idle = false;
    session.flags = with_flag(session.flags, flag::AWAY, false);
    change_user_notification(state, session_id)
}

/// Broadcast a user's current name, icon and flags to everyone else.
fn change_user_notification(state: &mut ServerState, session_id: u16) -> Vec<Transaction> {
    let Some(session) = state.session(session_id) else {
        return Vec::new();
    };
    let fields = vec![
        Field::from_u16(field::USER_ID, session_id),
        Field::from_u16(field::USER_FLAGS, session.flags),
        Field::new(field::USER_NAME, session.user_name.clone()),
        Field::from_u16(field::USER_ICON_ID, session.icon),
    ];
    state.notify_others(session_id, tran::NOTIFY_CHANGE_USER, fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessBitmap;
    use crate::account::Account;
    use crate::rng::SeqIds;

    fn test_state() -> ServerState {
        let mut state = ServerState::new(Config::default());
        state.ids = Box::new(SeqIds::reference());
        state
    }

    fn add_session(state: &mut ServerState, id: u16, agreed: bool) {
        let account = Account {
            login: format!("user{}", id),
            name: "User".into(),
            password: String::new(),
            access: AccessBitmap::all(),
        };
        let mut session = ClientSession::new(id, "127.0.0.1:0".into(), account);
        session.agreed = agreed;
        session.user_name = format!("user{}", id).into_bytes();
        state.clients.insert(id, session);
    }

    #[test]
    fn test_clear_idle_broadcasts_once_when_away() {
        let mut state = test_state();
        add_session(&mut state, 1, true);
        add_session(&mut state, 2, true);
        add_session(&mut state, 3, true);

        {
            let s = state.session_mut(2).unwrap();
            s.idle = true;
            s.flags = with_flag(0, flag::AWAY, true);
            s.idle_seconds = 1000;
        }
        let out = clear_idle(&mut state, 2);
        // Away bit cleared, one notification per *other* session.
        let s = state.session(2).unwrap();
        assert!(!s.idle);
        assert_eq!(s.flags, 0);
        assert_eq!(s.idle_seconds, 0);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|t| t.ty == tran::NOTIFY_CHANGE_USER));
        assert_eq!(out[0].client_id, Some(1));
        assert_eq!(out[1].client_id, Some(3));

        // Not away: silent reset.
        let out = clear_idle(&mut state, 2);
        assert!(out.is_empty());
    }

    #[test]
    fn test_config_paths() {
        let config = Config { data_dir: PathBuf::from("/srv/hl"), ..Config::default() };
        assert_eq!(config.message_board_path(), PathBuf::from("/srv/hl/MessageBoard.txt"));
        assert_eq!(config.threaded_news_path(), PathBuf::from("/srv/hl/ThreadedNews.yaml"));
        assert_eq!(config.users_dir(), PathBuf::from("/srv/hl/Users"));
        assert_eq!(config.transfer_addr(), "0.0.0.0:5501");
    }
}
