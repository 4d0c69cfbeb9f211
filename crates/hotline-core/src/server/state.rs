//! Shared server state and per-session bookkeeping.
//!
//! One coarse mutex guards all of this (clients, accounts, chats,
//! transfer reservations, news). Contention is low at this scale and a
//! single lock cannot deadlock between fan-outs and user-list
//! mutations; handlers hold it only to mutate maps and enqueue
//! outbound transactions.

use super::Config;
use crate::access::perm;
use crate::account::{Account, AccountStore};
use crate::error::{Error, Result};
use crate::news::ThreadedNews;
use crate::protocol::{field, Field, Transaction};
use crate::rng::{IdSource, RandomIds};
use crate::transfer::{FileTransfer, TransferKind};
use crate::user::User;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

/// Outbound queue depth per session. Enqueue never blocks a handler;
/// a session whose queue is full is considered stuck and dropped.
pub const OUTBOX_CAPACITY: usize = 64;

/// An invitation-only chat room.
#[derive(Debug, Clone, Default)]
pub struct PrivateChat {
    /// Room subject line.
    pub subject: String,
    /// Member connection IDs.
    pub members: BTreeSet<u16>,
}

/// Server-side state for one connected client.
pub struct ClientSession {
    /// Connection-unique ID.
    pub id: u16,
    /// Peer address, for logging and client-info text.
    pub remote_addr: String,
    /// Display name chosen by the client.
    pub user_name: Vec<u8>,
    /// Icon ID.
    pub icon: u16,
    /// 2-byte flag bitmap (away, admin, refuse-PM, refuse-chat).
    pub flags: u16,
    /// Account snapshot taken at login.
    pub account: Account,
    /// Seconds since the last non-keep-alive transaction.
    pub idle_seconds: u64,
    /// Whether the away flag was set by the idle ticker.
    pub idle: bool,
    /// True once the client has acknowledged the agreement.
    pub agreed: bool,
    /// Automatic reply to instant messages; empty when unset.
    pub auto_reply: Vec<u8>,
    /// Transfers registered or running for this session.
    pub active_transfers: usize,
    /// Outbound queue; `None` for sessions built directly in tests.
    pub outbox: Option<mpsc::Sender<Transaction>>,
    /// Signalled to tear the connection down (kick, stuck outbox).
    pub shutdown: Arc<Notify>,
}

impl ClientSession {
    /// Create a session for `account` with empty runtime state.
    pub fn new(id: u16, remote_addr: String, account: Account) -> Self {
        Self {
            id,
            remote_addr,
            user_name: Vec::new(),
            icon: 0,
            flags: 0,
            account,
            idle_seconds: 0,
            idle: false,
            agreed: false,
            auto_reply: Vec::new(),
            active_transfers: 0,
            outbox: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// The session as a wire user record.
    pub fn user(&self) -> User {
        User { id: self.id, icon: self.icon, flags: self.flags, name: self.user_name.clone() }
    }
}

/// Build a success reply to `req` routed back to `session_id`.
pub fn reply(session_id: u16, req: &Transaction, fields: Vec<Field>) -> Transaction {
    Transaction::reply_to(req, fields).to_client(session_id)
}

/// Build an error reply (type 0, error code 1) routed to `session_id`.
pub fn err_reply(session_id: u16, req: &Transaction, msg: &str) -> Transaction {
    Transaction::error_reply(req, msg).to_client(session_id)
}

/// Everything the handlers read and mutate, behind the server mutex.
pub struct ServerState {
    /// Server configuration.
    pub config: Config,
    /// Connected sessions by connection ID.
    pub clients: HashMap<u16, ClientSession>,
    /// Accounts by login.
    pub accounts: HashMap<String, Account>,
    /// Private chat rooms by chat ID.
    pub private_chats: HashMap<u32, PrivateChat>,
    /// Pending transfer reservations by reference number.
    pub file_transfers: HashMap<u32, FileTransfer>,
    /// The flat message board.
    pub flat_news: Vec<u8>,
    /// The threaded message board.
    pub threaded_news: ThreadedNews,
    /// Filesystem abstraction for the served tree.
    pub fs: Arc<dyn crate::files::FileStore>,
    /// Request-ID / refnum source.
    pub ids: Box<dyn IdSource>,
    /// Account persistence; `None` disables it (tests).
    pub account_store: Option<AccountStore>,
    /// Sessions the current dispatch decided to drop.
    pub pending_disconnects: Vec<u16>,
    next_user_id: u16,
}

impl ServerState {
    /// Create state over `config` with production defaults.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clients: HashMap::new(),
            accounts: HashMap::new(),
            private_chats: HashMap::new(),
            file_transfers: HashMap::new(),
            flat_news: Vec::new(),
            threaded_news: ThreadedNews::default(),
            fs: Arc::new(crate::files::OsFileStore),
            ids: Box::new(RandomIds::new()),
            account_store: None,
            pending_disconnects: Vec::new(),
            next_user_id: 0,
        }
    }

    /// Draw a fresh transaction ID / reference number.
    pub fn next_tran_id(&mut self) -> u32 {
        self.ids.next_id()
    }

    /// Assign the next connection ID, skipping values still in use.
    pub fn assign_user_id(&mut self) -> u16 {
        loop {
            self.next_user_id = self.next_user_id.wrapping_add(1);
            if !self.clients.contains_key(&self.next_user_id) {
                return self.next_user_id;
            }
        }
    }

    /// Session lookup.
    pub fn session(&self, id: u16) -> Option<&ClientSession> {
        self.clients.get(&id)
    }

    /// Mutable session lookup.
    pub fn session_mut(&mut self, id: u16) -> Option<&mut ClientSession> {
        self.clients.get_mut(&id)
    }

    /// Session lookup that surfaces a protocol error when absent.
    pub fn require_session(&self, id: u16) -> Result<&ClientSession> {
        self.session(id).ok_or_else(|| Error::NotFound(format!("session {}", id)))
    }

    /// Connection IDs in ascending order, the stable broadcast order.
    pub fn sorted_client_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Clone one notification per other agreed session, all sharing one
    /// freshly drawn request ID, in ascending connection order.
    pub fn notify_others(&mut self, origin: u16, ty: u16, fields: Vec<Field>) -> Vec<Transaction> {
        let id = self.next_tran_id();
        self.sorted_client_ids()
            .into_iter()
            .filter(|&cid| cid != origin)
            .filter(|cid| self.clients[cid].agreed)
            .map(|cid| Transaction::request(ty, id, fields.clone()).to_client(cid))
            .collect()
    }

    /// One transaction per recipient, each with its own request ID, in
    /// the order given.
    pub fn fan_out(&mut self, ty: u16, fields: Vec<Field>, recipients: &[u16]) -> Vec<Transaction> {
        recipients
            .iter()
            .map(|&cid| {
                let id = self.next_tran_id();
                Transaction::request(ty, id, fields.clone()).to_client(cid)
            })
            .collect()
    }

    /// Members of `chat_id` in ascending connection order, minus
    /// `exclude`.
    pub fn chat_members_sorted(&self, chat_id: u32, exclude: Option<u16>) -> Vec<u16> {
        match self.private_chats.get(&chat_id) {
            Some(chat) => {
                chat.members.iter().copied().filter(|&m| Some(m) != exclude).collect()
            }
            None => Vec::new(),
        }
    }

    /// Clone one notification per member of `chat_id` (minus `exclude`),
    /// sharing one request ID, ascending.
    pub fn clone_to_chat_members(
        &mut self,
        chat_id: u32,
        exclude: Option<u16>,
        ty: u16,
        fields: Vec<Field>,
    ) -> Vec<Transaction> {
        let members: Vec<u16> = match self.private_chats.get(&chat_id) {
            Some(chat) => chat.members.iter().copied().collect(),
            None => return Vec::new(),
        };
        let id = self.next_tran_id();
        members
            .into_iter()
            .filter(|&m| Some(m) != exclude)
            .map(|m| Transaction::request(ty, id, fields.clone()).to_client(m))
            .collect()
    }

    /// Register a pending transfer, enforcing the per-user cap, and
    /// return its reference number.
    pub fn register_transfer(
        &mut self,
        client_id: u16,
        kind: TransferKind,
        path: PathBuf,
        size: u64,
        offset: u64,
        folder_items: Vec<PathBuf>,
    ) -> Result<u32> {
        let cap = self.config.transfer_cap;
        let session = self
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| Error::NotFound(format!("session {}", client_id)))?;
        if session.active_transfers >= cap {
            return Err(Error::Storage("transfer cap reached".into()));
        }
        session.active_transfers += 1;
        let mut refnum = self.ids.next_id();
        while self.file_transfers.contains_key(&refnum) {
            refnum = self.ids.next_id();
        }
        self.file_transfers.insert(
            refnum,
            FileTransfer { refnum, kind, client_id, path, size, offset, folder_items },
        );
        Ok(refnum)
    }

    /// Consume a reservation. Each refnum redeems at most once; a
    /// second presentation returns `None`.
    pub fn consume_transfer(&mut self, refnum: u32) -> Option<FileTransfer> {
        self.file_transfers.remove(&refnum)
    }

    /// Release a slot once a consumed transfer finishes or aborts.
    pub fn finish_transfer(&mut self, client_id: u16) {
        if let Some(session) = self.clients.get_mut(&client_id) {
            session.active_transfers = session.active_transfers.saturating_sub(1);
        }
    }

    /// Drop a session's state: remove it from the map and every chat,
    /// discard its reservations, and tell the others.
    pub fn remove_session(&mut self, id: u16) -> Vec<Transaction> {
        if self.clients.remove(&id).is_none() {
            return Vec::new();
        }
        let stale: Vec<u32> = self
            .file_transfers
            .values()
            .filter(|t| t.client_id == id)
            .map(|t| t.refnum)
            .collect();
        for refnum in stale {
            self.file_transfers.remove(&refnum);
        }
        let emptied: Vec<u32> = self
            .private_chats
            .iter_mut()
            .filter_map(|(chat_id, chat)| {
                chat.members.remove(&id);
                chat.members.is_empty().then_some(*chat_id)
            })
            .collect();
        for chat_id in emptied {
            self.private_chats.remove(&chat_id);
        }
        self.notify_others(id, crate::protocol::tran::NOTIFY_DELETE_USER, vec![Field::from_u16(
            field::USER_ID,
            id,
        )])
    }

    /// Write `account` through to disk (when persistence is on) and the
    /// in-memory map.
    pub fn upsert_account(&mut self, account: Account) -> Result<()> {
        if let Some(store) = &self.account_store {
            store.save(&account)?;
        }
        self.accounts.insert(account.login.clone(), account);
        Ok(())
    }

    /// Delete an account from disk and the map.
    pub fn delete_account(&mut self, login: &str) -> Result<()> {
        if self.accounts.remove(login).is_none() {
            return Err(Error::NotFound(format!("account {}", login)));
        }
        if let Some(store) = &self.account_store {
            store.delete(login)?;
        }
        Ok(())
    }

    /// Persist the flat board to `MessageBoard.txt`.
    pub fn persist_flat_news(&self) {
        if !self.config.persist {
            return;
        }
        let path = self.config.message_board_path();
        if let Err(e) = std::fs::write(&path, &self.flat_news) {
            warn!(path = %path.display(), error = %e, "failed to write message board");
        }
    }

    /// Persist the threaded board to `ThreadedNews.yaml`.
    pub fn persist_threaded_news(&self) {
        if !self.config.persist {
            return;
        }
        let path = self.config.threaded_news_path();
        match self.threaded_news.to_yaml() {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(&path, yaml) {
                    warn!(path = %path.display(), error = %e, "failed to write threaded news");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize threaded news"),
        }
    }

    /// Whether `login`'s account may not be forcibly disconnected.
    pub fn is_undisconnectable(&self, session_id: u16) -> bool {
        self.session(session_id)
            .map(|s| s.account.access.has(perm::CANNOT_BE_DISCON))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessBitmap;
    use crate::protocol::tran;
    use crate::rng::SeqIds;

    fn test_account() -> Account {
        Account {
            login: "guest".into(),
            name: "Guest".into(),
            password: String::new(),
            access: AccessBitmap::all(),
        }
    }

    fn state_with_sessions(n: u16) -> ServerState {
        let mut state = ServerState::new(Config::default());
        state.ids = Box::new(SeqIds::reference());
        for i in 1..=n {
            let mut s = ClientSession::new(i, "127.0.0.1".into(), test_account());
            s.agreed = true;
            state.clients.insert(i, s);
        }
        state
    }

    #[test]
    fn test_user_id_assignment_skips_live_ids() {
        let mut state = state_with_sessions(2);
        state.next_user_id = 0;
        // 1 and 2 are taken.
        assert_eq!(state.assign_user_id(), 3);
    }

    #[test]
    fn test_notify_others_shares_one_id_and_skips_origin() {
        let mut state = state_with_sessions(3);
        let out = state.notify_others(2, tran::NOTIFY_CHANGE_USER, vec![]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].client_id, Some(1));
        assert_eq!(out[1].client_id, Some(3));
        assert_eq!(out[0].id, 0x9acb_0442);
        assert_eq!(out[1].id, 0x9acb_0442);
    }

    #[test]
    fn test_fan_out_draws_fresh_ids() {
        let mut state = state_with_sessions(2);
        let out = state.fan_out(tran::CHAT_MSG, vec![], &[1, 2]);
        assert_eq!(out[0].id, 0x9acb_0442);
        assert_eq!(out[1].id, 0xf0c5_341e);
    }

    #[test]
    fn test_transfer_reservation_is_one_shot() {
        let mut state = state_with_sessions(1);
        let refnum = state
            .register_transfer(1, TransferKind::FileDownload, "/tmp/f".into(), 10, 0, vec![])
            .expect("register");
        assert!(state.consume_transfer(refnum).is_some());
        assert!(state.consume_transfer(refnum).is_none());
    }

    #[test]
    fn test_transfer_cap_enforced() {
        let mut state = state_with_sessions(1);
        for _ in 0..state.config.transfer_cap {
            state
                .register_transfer(1, TransferKind::FileDownload, "/tmp/f".into(), 1, 0, vec![])
                .expect("register");
        }
        let over =
            state.register_transfer(1, TransferKind::FileDownload, "/tmp/f".into(), 1, 0, vec![]);
        assert!(over.is_err());
    }

    #[test]
    fn test_remove_session_cleans_up_and_notifies() {
        let mut state = state_with_sessions(3);
        state
            .register_transfer(2, TransferKind::FileUpload, "/tmp/u".into(), 1, 0, vec![])
            .expect("register");
        let mut chat = PrivateChat::default();
        chat.members.insert(2);
        state.private_chats.insert(7, chat);

        let out = state.remove_session(2);
        assert!(state.clients.get(&2).is_none());
        assert!(state.file_transfers.is_empty());
        assert!(state.private_chats.is_empty(), "emptied chat is destroyed");
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|t| t.ty == tran::NOTIFY_DELETE_USER));
        assert_eq!(out[0].field(field::USER_ID).map(|f| f.as_u16()), Some(2));
    }
}
