//! Transaction dispatch: a fixed table keyed by transaction code.
//!
//! Each entry names the handler, the fields it cannot run without, and
//! the permission bit that gates it. Validation order: handler lookup,
//! required fields (missing or short fields log a warning and drop the
//! request silently), then the access gate (denied requests get an
//! error reply and the session stays open).

use super::handlers;
use super::state::{err_reply, ServerState};
use crate::access::perm;
use crate::error::Result;
use crate::protocol::{field, tran, Transaction};
use tracing::{debug, warn};

/// A field a handler requires, with the minimum payload length.
pub struct RequiredField {
    /// Field ID.
    pub id: u16,
    /// Minimum number of payload bytes.
    pub min_len: usize,
}

/// Handler function shape: full state access, the calling session and
/// the inbound transaction; returns the outbound transactions.
pub type HandlerFn = fn(&mut ServerState, u16, &Transaction) -> Result<Vec<Transaction>>;

/// One row of the dispatch table.
pub struct Handler {
    /// Name used in logs.
    pub name: &'static str,
    /// Permission bit required, if any.
    pub access: Option<u8>,
    /// Error-reply text when the access gate denies.
    pub denied: &'static str,
    /// Fields validated before the handler runs.
    pub required: &'static [RequiredField],
    /// The handler itself.
    pub func: HandlerFn,
}

macro_rules! handler {
    ($name:literal, $func:path) => {
        handler!($name, None, "", &[], $func)
    };
    ($name:literal, $access:expr, $denied:literal, $required:expr, $func:path) => {
        Handler {
            name: $name,
            access: $access,
            denied: $denied,
            required: $required,
            func: $func,
        }
    };
}

const REQ_DATA: &[RequiredField] = &[RequiredField { id: field::DATA, min_len: 1 }];
const REQ_FILE_NAME: &[RequiredField] = &[RequiredField { id: field::FILE_NAME, min_len: 1 }];
const REQ_USER_ID: &[RequiredField] = &[RequiredField { id: field::USER_ID, min_len: 2 }];
const REQ_USER_LOGIN: &[RequiredField] = &[RequiredField { id: field::USER_LOGIN, min_len: 1 }];
const REQ_CHAT_ID: &[RequiredField] = &[RequiredField { id: field::CHAT_ID, min_len: 4 }];

/// Find the table entry for a transaction code.
pub fn handler_for(ty: u16) -> Option<&'static Handler> {
    static GET_MSGS: Handler = handler!(
        "GetMsgs",
        Some(perm::NEWS_READ_ART),
        "You are not allowed to read news.",
        &[],
        handlers::get_msgs
    );
    static POST_NEWS: Handler = handler!(
        "PostNews",
        Some(perm::NEWS_POST_ART),
        "You are not allowed to post news.",
        REQ_DATA,
        handlers::post_news
    );
    static CHAT_SEND: Handler = handler!(
        "ChatSend",
        Some(perm::SEND_CHAT),
        "You are not allowed to participate in chat.",
        REQ_DATA,
        handlers::chat_send
    );
    static SEND_INSTANT_MSG: Handler = handler!(
        "SendInstantMsg",
        None,
        "",
        &[
            RequiredField { id: field::DATA, min_len: 1 },
            RequiredField { id: field::USER_ID, min_len: 2 },
        ],
        handlers::send_instant_msg
    );
    static DISCONNECT_USER: Handler = handler!(
        "DisconnectUser",
        Some(perm::DISCON_USER),
        "You are not allowed to disconnect users.",
        REQ_USER_ID,
        handlers::disconnect_user
    );
    static AGREED: Handler = handler!("Agreed", handlers::agreed);
    static GET_USER_NAME_LIST: Handler =
        handler!("GetUserNameList", handlers::get_user_name_list);
    static GET_FILE_NAME_LIST: Handler =
        handler!("GetFileNameList", handlers::get_file_name_list);
    static DOWNLOAD_FILE: Handler = handler!(
        "DownloadFile",
        Some(perm::DOWNLOAD_FILE),
        "You are not allowed to download files.",
        REQ_FILE_NAME,
        handlers::download_file
    );
    static UPLOAD_FILE: Handler = handler!(
        "UploadFile",
        Some(perm::UPLOAD_FILE),
        "You are not allowed to upload files.",
        REQ_FILE_NAME,
        handlers::upload_file
    );
    static DELETE_FILE: Handler = handler!(
        "DeleteFile",
        Some(perm::DELETE_FILE),
        "You are not allowed to delete files.",
        REQ_FILE_NAME,
        handlers::delete_file
    );
    static NEW_FOLDER: Handler = handler!(
        "NewFolder",
        Some(perm::CREATE_FOLDER),
        "You are not allowed to create folders.",
        REQ_FILE_NAME,
        handlers::new_folder
    );
    static GET_FILE_INFO: Handler =
        handler!("GetFileInfo", None, "", REQ_FILE_NAME, handlers::get_file_info);
    static SET_FILE_INFO: Handler = handler!(
        "SetFileInfo",
        Some(perm::RENAME_FILE),
        "You are not allowed to rename files.",
        REQ_FILE_NAME,
        handlers::set_file_info
    );
    static MOVE_FILE: Handler = handler!(
        "MoveFile",
        Some(perm::MOVE_FILE),
        "You are not allowed to move files.",
        REQ_FILE_NAME,
        handlers::move_file
    );
    static MAKE_FILE_ALIAS: Handler = handler!(
        "MakeFileAlias",
        Some(perm::MAKE_ALIAS),
        "You are not allowed to make aliases.",
        &[
            RequiredField { id: field::FILE_NAME, min_len: 1 },
            RequiredField { id: field::FILE_PATH, min_len: 2 },
            RequiredField { id: field::FILE_NEW_PATH, min_len: 2 },
        ],
        handlers::make_file_alias
    );
    static DOWNLOAD_FOLDER: Handler = handler!(
        "DownloadFolder",
        Some(perm::DOWNLOAD_FILE),
        "You are not allowed to download folders.",
        REQ_FILE_NAME,
        handlers::download_folder
    );
    static UPLOAD_FOLDER: Handler = handler!(
        "UploadFolder",
        Some(perm::UPLOAD_FILE),
        "You are not allowed to upload folders.",
        REQ_FILE_NAME,
        handlers::upload_folder
    );
    static INVITE_NEW_CHAT: Handler = handler!(
        "InviteNewChat",
        Some(perm::OPEN_CHAT),
        "You are not allowed to request private chat.",
        REQ_USER_ID,
        handlers::invite_new_chat
    );
    static INVITE_TO_CHAT: Handler = handler!(
        "InviteToChat",
        Some(perm::OPEN_CHAT),
        "You are not allowed to request private chat.",
        &[
            RequiredField { id: field::USER_ID, min_len: 2 },
            RequiredField { id: field::CHAT_ID, min_len: 4 },
        ],
        handlers::invite_to_chat
    );
    static REJECT_CHAT_INVITE: Handler =
        handler!("RejectChatInvite", None, "", REQ_CHAT_ID, handlers::reject_chat_invite);
    static JOIN_CHAT: Handler = handler!("JoinChat", None, "", REQ_CHAT_ID, handlers::join_chat);
    static LEAVE_CHAT: Handler =
        handler!("LeaveChat", None, "", REQ_CHAT_ID, handlers::leave_chat);
    static SET_CHAT_SUBJECT: Handler = handler!(
        "SetChatSubject",
        None,
        "",
        &[
            RequiredField { id: field::CHAT_ID, min_len: 4 },
            RequiredField { id: field::CHAT_SUBJECT, min_len: 1 },
        ],
        handlers::set_chat_subject
    );
    static GET_CLIENT_INFO_TEXT: Handler = handler!(
        "GetClientInfoText",
        Some(perm::GET_CLIENT_INFO),
        "You are not allowed to get client info.",
        REQ_USER_ID,
        handlers::get_client_info_text
    );
    static SET_CLIENT_USER_INFO: Handler = handler!(
        "SetClientUserInfo",
        None,
        "",
        &[RequiredField { id: field::USER_NAME, min_len: 1 }],
        handlers::set_client_user_info
    );
    static LIST_USERS: Handler = handler!(
        "ListUsers",
        Some(perm::OPEN_USER),
        "You are not allowed to view accounts.",
        &[],
        handlers::list_users
    );
    static UPDATE_USER: Handler =
        handler!("UpdateUser", None, "", REQ_DATA, handlers::update_user);
    static NEW_USER: Handler = handler!(
        "NewUser",
        Some(perm::CREATE_USER),
        "You are not allowed to create new accounts.",
        &[],
        handlers::new_user
    );
    static DELETE_USER: Handler = handler!(
        "DeleteUser",
        Some(perm::DELETE_USER),
        "You are not allowed to delete accounts.",
        REQ_USER_LOGIN,
        handlers::delete_user
    );
    static GET_USER: Handler = handler!(
        "GetUser",
        Some(perm::OPEN_USER),
        "You are not allowed to view accounts.",
        REQ_USER_LOGIN,
        handlers::get_user
    );
    static SET_USER: Handler = handler!(
        "SetUser",
        Some(perm::MODIFY_USER),
        "You are not allowed to modify accounts.",
        REQ_USER_LOGIN,
        handlers::set_user
    );
    static GET_NEWS_CAT_NAME_LIST: Handler = handler!(
        "GetNewsCatNameList",
        Some(perm::NEWS_READ_ART),
        "You are not allowed to read news.",
        &[],
        handlers::get_news_cat_name_list
    );
    static GET_NEWS_ART_NAME_LIST: Handler = handler!(
        "GetNewsArtNameList",
        Some(perm::NEWS_READ_ART),
        "You are not allowed to read news.",
        &[],
        handlers::get_news_art_name_list
    );
    static GET_NEWS_ART_DATA: Handler = handler!(
        "GetNewsArtData",
        Some(perm::NEWS_READ_ART),
        "You are not allowed to read news.",
        &[RequiredField { id: field::NEWS_ART_ID, min_len: 1 }],
        handlers::get_news_art_data
    );
    static POST_NEWS_ART: Handler = handler!(
        "PostNewsArt",
        Some(perm::NEWS_POST_ART),
        "You are not allowed to post news articles.",
        &[
            RequiredField { id: field::NEWS_ART_TITLE, min_len: 1 },
            RequiredField { id: field::NEWS_ART_DATA, min_len: 1 },
        ],
        handlers::post_news_art
    );
    static DEL_NEWS_ART: Handler = handler!(
        "DelNewsArt",
        Some(perm::NEWS_DELETE_ART),
        "You are not allowed to delete news articles.",
        &[RequiredField { id: field::NEWS_ART_ID, min_len: 1 }],
        handlers::del_news_art
    );
    static NEW_NEWS_CATEGORY: Handler = handler!(
        "NewNewsCategory",
        Some(perm::NEWS_CREATE_CAT),
        "You are not allowed to create news categories.",
        &[RequiredField { id: field::NEWS_CAT_NAME, min_len: 1 }],
        handlers::new_news_category
    );
    static NEW_NEWS_FOLDER: Handler = handler!(
        "NewNewsFolder",
        Some(perm::NEWS_CREATE_FLDR),
        "You are not allowed to create news bundles.",
        REQ_FILE_NAME,
        handlers::new_news_folder
    );
    static DEL_NEWS_ITEM: Handler =
        handler!("DelNewsItem", None, "", &[], handlers::del_news_item);
    static KEEP_ALIVE: Handler = handler!("KeepAlive", handlers::keep_alive);

    match ty {
        tran::GET_MSGS => Some(&GET_MSGS),
        tran::POST_NEWS => Some(&POST_NEWS),
        tran::CHAT_SEND => Some(&CHAT_SEND),
        tran::SEND_INSTANT_MSG => Some(&SEND_INSTANT_MSG),
        tran::DISCONNECT_USER => Some(&DISCONNECT_USER),
        tran::AGREED => Some(&AGREED),
        tran::GET_USER_NAME_LIST => Some(&GET_USER_NAME_LIST),
        tran::GET_FILE_NAME_LIST => Some(&GET_FILE_NAME_LIST),
        tran::DOWNLOAD_FILE => Some(&DOWNLOAD_FILE),
        tran::UPLOAD_FILE => Some(&UPLOAD_FILE),
        tran::DELETE_FILE => Some(&DELETE_FILE),
        tran::NEW_FOLDER => Some(&NEW_FOLDER),
        tran::GET_FILE_INFO => Some(&GET_FILE_INFO),
        tran::SET_FILE_INFO => Some(&SET_FILE_INFO),
        tran::MOVE_FILE => Some(&MOVE_FILE),
        tran::MAKE_FILE_ALIAS => Some(&MAKE_FILE_ALIAS),
        tran::DOWNLOAD_FOLDER => Some(&DOWNLOAD_FOLDER),
        tran::UPLOAD_FOLDER => Some(&UPLOAD_FOLDER),
        tran::INVITE_NEW_CHAT => Some(&INVITE_NEW_CHAT),
        tran::INVITE_TO_CHAT => Some(&INVITE_TO_CHAT),
        tran::REJECT_CHAT_INVITE => Some(&REJECT_CHAT_INVITE),
        tran::JOIN_CHAT => Some(&JOIN_CHAT),
        tran::LEAVE_CHAT => Some(&LEAVE_CHAT),
        tran::SET_CHAT_SUBJECT => Some(&SET_CHAT_SUBJECT),
        tran::GET_CLIENT_INFO_TEXT => Some(&GET_CLIENT_INFO_TEXT),
        tran::SET_CLIENT_USER_INFO => Some(&SET_CLIENT_USER_INFO),
        tran::LIST_USERS => Some(&LIST_USERS),
        tran::UPDATE_USER => Some(&UPDATE_USER),
        tran::NEW_USER => Some(&NEW_USER),
        tran::DELETE_USER => Some(&DELETE_USER),
        tran::GET_USER => Some(&GET_USER),
        tran::SET_USER => Some(&SET_USER),
        tran::GET_NEWS_CAT_NAME_LIST => Some(&GET_NEWS_CAT_NAME_LIST),
        tran::GET_NEWS_ART_NAME_LIST => Some(&GET_NEWS_ART_NAME_LIST),
        tran::GET_NEWS_ART_DATA => Some(&GET_NEWS_ART_DATA),
        tran::POST_NEWS_ART => Some(&POST_NEWS_ART),
        tran::DEL_NEWS_ART => Some(&DEL_NEWS_ART),
        tran::NEW_NEWS_CATEGORY => Some(&NEW_NEWS_CATEGORY),
        tran::NEW_NEWS_FOLDER => Some(&NEW_NEWS_FOLDER),
        tran::DEL_NEWS_ITEM => Some(&DEL_NEWS_ITEM),
        tran::KEEP_ALIVE => Some(&KEEP_ALIVE),
        _ => None,
    }
}

/// Validate and run one inbound transaction.
pub fn dispatch(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let Some(handler) = handler_for(t.ty) else {
        warn!(session_id, ty = t.ty, "unimplemented transaction type received");
        return Ok(Vec::new());
    };

    for required in handler.required {
        match t.field(required.id) {
            None => {
                warn!(
                    session_id,
                    handler = handler.name,
                    field_id = required.id,
                    "missing required field"
                );
                return Ok(Vec::new());
            }
            Some(f) if f.data.len() < required.min_len => {
                warn!(
                    session_id,
                    handler = handler.name,
                    field_id = required.id,
                    "required field below minimum length"
                );
                return Ok(Vec::new());
            }
            Some(_) => {}
        }
    }

    if let Some(bit) = handler.access {
        let allowed = state
            .session(session_id)
            .map(|s| s.account.access.has(bit))
            .unwrap_or(false);
        if !allowed {
            return Ok(vec![err_reply(session_id, t, handler.denied)]);
        }
    }

    debug!(session_id, handler = handler.name, "received transaction");
    (handler.func)(state, session_id, t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessBitmap;
    use crate::account::Account;
    use crate::protocol::Field;
    use crate::rng::SeqIds;
    use crate::server::{ClientSession, Config};

    fn state_with_session(access: AccessBitmap) -> ServerState {
        let mut state = ServerState::new(Config::default());
        state.ids = Box::new(SeqIds::reference());
        let account = Account {
            login: "guest".into(),
            name: "Guest".into(),
            password: String::new(),
            access,
        };
        let mut session = ClientSession::new(1, "127.0.0.1:0".into(), account);
        session.agreed = true;
        state.clients.insert(1, session);
        state
    }

    #[test]
    fn test_unknown_type_is_dropped() {
        let mut state = state_with_session(AccessBitmap::all());
        let t = Transaction::request(9999, 1, vec![]);
        let out = dispatch(&mut state, 1, &t).expect("dispatch");
        assert!(out.is_empty());
    }

    #[test]
    fn test_missing_required_field_is_dropped_silently() {
        let mut state = state_with_session(AccessBitmap::all());
        // ChatSend without its DATA field: no reply at all.
        let t = Transaction::request(tran::CHAT_SEND, 1, vec![]);
        let out = dispatch(&mut state, 1, &t).expect("dispatch");
        assert!(out.is_empty());
    }

    #[test]
    fn test_short_required_field_is_dropped_silently() {
        let mut state = state_with_session(AccessBitmap::all());
        let t = Transaction::request(
            tran::SEND_INSTANT_MSG,
            1,
            vec![
                Field::new(field::DATA, b"hai".to_vec()),
                Field::new(field::USER_ID, vec![0x02]), // one byte, needs two
            ],
        );
        let out = dispatch(&mut state, 1, &t).expect("dispatch");
        assert!(out.is_empty());
    }

    #[test]
    fn test_access_gate_denies_with_handler_text() {
        let mut state = state_with_session(AccessBitmap::none());
        let t = Transaction::request(
            tran::CHAT_SEND,
            7,
            vec![Field::new(field::DATA, b"hai".to_vec())],
        );
        let out = dispatch(&mut state, 1, &t).expect("dispatch");
        assert_eq!(out.len(), 1);
        let reply = &out[0];
        assert!(reply.is_reply);
        assert_eq!(reply.ty, 0);
        assert_eq!(reply.id, 7);
        assert_eq!(reply.error_code, 1);
        assert_eq!(
            reply.field_data(field::ERROR),
            Some(&b"You are not allowed to participate in chat."[..])
        );
    }

    #[test]
    fn test_access_gate_admits_when_bit_set() {
        let mut state =
            state_with_session(AccessBitmap::with_bits(&[crate::access::perm::NEWS_READ_ART]));
        state.flat_news = b"TEST".to_vec();
        let t = Transaction::request(tran::GET_MSGS, 1, vec![]);
        let out = dispatch(&mut state, 1, &t).expect("dispatch");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].field_data(field::DATA), Some(&b"TEST"[..]));
    }
}
