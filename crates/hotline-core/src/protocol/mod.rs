//! Wire protocol for Hotline.
//!
//! A big-endian binary protocol carried over plain TCP. The atomic unit
//! is the transaction: a 20-byte header followed by a counted list of
//! tagged, length-prefixed fields.
//!
//! ```text
//! ┌───────┬─────────┬──────┬──────┬───────────┬───────────┬──────────┐
//! │ flags │ isReply │ type │  id  │ errorCode │ totalSize │ dataSize │
//! │  (1)  │   (1)   │ (2)  │ (4)  │    (4)    │    (4)    │   (4)    │
//! ├───────┴─────────┴──────┴──────┴───────────┴───────────┴──────────┤
//! │ fieldCount (2) │ field: id (2) + size (2) + data (size) │ ...    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Login and password fields travel bitwise-complemented (obfuscation,
//! not security). Error replies carry type 0 and error code 1 with a
//! single human-readable `field::ERROR`.

mod transaction;

pub use transaction::{
    decode_field_list, encode_field_list, negate, Field, Transaction, TransactionReader,
    HEADER_SIZE,
};

/// Magic opening every handshake in both directions.
pub const HANDSHAKE_MAGIC: &[u8; 4] = b"TRTP";

/// Sub-protocol tag the client presents on the main port.
pub const SUB_PROTOCOL_MAIN: &[u8; 4] = b"HOTL";

/// Sub-protocol tag opening a file-transfer connection.
pub const SUB_PROTOCOL_TRANSFER: &[u8; 4] = b"HTXF";

/// The 12 bytes a client sends to open the main connection:
/// magic, sub-protocol, version 1, sub-version 2.
pub const CLIENT_HANDSHAKE: [u8; 12] = [
    0x54, 0x52, 0x54, 0x50, // TRTP
    0x48, 0x4f, 0x54, 0x4c, // HOTL
    0x00, 0x01, // version
    0x00, 0x02, // sub-version
];

/// The 8 bytes a server answers with on success: magic + error code 0.
pub const SERVER_HANDSHAKE: [u8; 8] = [0x54, 0x52, 0x54, 0x50, 0x00, 0x00, 0x00, 0x00];

/// Transaction type codes.
pub mod tran {
    /// Error reply pseudo-type; never sent as a request.
    pub const ERROR: u16 = 0;
    pub const GET_MSGS: u16 = 101;
    pub const NEW_MSG: u16 = 102;
    pub const POST_NEWS: u16 = 103;
    pub const SERVER_MSG: u16 = 104;
    pub const CHAT_SEND: u16 = 105;
    pub const CHAT_MSG: u16 = 106;
    pub const LOGIN: u16 = 107;
    pub const SEND_INSTANT_MSG: u16 = 108;
    pub const SHOW_AGREEMENT: u16 = 109;
    pub const DISCONNECT_USER: u16 = 110;
    pub const INVITE_NEW_CHAT: u16 = 112;
    pub const INVITE_TO_CHAT: u16 = 113;
    pub const REJECT_CHAT_INVITE: u16 = 114;
    pub const JOIN_CHAT: u16 = 115;
    pub const LEAVE_CHAT: u16 = 116;
    pub const NOTIFY_CHAT_CHANGE_USER: u16 = 117;
    pub const NOTIFY_CHAT_DELETE_USER: u16 = 118;
    pub const NOTIFY_CHAT_SUBJECT: u16 = 119;
    pub const SET_CHAT_SUBJECT: u16 = 120;
    pub const AGREED: u16 = 121;
    pub const GET_FILE_NAME_LIST: u16 = 200;
    pub const DOWNLOAD_FILE: u16 = 202;
    pub const UPLOAD_FILE: u16 = 203;
    pub const DELETE_FILE: u16 = 204;
    pub const NEW_FOLDER: u16 = 205;
    pub const GET_FILE_INFO: u16 = 206;
    pub const SET_FILE_INFO: u16 = 207;
    pub const MOVE_FILE: u16 = 208;
    pub const MAKE_FILE_ALIAS: u16 = 209;
    pub const DOWNLOAD_FOLDER: u16 = 210;
    pub const UPLOAD_FOLDER: u16 = 213;
    pub const GET_USER_NAME_LIST: u16 = 300;
    pub const NOTIFY_CHANGE_USER: u16 = 301;
    pub const NOTIFY_DELETE_USER: u16 = 302;
    pub const GET_CLIENT_INFO_TEXT: u16 = 303;
    pub const SET_CLIENT_USER_INFO: u16 = 304;
    pub const DEL_NEWS_ART: u16 = 326;
    pub const LIST_USERS: u16 = 348;
    pub const UPDATE_USER: u16 = 349;
    pub const NEW_USER: u16 = 350;
    pub const DELETE_USER: u16 = 351;
    pub const GET_USER: u16 = 352;
    pub const SET_USER: u16 = 353;
    pub const USER_ACCESS: u16 = 354;
    pub const GET_NEWS_CAT_NAME_LIST: u16 = 370;
    pub const GET_NEWS_ART_NAME_LIST: u16 = 371;
    pub const DEL_NEWS_ITEM: u16 = 380;
    pub const NEW_NEWS_FOLDER: u16 = 381;
    pub const NEW_NEWS_CATEGORY: u16 = 382;
    pub const GET_NEWS_ART_DATA: u16 = 400;
    pub const POST_NEWS_ART: u16 = 410;
    pub const KEEP_ALIVE: u16 = 500;
}

/// Field ID registry.
pub mod field {
    pub const ERROR: u16 = 100;
    pub const DATA: u16 = 101;
    pub const USER_NAME: u16 = 102;
    pub const USER_ID: u16 = 103;
    pub const USER_ICON_ID: u16 = 104;
    pub const USER_LOGIN: u16 = 105;
    pub const USER_PASSWORD: u16 = 106;
    pub const TRANSFER_SIZE: u16 = 108;
    pub const CHAT_OPTIONS: u16 = 109;
    pub const USER_ACCESS: u16 = 110;
    pub const USER_FLAGS: u16 = 112;
    pub const OPTIONS: u16 = 113;
    pub const CHAT_ID: u16 = 114;
    pub const CHAT_SUBJECT: u16 = 115;
    pub const WAITING_COUNT: u16 = 116;
    pub const VERSION: u16 = 160;
    pub const BANNER_ID: u16 = 161;
    pub const SERVER_NAME: u16 = 162;
    pub const FILE_NAME_WITH_INFO: u16 = 200;
    pub const FILE_NAME: u16 = 201;
    pub const FILE_PATH: u16 = 202;
    pub const FILE_RESUME_DATA: u16 = 203;
    pub const REF_NUM: u16 = 204;
    pub const FILE_TYPE_STRING: u16 = 205;
    pub const FILE_CREATOR_STRING: u16 = 206;
    pub const FILE_SIZE: u16 = 207;
    pub const FILE_TYPE: u16 = 208;
    pub const FILE_CREATE_DATE: u16 = 209;
    pub const FILE_MODIFY_DATE: u16 = 210;
    pub const FILE_NEW_PATH: u16 = 211;
    pub const FILE_COMMENT: u16 = 212;
    pub const FILE_NEW_NAME: u16 = 214;
    pub const AUTOMATIC_RESPONSE: u16 = 215;
    pub const FOLDER_ITEM_COUNT: u16 = 220;
    pub const USERNAME_WITH_INFO: u16 = 300;
    pub const NEWS_ART_LIST_DATA: u16 = 321;
    pub const NEWS_CAT_NAME: u16 = 322;
    pub const NEWS_CAT_LIST_DATA: u16 = 323;
    pub const NEWS_PATH: u16 = 325;
    pub const NEWS_ART_ID: u16 = 326;
    pub const NEWS_ART_DATA_FLAV: u16 = 327;
    pub const NEWS_ART_TITLE: u16 = 328;
    pub const NEWS_ART_POSTER: u16 = 329;
    pub const NEWS_ART_DATE: u16 = 330;
    pub const NEWS_ART_PREV_ART: u16 = 331;
    pub const NEWS_ART_NEXT_ART: u16 = 332;
    pub const NEWS_ART_DATA: u16 = 333;
    pub const NEWS_ART_FLAGS: u16 = 334;
    pub const NEWS_ART_PARENT_ART: u16 = 335;
    pub const NEWS_ART_FIRST_CHILD_ART: u16 = 336;
}
