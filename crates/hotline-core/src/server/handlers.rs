//! One function per transaction type.
//!
//! Handlers run with the server mutex held. Each returns the outbound
//! transactions it produced: a success reply, an error reply, or a set
//! of notifications (possibly plus a reply). Business failures become
//! error replies; only malformed input propagates as `Err`, which
//! closes the offending session.

use super::state::{err_reply, reply, PrivateChat, ServerState};
use crate::access::perm;
use crate::account::{hash_password, Account};
use crate::error::Result;
use crate::files::{
    file_name_list, file_type_for, flattened_size, hotline_time, resolve_path, walk_tree,
    FilePath, FOLDER_TYPE_CODE, INCOMPLETE_SUFFIX,
};
use crate::news::{format_flat_post, prepend_flat_post, CategoryKind};
use crate::protocol::{decode_field_list, field, negate, tran, Field, Transaction};
use crate::transfer::TransferKind;
use crate::user::{flag, flag_set};
use chrono::{DateTime, Utc};
use std::path::Path;

// ---------------------------------------------------------------------------
// Chat

/// Render a normal chat line: CR, the name right-aligned to 14 columns,
/// a colon and two spaces, then the message.
fn chat_line(name: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut out = vec![0x0d];
    out.resize(1 + 14usize.saturating_sub(name.len()), b' ');
    out.extend_from_slice(name);
    out.extend_from_slice(b":  ");
    out.extend_from_slice(msg);
    out
}

/// Render an emote line: `CR*** <name> <action>`.
fn emote_line(name: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut out = b"\r*** ".to_vec();
    out.extend_from_slice(name);
    out.push(b' ');
    out.extend_from_slice(msg);
    out
}

pub(super) fn chat_send(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let name = state.require_session(session_id)?.user_name.clone();
    let msg = t.field_data(field::DATA).unwrap_or_default();
    let emote = t.field(field::CHAT_OPTIONS).map(|f| f.as_u16() == 1).unwrap_or(false);
    let line = if emote { emote_line(&name, msg) } else { chat_line(&name, msg) };

    if let Some(chat_field) = t.field(field::CHAT_ID) {
        let chat_id = chat_field.as_u32();
        let fields = vec![
            Field::from_u32(field::CHAT_ID, chat_id),
            Field::new(field::DATA, line),
        ];
        return Ok(state.clone_to_chat_members(chat_id, None, tran::CHAT_MSG, fields));
    }

    let recipients: Vec<u16> = state
        .sorted_client_ids()
        .into_iter()
        .filter(|cid| state.clients[cid].account.access.has(perm::READ_CHAT))
        .collect();
    Ok(state.fan_out(tran::CHAT_MSG, vec![Field::new(field::DATA, line)], &recipients))
}

pub(super) fn set_chat_subject(
    state: &mut ServerState,
    _session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let chat_id = t.field(field::CHAT_ID).map(|f| f.as_u32()).unwrap_or(0);
    let subject = t.field_data(field::CHAT_SUBJECT).unwrap_or_default().to_vec();
    let Some(chat) = state.private_chats.get_mut(&chat_id) else {
        return Ok(Vec::new());
    };
    chat.subject = String::from_utf8_lossy(&subject).into_owned();
    let members = state.chat_members_sorted(chat_id, None);
    let fields = vec![
        Field::from_u32(field::CHAT_ID, chat_id),
        Field::new(field::CHAT_SUBJECT, subject),
    ];
    Ok(state.fan_out(tran::NOTIFY_CHAT_SUBJECT, fields, &members))
}

pub(super) fn invite_new_chat(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let target_id = t.field(field::USER_ID).map(|f| f.as_u16()).unwrap_or(0);
    let me = state.require_session(session_id)?;
    let (my_name, my_icon, my_flags) = (me.user_name.clone(), me.icon, me.flags);

    let chat_id = state.next_tran_id();
    let mut chat = PrivateChat::default();
    chat.members.insert(session_id);
    state.private_chats.insert(chat_id, chat);

    let mut out = invite_user(state, session_id, target_id, chat_id, &my_name);
    out.push(reply(
        session_id,
        t,
        vec![
            Field::from_u32(field::CHAT_ID, chat_id),
            Field::new(field::USER_NAME, my_name),
            Field::from_u16(field::USER_ID, session_id),
            Field::from_u16(field::USER_ICON_ID, my_icon),
            Field::from_u16(field::USER_FLAGS, my_flags),
        ],
    ));
    Ok(out)
}

pub(super) fn invite_to_chat(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let target_id = t.field(field::USER_ID).map(|f| f.as_u16()).unwrap_or(0);
    let chat_id = t.field(field::CHAT_ID).map(|f| f.as_u32()).unwrap_or(0);
    let me = state.require_session(session_id)?;
    let (my_name, my_icon, my_flags) = (me.user_name.clone(), me.icon, me.flags);

    let mut out = invite_user(state, session_id, target_id, chat_id, &my_name);
    out.push(reply(
        session_id,
        t,
        vec![
            Field::from_u32(field::CHAT_ID, chat_id),
            Field::new(field::USER_NAME, my_name),
            Field::from_u16(field::USER_ID, session_id),
            Field::from_u16(field::USER_ICON_ID, my_icon),
            Field::from_u16(field::USER_FLAGS, my_flags),
        ],
    ));
    Ok(out)
}

/// Deliver a chat invitation, honoring the target's refuse-chat flag.
fn invite_user(
    state: &mut ServerState,
    session_id: u16,
    target_id: u16,
    chat_id: u32,
    inviter_name: &[u8],
) -> Vec<Transaction> {
    let Some(target) = state.session(target_id) else {
        return Vec::new();
    };
    if flag_set(target.flags, flag::REFUSE_CHAT) {
        let mut msg = target.user_name.clone();
        msg.extend_from_slice(b" does not accept private chats.");
        let target_name = target.user_name.clone();
        let id = state.next_tran_id();
        return vec![Transaction::request(
            tran::SERVER_MSG,
            id,
            vec![
                Field::new(field::DATA, msg),
                Field::new(field::USER_NAME, target_name),
                Field::from_u16(field::USER_ID, target_id),
                Field::from_u16(field::OPTIONS, 2),
            ],
        )
        .to_client(session_id)];
    }
    let id = state.next_tran_id();
    vec![Transaction::request(
        tran::INVITE_TO_CHAT,
        id,
        vec![
            Field::from_u32(field::CHAT_ID, chat_id),
            Field::new(field::USER_NAME, inviter_name.to_vec()),
            Field::from_u16(field::USER_ID, session_id),
        ],
    )
    .to_client(target_id)]
}

pub(super) fn reject_chat_invite(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let chat_id = t.field(field::CHAT_ID).map(|f| f.as_u32()).unwrap_or(0);
    let name = state.require_session(session_id)?.user_name.clone();
    let members = state.chat_members_sorted(chat_id, Some(session_id));
    let mut msg = name;
    msg.extend_from_slice(b" declined invitation to chat");
    Ok(state.fan_out(tran::CHAT_MSG, vec![
        Field::from_u32(field::CHAT_ID, chat_id),
        Field::new(field::DATA, msg),
    ], &members))
}

pub(super) fn join_chat(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let chat_id = t.field(field::CHAT_ID).map(|f| f.as_u32()).unwrap_or(0);
    let joiner = state.require_session(session_id)?.user();
    let Some(chat) = state.private_chats.get_mut(&chat_id) else {
        return Ok(vec![err_reply(session_id, t, "Invalid chat ID.")]);
    };
    chat.members.insert(session_id);
    let subject = chat.subject.clone();

    let others = state.chat_members_sorted(chat_id, Some(session_id));
    let notify_fields = vec![
        Field::from_u32(field::CHAT_ID, chat_id),
        Field::from_u16(field::USER_ID, joiner.id),
        Field::from_u16(field::USER_ICON_ID, joiner.icon),
        Field::from_u16(field::USER_FLAGS, joiner.flags),
        Field::new(field::USER_NAME, joiner.name.clone()),
    ];
    let mut out = state.fan_out(tran::NOTIFY_CHAT_CHANGE_USER, notify_fields, &others);

    let mut reply_fields = vec![Field::new(field::CHAT_SUBJECT, subject.into_bytes())];
    for member in state.chat_members_sorted(chat_id, None) {
        if let Some(session) = state.session(member) {
            reply_fields
                .push(Field::new(field::USERNAME_WITH_INFO, session.user().to_bytes()));
        }
    }
    out.push(reply(session_id, t, reply_fields));
    Ok(out)
}

pub(super) fn leave_chat(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let chat_id = t.field(field::CHAT_ID).map(|f| f.as_u32()).unwrap_or(0);
    let Some(chat) = state.private_chats.get_mut(&chat_id) else {
        return Ok(Vec::new());
    };
    chat.members.remove(&session_id);
    if chat.members.is_empty() {
        state.private_chats.remove(&chat_id);
        return Ok(Vec::new());
    }
    let members = state.chat_members_sorted(chat_id, None);
    Ok(state.fan_out(
        tran::NOTIFY_CHAT_DELETE_USER,
        vec![
            Field::from_u32(field::CHAT_ID, chat_id),
            Field::from_u16(field::USER_ID, session_id),
        ],
        &members,
    ))
}

// ---------------------------------------------------------------------------
// Messaging

pub(super) fn send_instant_msg(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let target_id = t.field(field::USER_ID).map(|f| f.as_u16()).unwrap_or(0);
    let msg = t.field_data(field::DATA).unwrap_or_default().to_vec();
    let sender_name = state.require_session(session_id)?.user_name.clone();

    let Some(target) = state.session(target_id) else {
        return Ok(vec![err_reply(session_id, t, "User not found.")]);
    };
    let target_name = target.user_name.clone();
    let auto_reply = target.auto_reply.clone();
    let refuses = flag_set(target.flags, flag::REFUSE_PM);

    let mut out = Vec::new();
    if refuses {
        let mut text = target_name.clone();
        text.extend_from_slice(b" does not accept private messages.");
        let id = state.next_tran_id();
        out.push(
            Transaction::request(
                tran::SERVER_MSG,
                id,
                vec![
                    Field::new(field::DATA, text),
                    Field::new(field::USER_NAME, target_name),
                    Field::from_u16(field::USER_ID, target_id),
                    Field::from_u16(field::OPTIONS, 2),
                ],
            )
            .to_client(session_id),
        );
    } else {
        let id = state.next_tran_id();
        out.push(
            Transaction::request(
                tran::SERVER_MSG,
                id,
                vec![
                    Field::new(field::DATA, msg),
                    Field::new(field::USER_NAME, sender_name),
                    Field::from_u16(field::USER_ID, session_id),
                    Field::from_u16(field::OPTIONS, 1),
                ],
            )
            .to_client(target_id),
        );
        if !auto_reply.is_empty() {
            let id = state.next_tran_id();
            out.push(
                Transaction::request(
                    tran::SERVER_MSG,
                    id,
                    vec![
                        Field::new(field::DATA, auto_reply),
                        Field::new(field::USER_NAME, target_name),
                        Field::from_u16(field::USER_ID, target_id),
                        Field::from_u16(field::OPTIONS, 1),
                    ],
                )
                .to_client(session_id),
            );
        }
    }
    out.push(reply(session_id, t, vec![]));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Users online

pub(super) fn get_user_name_list(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let fields: Vec<Field> = state
        .sorted_client_ids()
        .into_iter()
        .filter(|cid| state.clients[cid].agreed)
        .map(|cid| {
            Field::new(field::USERNAME_WITH_INFO, state.clients[&cid].user().to_bytes())
        })
        .collect();
    Ok(vec![reply(session_id, t, fields)])
}

pub(super) fn agreed(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let access = {
        let session = match state.session_mut(session_id) {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        if let Some(name) = t.field_data(field::USER_NAME) {
            session.user_name = name.to_vec();
        }
        if let Some(icon) = t.field(field::USER_ICON_ID) {
            session.icon = icon.as_u16();
        }
        if let Some(flags) = t.field(field::USER_FLAGS) {
            session.flags = flags.as_u16();
        }
        if let Some(auto) = t.field_data(field::AUTOMATIC_RESPONSE) {
            session.auto_reply = auto.to_vec();
        }
        session.agreed = true;
        session.account.access
    };

    let mut out = vec![reply(session_id, t, vec![])];
    let id = state.next_tran_id();
    out.push(
        Transaction::request(
            tran::USER_ACCESS,
            id,
            vec![Field::new(field::USER_ACCESS, access.as_bytes().to_vec())],
        )
        .to_client(session_id),
    );
    out.extend(super::change_user_notification(state, session_id));
    Ok(out)
}

pub(super) fn set_client_user_info(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    {
        let session = match state.session_mut(session_id) {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        if let Some(name) = t.field_data(field::USER_NAME) {
            session.user_name = name.to_vec();
        }
        if let Some(icon) = t.field(field::USER_ICON_ID) {
            session.icon = icon.as_u16();
        }
    }
    Ok(super::change_user_notification(state, session_id))
}

pub(super) fn get_client_info_text(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let target_id = t.field(field::USER_ID).map(|f| f.as_u16()).unwrap_or(0);
    let Some(target) = state.session(target_id) else {
        return Ok(vec![err_reply(session_id, t, "User not found.")]);
    };
    let text = format!(
        "Nickname:   {}\rName:       {}\rAccount:    {}\rAddress:    {}\r\r\
         -------- File Downloads ---------\r\rNone.\r\r\
         ------- Folder Downloads --------\r\rNone.\r\r\
         --------- File Uploads ----------\r\rNone.\r\r\
         -------- Folder Uploads ---------\r\rNone.\r\r\
         ------- Waiting Downloads -------\r\rNone.\r",
        String::from_utf8_lossy(&target.user_name),
        target.account.name,
        target.account.login,
        target.remote_addr,
    );
    let name = target.user_name.clone();
    Ok(vec![reply(
        session_id,
        t,
        vec![
            Field::new(field::DATA, text.into_bytes()),
            Field::new(field::USER_NAME, name),
        ],
    )])
}

pub(super) fn disconnect_user(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let target_id = t.field(field::USER_ID).map(|f| f.as_u16()).unwrap_or(0);
    let Some(target) = state.session(target_id) else {
        return Ok(vec![err_reply(session_id, t, "User not found.")]);
    };
    if target.account.access.has(perm::CANNOT_BE_DISCON) {
        let msg = format!("{} is not allowed to be disconnected.", target.account.login);
        return Ok(vec![err_reply(session_id, t, &msg)]);
    }
    state.pending_disconnects.push(target_id);
    Ok(vec![reply(session_id, t, vec![])])
}

pub(super) fn keep_alive(
    _state: &mut ServerState,
    _session_id: u16,
    _t: &Transaction,
) -> Result<Vec<Transaction>> {
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// Files

pub(super) fn get_file_name_list(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), None)?;
    let fields = file_name_list(state.fs.as_ref(), &path)?;
    Ok(vec![reply(session_id, t, fields)])
}

pub(super) fn new_folder(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    if state.fs.stat(&path).is_ok() {
        return Ok(vec![err_reply(session_id, t, "Error creating folder.")]);
    }
    match state.fs.mkdir(&path) {
        Ok(()) => Ok(vec![reply(session_id, t, vec![])]),
        Err(_) => Ok(vec![err_reply(session_id, t, "Error creating folder.")]),
    }
}

pub(super) fn get_file_info(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    let Ok(info) = state.fs.stat(&path) else {
        return Ok(vec![err_reply(session_id, t, "File not found.")]);
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (type_string, creator, type_code, size) = if info.is_dir {
        let count = state.fs.read_dir(&path).map(|v| v.len() as u32).unwrap_or(0);
        ("Folder".to_string(), *b"n/a ", *FOLDER_TYPE_CODE, count)
    } else {
        let ft = file_type_for(&file_name);
        (ft.label.to_string(), *ft.creator_code, *ft.type_code, info.len as u32)
    };
    let created = info.created.map(DateTime::<Utc>::from).unwrap_or_else(Utc::now);
    let modified = info.modified.map(DateTime::<Utc>::from).unwrap_or_else(Utc::now);

    Ok(vec![reply(
        session_id,
        t,
        vec![
            Field::new(field::FILE_NAME, file_name.replace(INCOMPLETE_SUFFIX, "").into_bytes()),
            Field::new(field::FILE_TYPE_STRING, type_string.into_bytes()),
            Field::new(field::FILE_CREATOR_STRING, creator.to_vec()),
            Field::new(field::FILE_COMMENT, Vec::new()),
            Field::new(field::FILE_TYPE, type_code.to_vec()),
            Field::new(field::FILE_CREATE_DATE, hotline_time(created).to_vec()),
            Field::new(field::FILE_MODIFY_DATE, hotline_time(modified).to_vec()),
            Field::from_u32(field::FILE_SIZE, size),
        ],
    )])
}

pub(super) fn set_file_info(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    if let Some(new_name) = t.field_data(field::FILE_NEW_NAME) {
        let dest = resolve_path(
            &root,
            t.field_data(field::FILE_PATH),
            Some(new_name),
        )?;
        if state.fs.rename(&path, &dest).is_err() {
            return Ok(vec![err_reply(session_id, t, "Error renaming file.")]);
        }
    }
    Ok(vec![reply(session_id, t, vec![])])
}

pub(super) fn delete_file(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    if state.fs.stat(&path).is_err() {
        return Ok(vec![err_reply(session_id, t, "File not found.")]);
    }
    match state.fs.remove_all(&path) {
        Ok(()) => Ok(vec![reply(session_id, t, vec![])]),
        Err(_) => Ok(vec![err_reply(session_id, t, "Error deleting file.")]),
    }
}

pub(super) fn move_file(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let src = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    let dst =
        resolve_path(&root, t.field_data(field::FILE_NEW_PATH), t.field_data(field::FILE_NAME))?;
    match state.fs.rename(&src, &dst) {
        Ok(()) => Ok(vec![reply(session_id, t, vec![])]),
        Err(_) => Ok(vec![err_reply(session_id, t, "Error moving file.")]),
    }
}

pub(super) fn make_file_alias(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let src = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    let dst =
        resolve_path(&root, t.field_data(field::FILE_NEW_PATH), t.field_data(field::FILE_NAME))?;
    match state.fs.symlink(&src, &dst) {
        Ok(()) => Ok(vec![reply(session_id, t, vec![])]),
        Err(_) => Ok(vec![err_reply(session_id, t, "Error creating alias")]),
    }
}

/// Uploads without the upload-anywhere bit must land in a drop folder.
/// Only directory components count, not the file name itself.
fn in_upload_folder(root: &Path, path: &Path) -> bool {
    path.parent()
        .and_then(|parent| parent.strip_prefix(root).ok())
        .map(|rel| {
            rel.components().any(|c| {
                let name = c.as_os_str().to_string_lossy();
                name.contains("Uploads") || name.contains("Drop Box")
            })
        })
        .unwrap_or(false)
}

pub(super) fn upload_file(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;

    let can_upload_anywhere =
        state.require_session(session_id)?.account.access.has(perm::UPLOAD_ANYWHERE);
    if !can_upload_anywhere && !in_upload_folder(&root, &path) {
        return Ok(vec![err_reply(
            session_id,
            t,
            "You are not allowed to upload files to this folder.",
        )]);
    }
    if state.fs.stat(&path).is_ok() {
        return Ok(vec![err_reply(
            session_id,
            t,
            "Cannot accept upload because there is already a file with that name.",
        )]);
    }

    // A leftover partial upload lets the client resume mid-file.
    let incomplete = incomplete_path(&path);
    let offset = state.fs.stat(&incomplete).map(|i| i.len).unwrap_or(0);

    let refnum = match state.register_transfer(
        session_id,
        TransferKind::FileUpload,
        path,
        0,
        offset,
        Vec::new(),
    ) {
        Ok(refnum) => refnum,
        Err(_) => return Ok(vec![err_reply(session_id, t, "Too many active file transfers.")]),
    };

    let mut fields = vec![Field::from_u32(field::REF_NUM, refnum)];
    if offset > 0 {
        fields.push(Field::from_u32(field::FILE_RESUME_DATA, offset as u32));
    }
    Ok(vec![reply(session_id, t, fields)])
}

pub(super) fn download_file(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    let info = match state.fs.stat(&path) {
        Ok(info) if !info.is_dir => info,
        _ => return Ok(vec![err_reply(session_id, t, "File not found.")]),
    };
    let offset = t.field(field::FILE_RESUME_DATA).map(|f| f.as_u32() as u64).unwrap_or(0);
    let name_len = path.file_name().map(|n| n.to_string_lossy().len()).unwrap_or(0);
    let transfer_size = flattened_size(info.len.saturating_sub(offset), name_len, 0);

    let refnum = match state.register_transfer(
        session_id,
        TransferKind::FileDownload,
        path,
        info.len,
        offset,
        Vec::new(),
    ) {
        Ok(refnum) => refnum,
        Err(_) => return Ok(vec![err_reply(session_id, t, "Too many active file transfers.")]),
    };

    Ok(vec![reply(
        session_id,
        t,
        vec![
            Field::from_u32(field::REF_NUM, refnum),
            Field::from_u16(field::WAITING_COUNT, 0),
            Field::from_u32(field::TRANSFER_SIZE, transfer_size as u32),
            Field::from_u32(field::FILE_SIZE, info.len as u32),
        ],
    )])
}

pub(super) fn download_folder(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;
    match state.fs.stat(&path) {
        Ok(info) if info.is_dir => {}
        _ => return Ok(vec![err_reply(session_id, t, "Folder not found.")]),
    }

    let items = walk_tree(state.fs.as_ref(), &path)?;
    let item_count = items.len() as u16;
    let total_size: u64 = items
        .iter()
        .map(|(rel, info)| {
            if info.is_dir {
                12 + rel.to_string_lossy().len() as u64
            } else {
                12 + rel.to_string_lossy().len() as u64
                    + flattened_size(info.len, rel.to_string_lossy().len(), 0)
            }
        })
        .sum();
    let folder_items = items.into_iter().map(|(rel, _)| rel).collect();

    let refnum = match state.register_transfer(
        session_id,
        TransferKind::FolderDownload,
        path,
        total_size,
        0,
        folder_items,
    ) {
        Ok(refnum) => refnum,
        Err(_) => return Ok(vec![err_reply(session_id, t, "Too many active file transfers.")]),
    };

    Ok(vec![reply(
        session_id,
        t,
        vec![
            Field::from_u32(field::REF_NUM, refnum),
            Field::from_u16(field::FOLDER_ITEM_COUNT, item_count),
            Field::from_u32(field::TRANSFER_SIZE, total_size as u32),
            Field::from_u16(field::WAITING_COUNT, 0),
        ],
    )])
}

pub(super) fn upload_folder(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let root = state.config.file_root.clone();
    let path = resolve_path(&root, t.field_data(field::FILE_PATH), t.field_data(field::FILE_NAME))?;

    let can_upload_anywhere =
        state.require_session(session_id)?.account.access.has(perm::UPLOAD_ANYWHERE);
    if !can_upload_anywhere && !in_upload_folder(&root, &path) {
        return Ok(vec![err_reply(
            session_id,
            t,
            "You are not allowed to upload folders to this folder.",
        )]);
    }

    let refnum = match state.register_transfer(
        session_id,
        TransferKind::FolderUpload,
        path,
        0,
        0,
        Vec::new(),
    ) {
        Ok(refnum) => refnum,
        Err(_) => return Ok(vec![err_reply(session_id, t, "Too many active file transfers.")]),
    };
    Ok(vec![reply(session_id, t, vec![Field::from_u32(field::REF_NUM, refnum)])])
}

/// `<path>.incomplete` alongside the final name.
pub(crate) fn incomplete_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(INCOMPLETE_SUFFIX);
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Flat news

pub(super) fn get_msgs(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let board = state.flat_news.clone();
    Ok(vec![reply(session_id, t, vec![Field::new(field::DATA, board)])])
}

pub(super) fn post_news(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let name = state.require_session(session_id)?.user_name.clone();
    let body = t.field_data(field::DATA).unwrap_or_default();
    let post = format_flat_post(&name, Utc::now(), body);
    let limit = state.config.flat_news_limit;
    prepend_flat_post(&mut state.flat_news, &post, limit);
    state.persist_flat_news();

    let recipients: Vec<u16> = state
        .sorted_client_ids()
        .into_iter()
        .filter(|cid| state.clients[cid].agreed)
        .collect();
    let mut out =
        state.fan_out(tran::NEW_MSG, vec![Field::new(field::DATA, post)], &recipients);
    out.push(reply(session_id, t, vec![]));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Threaded news

/// Decode the news path field (same wire shape as a file path) into
/// container names.
fn news_path(t: &Transaction) -> Result<Vec<String>> {
    match t.field_data(field::NEWS_PATH) {
        Some(bytes) => {
            let fp = FilePath::from_bytes(bytes)?;
            Ok(fp
                .items
                .iter()
                .map(|item| String::from_utf8_lossy(item).into_owned())
                .collect())
        }
        None => Ok(Vec::new()),
    }
}

pub(super) fn get_news_cat_name_list(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let listing = match state.threaded_news.list(&path) {
        Ok(listing) => listing,
        Err(_) => return Ok(vec![err_reply(session_id, t, "News category not found.")]),
    };
    let fields = listing
        .into_iter()
        .map(|(name, kind, count)| {
            let mut data = Vec::with_capacity(5 + name.len());
            let kind_code: u16 = match kind {
                CategoryKind::Bundle => 2,
                CategoryKind::Category => 3,
            };
            data.extend_from_slice(&kind_code.to_be_bytes());
            data.extend_from_slice(&count.to_be_bytes());
            data.push(name.len() as u8);
            data.extend_from_slice(name.as_bytes());
            Field::new(field::NEWS_CAT_LIST_DATA, data)
        })
        .collect();
    Ok(vec![reply(session_id, t, fields)])
}

pub(super) fn new_news_category(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let name = String::from_utf8_lossy(t.field_data(field::NEWS_CAT_NAME).unwrap_or_default())
        .into_owned();
    match state.threaded_news.create(&path, &name, CategoryKind::Category) {
        Ok(()) => {
            state.persist_threaded_news();
            Ok(vec![reply(session_id, t, vec![])])
        }
        Err(_) => Ok(vec![err_reply(session_id, t, "Error creating news category.")]),
    }
}

pub(super) fn new_news_folder(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let name =
        String::from_utf8_lossy(t.field_data(field::FILE_NAME).unwrap_or_default()).into_owned();
    match state.threaded_news.create(&path, &name, CategoryKind::Bundle) {
        Ok(()) => {
            state.persist_threaded_news();
            Ok(vec![reply(session_id, t, vec![])])
        }
        Err(_) => Ok(vec![err_reply(session_id, t, "Error creating news bundle.")]),
    }
}

pub(super) fn del_news_item(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let kind = match state.threaded_news.node(&path) {
        Ok(node) => node.kind,
        Err(_) => return Ok(vec![err_reply(session_id, t, "News category not found.")]),
    };
    let (bit, denied) = match kind {
        CategoryKind::Bundle => {
            (perm::NEWS_DELETE_FLDR, "You are not allowed to delete news bundles.")
        }
        CategoryKind::Category => {
            (perm::NEWS_DELETE_CAT, "You are not allowed to delete news categories.")
        }
    };
    if !state.require_session(session_id)?.account.access.has(bit) {
        return Ok(vec![err_reply(session_id, t, denied)]);
    }
    match state.threaded_news.remove(&path) {
        Ok(_) => {
            state.persist_threaded_news();
            Ok(vec![reply(session_id, t, vec![])])
        }
        Err(_) => Ok(vec![err_reply(session_id, t, "News category not found.")]),
    }
}

pub(super) fn get_news_art_name_list(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let node = match state.threaded_news.node(&path) {
        Ok(node) => node,
        Err(_) => return Ok(vec![err_reply(session_id, t, "News category not found.")]),
    };
    let fields = node
        .articles
        .values()
        .map(|article| {
            let mut data = Vec::new();
            data.extend_from_slice(&article.id.to_be_bytes());
            data.extend_from_slice(&hotline_time(article.date));
            data.extend_from_slice(&article.parent_id.to_be_bytes());
            data.extend_from_slice(&[0; 4]); // flags
            data.push(article.title.len().min(255) as u8);
            data.extend_from_slice(&article.title.as_bytes()[..article.title.len().min(255)]);
            data.push(article.poster.len().min(255) as u8);
            data.extend_from_slice(&article.poster.as_bytes()[..article.poster.len().min(255)]);
            Field::new(field::NEWS_ART_LIST_DATA, data)
        })
        .collect();
    Ok(vec![reply(session_id, t, fields)])
}

pub(super) fn get_news_art_data(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let art_id = t.field(field::NEWS_ART_ID).map(|f| f.as_u32()).unwrap_or(0);
    let article = match state.threaded_news.node(&path) {
        Ok(node) => node.articles.get(&art_id).cloned(),
        Err(_) => None,
    };
    let Some(article) = article else {
        return Ok(vec![err_reply(session_id, t, "Article not found.")]);
    };
    let (prev, next, first_child) = state
        .threaded_news
        .neighbors(&path, art_id)
        .unwrap_or((0, 0, 0));

    Ok(vec![reply(
        session_id,
        t,
        vec![
            Field::new(field::NEWS_ART_TITLE, article.title.into_bytes()),
            Field::new(field::NEWS_ART_POSTER, article.poster.into_bytes()),
            Field::new(field::NEWS_ART_DATE, hotline_time(article.date).to_vec()),
            Field::from_u32(field::NEWS_ART_PREV_ART, prev),
            Field::from_u32(field::NEWS_ART_NEXT_ART, next),
            Field::from_u32(field::NEWS_ART_PARENT_ART, article.parent_id),
            Field::from_u32(field::NEWS_ART_FIRST_CHILD_ART, first_child),
            Field::new(field::NEWS_ART_DATA_FLAV, article.flavor.into_bytes()),
            Field::new(field::NEWS_ART_DATA, article.data.into_bytes()),
        ],
    )])
}

pub(super) fn post_news_art(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let title =
        String::from_utf8_lossy(t.field_data(field::NEWS_ART_TITLE).unwrap_or_default())
            .into_owned();
    let body = String::from_utf8_lossy(t.field_data(field::NEWS_ART_DATA).unwrap_or_default())
        .into_owned();
    let parent = t.field(field::NEWS_ART_ID).map(|f| f.as_u32()).unwrap_or(0);
    let poster = String::from_utf8_lossy(&state.require_session(session_id)?.user_name)
        .into_owned();

    match state.threaded_news.post_article(&path, parent, &title, &poster, Utc::now(), &body) {
        Ok(_) => {
            state.persist_threaded_news();
            Ok(vec![reply(session_id, t, vec![])])
        }
        Err(_) => Ok(vec![err_reply(session_id, t, "News category not found.")]),
    }
}

pub(super) fn del_news_art(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let path = news_path(t)?;
    let art_id = t.field(field::NEWS_ART_ID).map(|f| f.as_u32()).unwrap_or(0);
    match state.threaded_news.delete_article(&path, art_id) {
        Ok(()) => {
            state.persist_threaded_news();
            Ok(vec![reply(session_id, t, vec![])])
        }
        Err(_) => Ok(vec![err_reply(session_id, t, "Article not found.")]),
    }
}

// ---------------------------------------------------------------------------
// Account administration

pub(super) fn new_user(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let login =
        String::from_utf8_lossy(&negate(t.field_data(field::USER_LOGIN).unwrap_or_default()))
            .into_owned();
    if login.is_empty() {
        return Ok(vec![err_reply(session_id, t, "Cannot create account with empty login.")]);
    }
    if state.accounts.contains_key(&login) {
        let msg = format!(
            "Cannot create account {} because there is already an account with that login.",
            login
        );
        return Ok(vec![err_reply(session_id, t, &msg)]);
    }
    let account = account_from_fields(&login, t.fields.as_slice())?;
    state.upsert_account(account)?;
    Ok(vec![reply(session_id, t, vec![])])
}

/// Build an account from admin-supplied fields (password arrives
/// negated, access as 8 raw bytes).
fn account_from_fields(login: &str, fields: &[Field]) -> Result<Account> {
    let find = |id: u16| fields.iter().find(|f| f.id == id);
    let name = find(field::USER_NAME)
        .map(|f| String::from_utf8_lossy(&f.data).into_owned())
        .unwrap_or_else(|| login.to_string());
    let password = find(field::USER_PASSWORD)
        .map(|f| String::from_utf8_lossy(&negate(&f.data)).into_owned())
        .unwrap_or_default();
    let mut access = crate::access::AccessBitmap::none();
    if let Some(f) = find(field::USER_ACCESS) {
        if f.data.len() == 8 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&f.data);
            access = crate::access::AccessBitmap::from_bytes(bytes);
        }
    }
    Ok(Account { login: login.to_string(), name, password: hash_password(&password)?, access })
}

pub(super) fn delete_user(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let login =
        String::from_utf8_lossy(&negate(t.field_data(field::USER_LOGIN).unwrap_or_default()))
            .into_owned();
    match state.delete_account(&login) {
        Ok(()) => Ok(vec![reply(session_id, t, vec![])]),
        Err(_) => Ok(vec![err_reply(session_id, t, "Account does not exist.")]),
    }
}

pub(super) fn get_user(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let login = String::from_utf8_lossy(t.field_data(field::USER_LOGIN).unwrap_or_default())
        .into_owned();
    let Some(account) = state.accounts.get(&login) else {
        return Ok(vec![err_reply(session_id, t, "Account does not exist.")]);
    };
    Ok(vec![reply(
        session_id,
        t,
        vec![
            Field::new(field::USER_NAME, account.name.clone().into_bytes()),
            Field::new(field::USER_LOGIN, negate(account.login.as_bytes())),
            Field::new(field::USER_PASSWORD, account.password.clone().into_bytes()),
            Field::new(field::USER_ACCESS, account.access.as_bytes().to_vec()),
        ],
    )])
}

pub(super) fn set_user(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let login =
        String::from_utf8_lossy(&negate(t.field_data(field::USER_LOGIN).unwrap_or_default()))
            .into_owned();
    let Some(mut account) = state.accounts.get(&login).cloned() else {
        return Ok(vec![err_reply(session_id, t, "Account does not exist.")]);
    };
    if let Some(name) = t.field_data(field::USER_NAME) {
        account.name = String::from_utf8_lossy(name).into_owned();
    }
    if let Some(pw) = t.field_data(field::USER_PASSWORD) {
        // A single zero byte means "password unchanged".
        if !pw.is_empty() && pw != [0] {
            let plain = String::from_utf8_lossy(&negate(pw)).into_owned();
            account.password = hash_password(&plain)?;
        }
    }
    if let Some(access) = t.field_data(field::USER_ACCESS) {
        if access.len() == 8 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(access);
            account.access = crate::access::AccessBitmap::from_bytes(bytes);
        }
    }
    state.upsert_account(account)?;
    Ok(vec![reply(session_id, t, vec![])])
}

pub(super) fn list_users(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let mut logins: Vec<&String> = state.accounts.keys().collect();
    logins.sort();
    let fields = logins
        .into_iter()
        .map(|login| {
            let account = &state.accounts[login];
            let nested = crate::protocol::encode_field_list(&[
                Field::new(field::USER_NAME, account.name.clone().into_bytes()),
                Field::new(field::USER_LOGIN, negate(account.login.as_bytes())),
                Field::new(field::USER_ACCESS, account.access.as_bytes().to_vec()),
            ]);
            Field::new(field::DATA, nested)
        })
        .collect();
    Ok(vec![reply(session_id, t, fields)])
}

/// Batch account administration: each `DATA` field wraps a nested field
/// list describing one create, modify or delete.
pub(super) fn update_user(
    state: &mut ServerState,
    session_id: u16,
    t: &Transaction,
) -> Result<Vec<Transaction>> {
    let caller_access = state.require_session(session_id)?.account.access;
    for entry in t.fields.iter().filter(|f| f.id == field::DATA) {
        let sub = decode_field_list(&entry.data)?;

        // A lone nested DATA field holds a negated login to delete.
        if sub.len() == 1 && sub[0].id == field::DATA {
            if !caller_access.has(perm::DELETE_USER) {
                return Ok(vec![err_reply(
                    session_id,
                    t,
                    "You are not allowed to delete accounts.",
                )]);
            }
            let login = String::from_utf8_lossy(&negate(&sub[0].data)).into_owned();
            let _ = state.delete_account(&login);
            continue;
        }

        let login = sub
            .iter()
            .find(|f| f.id == field::USER_LOGIN)
            .map(|f| String::from_utf8_lossy(&negate(&f.data)).into_owned())
            .unwrap_or_default();
        if login.is_empty() {
            continue;
        }

        if state.accounts.contains_key(&login) {
            if !caller_access.has(perm::MODIFY_USER) {
                return Ok(vec![err_reply(
                    session_id,
                    t,
                    "You are not allowed to modify accounts.",
                )]);
            }
            let account = account_from_fields(&login, &sub)?;
            state.upsert_account(account)?;
        } else {
            if !caller_access.has(perm::CREATE_USER) {
                return Ok(vec![err_reply(
                    session_id,
                    t,
                    "You are not allowed to create new accounts.",
                )]);
            }
            let account = account_from_fields(&login, &sub)?;
            state.upsert_account(account)?;
        }
    }
    Ok(vec![reply(session_id, t, vec![])])
}
