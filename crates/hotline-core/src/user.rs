//! Runtime user identity and the `usernameWithInfo` wire record.

use crate::error::{Error, Result};

/// Bits of the 2-byte user flag bitmap, using the same most-significant
/// first convention as the access bitmap (over 16 bits).
pub mod flag {
    pub const AWAY: u8 = 0;
    pub const ADMIN: u8 = 1;
    pub const REFUSE_PM: u8 = 2;
    pub const REFUSE_CHAT: u8 = 3;
}

/// Test bit `n` of a 16-bit flag bitmap.
pub fn flag_set(flags: u16, n: u8) -> bool {
    debug_assert!(n < 16);
    (flags >> (15 - n)) & 1 == 1
}

/// Return `flags` with bit `n` set or cleared.
pub fn with_flag(flags: u16, n: u8, on: bool) -> u16 {
    debug_assert!(n < 16);
    let mask = 1 << (15 - n);
    if on {
        flags | mask
    } else {
        flags & !mask
    }
}

/// A connected user as carried in user-list replies and change
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Connection-unique 16-bit ID.
    pub id: u16,
    /// Icon ID chosen by the client.
    pub icon: u16,
    /// Flag bitmap (away, admin, refuse-PM, refuse-chat).
    pub flags: u16,
    /// Display name bytes as sent by the client.
    pub name: Vec<u8>,
}

impl User {
    /// Encode as a `usernameWithInfo` field payload:
    /// id(2) + icon(2) + flags(2) + nameLen(2) + name.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.name.len());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.icon.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.name);
        out
    }

    /// Decode a `usernameWithInfo` payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::Malformed("user record truncated".into()));
        }
        let name_len = u16::from_be_bytes([buf[6], buf[7]]) as usize;
        if buf.len() < 8 + name_len {
            return Err(Error::Malformed("user name truncated".into()));
        }
        Ok(Self {
            id: u16::from_be_bytes([buf[0], buf[1]]),
            icon: u16::from_be_bytes([buf[2], buf[3]]),
            flags: u16::from_be_bytes([buf[4], buf[5]]),
            name: buf[8..8 + name_len].to_vec(),
        })
    }
}
