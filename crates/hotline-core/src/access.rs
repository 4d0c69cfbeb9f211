//! 64-bit access bitmap with named permission bits.
//!
//! Bit N of the bitmap is tested as `(value >> (63 - N)) & 1`, i.e. bit
//! 0 is the most significant bit of the first byte. This mapping is
//! part of the wire contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named permission bits.
pub mod perm {
    pub const DELETE_FILE: u8 = 0;
    pub const UPLOAD_FILE: u8 = 1;
    pub const DOWNLOAD_FILE: u8 = 2;
    pub const RENAME_FILE: u8 = 3;
    pub const MOVE_FILE: u8 = 4;
    pub const CREATE_FOLDER: u8 = 5;
    pub const DELETE_FOLDER: u8 = 6;
    pub const RENAME_FOLDER: u8 = 7;
    pub const MOVE_FOLDER: u8 = 8;
    pub const READ_CHAT: u8 = 9;
    pub const SEND_CHAT: u8 = 10;
    pub const OPEN_CHAT: u8 = 11;
    pub const CLOSE_CHAT: u8 = 12;
    pub const SHOW_IN_LIST: u8 = 13;
    pub const CREATE_USER: u8 = 14;
    pub const DELETE_USER: u8 = 15;
    pub const OPEN_USER: u8 = 16;
    pub const MODIFY_USER: u8 = 17;
    pub const CHANGE_OWN_PASS: u8 = 18;
    pub const SEND_PRIV_MSG: u8 = 19;
    pub const NEWS_READ_ART: u8 = 20;
    pub const NEWS_POST_ART: u8 = 21;
    pub const DISCON_USER: u8 = 22;
    pub const CANNOT_BE_DISCON: u8 = 23;
    pub const GET_CLIENT_INFO: u8 = 24;
    pub const UPLOAD_ANYWHERE: u8 = 25;
    pub const ANY_NAME: u8 = 26;
    pub const NO_AGREEMENT: u8 = 27;
    pub const SET_FILE_COMMENT: u8 = 28;
    pub const SET_FOLDER_COMMENT: u8 = 29;
    pub const VIEW_DROP_BOXES: u8 = 30;
    pub const MAKE_ALIAS: u8 = 31;
    pub const BROADCAST: u8 = 32;
    pub const NEWS_DELETE_ART: u8 = 33;
    pub const NEWS_CREATE_CAT: u8 = 34;
    pub const NEWS_DELETE_CAT: u8 = 35;
    pub const NEWS_CREATE_FLDR: u8 = 36;
    pub const NEWS_DELETE_FLDR: u8 = 37;
}

/// 8-byte permission set carried in accounts and `USER_ACCESS` fields.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessBitmap(pub [u8; 8]);

impl AccessBitmap {
    /// The empty bitmap: no permissions.
    pub fn none() -> Self {
        Self([0; 8])
    }

    /// Every bit set; used for administrator accounts.
    pub fn all() -> Self {
        Self([0xff; 8])
    }

    /// Build a bitmap with exactly the given bits set.
    pub fn with_bits(bits: &[u8]) -> Self {
        let mut bm = Self::none();
        for &b in bits {
            bm.set(b);
        }
        bm
    }

    /// Construct from raw wire bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Test permission bit `n`.
    pub fn has(&self, n: u8) -> bool {
        debug_assert!(n < 64);
        let value = u64::from_be_bytes(self.0);
        (value >> (63 - n)) & 1 == 1
    }

    /// Set permission bit `n`.
    pub fn set(&mut self, n: u8) {
        debug_assert!(n < 64);
        let mut value = u64::from_be_bytes(self.0);
        value |= 1 << (63 - n);
        self.0 = value.to_be_bytes();
    }

    /// Clear permission bit `n`.
    pub fn clear(&mut self, n: u8) {
        debug_assert!(n < 64);
        let mut value = u64::from_be_bytes(self.0);
        value &= !(1 << (63 - n));
        self.0 = value.to_be_bytes();
    }
}

impl fmt::Debug for AccessBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessBitmap({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_zero_is_msb() {
        let bm = AccessBitmap::from_bytes([0x80, 0, 0, 0, 0, 0, 0, 0]);
        assert!(bm.has(perm::DELETE_FILE));
        assert!(!bm.has(perm::UPLOAD_FILE));
    }

    #[test]
    fn test_set_and_clear() {
        let mut bm = AccessBitmap::none();
        bm.set(perm::SEND_CHAT);
        assert!(bm.has(perm::SEND_CHAT));
        assert!(!bm.has(perm::READ_CHAT));
        bm.clear(perm::SEND_CHAT);
        assert_eq!(bm, AccessBitmap::none());
    }

    #[test]
    fn test_wire_position_of_send_chat() {
        // Bit 10 lives in byte 1, mask 0x20.
        let bm = AccessBitmap::with_bits(&[perm::SEND_CHAT]);
        assert_eq!(bm.as_bytes(), &[0x00, 0x20, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_all_has_everything() {
        let bm = AccessBitmap::all();
        for n in 0..64 {
            assert!(bm.has(n));
        }
    }
}
