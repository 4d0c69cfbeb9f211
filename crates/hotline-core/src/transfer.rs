//! File-transfer reservations and the side-channel handshake.
//!
//! Handlers on the main port register a pending transfer under a random
//! 32-bit reference number and hand that number to the client. The
//! client opens a second connection to the transfer port and presents
//! the number; the server consumes the reservation (one-shot) and runs
//! the transfer protocol.

use crate::error::{Error, Result};
use crate::protocol::SUB_PROTOCOL_TRANSFER;
use std::path::PathBuf;

/// Length of the transfer-channel handshake.
pub const TRANSFER_HANDSHAKE_LEN: usize = 16;

/// Direction and shape of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Server streams one flattened file to the client.
    FileDownload,
    /// Client streams one flattened file to the server.
    FileUpload,
    /// Server streams a folder, item by item.
    FolderDownload,
    /// Client streams a folder, item by item.
    FolderUpload,
}

/// A registered (pending) transfer.
#[derive(Debug, Clone)]
pub struct FileTransfer {
    /// One-shot reference number.
    pub refnum: u32,
    /// What will flow over the side channel.
    pub kind: TransferKind,
    /// Session that requested the transfer.
    pub client_id: u16,
    /// Absolute on-disk path (file or folder root).
    pub path: PathBuf,
    /// Data size in bytes (files; 0 for folders).
    pub size: u64,
    /// Resume offset into the data fork.
    pub offset: u64,
    /// Folder items in transfer order, relative to `path`.
    pub folder_items: Vec<PathBuf>,
}

/// The 16 bytes a client presents on the transfer port:
/// `HTXF` + refNum(4) + dataSize(4) + reserved(4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHandshake {
    /// Reference number being redeemed.
    pub refnum: u32,
    /// Total size the client expects to send (uploads) or 0.
    pub data_size: u32,
}

impl TransferHandshake {
    /// Encode the handshake.
    pub fn to_bytes(&self) -> [u8; TRANSFER_HANDSHAKE_LEN] {
        let mut out = [0u8; TRANSFER_HANDSHAKE_LEN];
        out[0..4].copy_from_slice(SUB_PROTOCOL_TRANSFER);
        out[4..8].copy_from_slice(&self.refnum.to_be_bytes());
        out[8..12].copy_from_slice(&self.data_size.to_be_bytes());
        out
    }

    /// Decode and validate the handshake.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < TRANSFER_HANDSHAKE_LEN {
            return Err(Error::Protocol("transfer handshake truncated".into()));
        }
        if &buf[0..4] != SUB_PROTOCOL_TRANSFER {
            return Err(Error::Protocol("bad transfer handshake magic".into()));
        }
        Ok(Self {
            refnum: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_size: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }
}

/// Per-item header inside a folder transfer:
/// kind(2, 0=file 1=dir) + nameLen(2) + name + size(8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderItemHeader {
    /// True for directories.
    pub is_dir: bool,
    /// Path of the item relative to the folder root, `/`-separated.
    pub name: Vec<u8>,
    /// File size in bytes; 0 for directories.
    pub size: u64,
}

impl FolderItemHeader {
    /// Encode the item header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.name.len());
        out.extend_from_slice(&(self.is_dir as u16).to_be_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.size.to_be_bytes());
        out
    }

    /// Decode an item header, returning it and the bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(Error::Protocol("folder item header truncated".into()));
        }
        let is_dir = u16::from_be_bytes([buf[0], buf[1]]) == 1;
        let name_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + name_len + 8 {
            return Err(Error::Protocol("folder item header truncated".into()));
        }
        let name = buf[4..4 + name_len].to_vec();
        let mut size_buf = [0u8; 8];
        size_buf.copy_from_slice(&buf[4 + name_len..12 + name_len]);
        let size = u64::from_be_bytes(size_buf);
        Ok((Self { is_dir, name, size }, 12 + name_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let hs = TransferHandshake { refnum: 0x52fd_fc07, data_size: 0 };
        let wire = hs.to_bytes();
        assert_eq!(&wire[0..4], b"HTXF");
        assert_eq!(TransferHandshake::from_bytes(&wire).expect("decode"), hs);
    }

    #[test]
    fn test_handshake_rejects_main_protocol_magic() {
        let mut wire = TransferHandshake { refnum: 1, data_size: 0 }.to_bytes();
        wire[0..4].copy_from_slice(b"TRTP");
        assert!(TransferHandshake::from_bytes(&wire).is_err());
    }

    #[test]
    fn test_folder_item_roundtrip() {
        let item =
            FolderItemHeader { is_dir: false, name: b"sub/one.txt".to_vec(), size: 1234 };
        let wire = item.to_bytes();
        let (parsed, used) = FolderItemHeader::from_bytes(&wire).expect("decode");
        assert_eq!(used, wire.len());
        assert_eq!(parsed, item);
    }
}
