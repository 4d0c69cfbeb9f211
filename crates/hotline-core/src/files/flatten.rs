//! The flattened-file format used on the transfer side channel.
//!
//! A download streams: flatten header, information fork (type, creator,
//! dates, name, comment), then a data-fork header followed by the raw
//! file bytes. Uploads stream the same shape back.
//!
//! ```text
//! 'FILP' v=1 ....16 reserved.... forkCount=2        24 bytes
//! 'INFO' compression=0 reserved dataSize            16 bytes
//! platform typeCode creatorCode flags platFlags
//!   ....32 reserved.... createDate(8) modifyDate(8)
//!   nameScript(2) nameLen(2) name commentLen(2) comment
//! 'DATA' ....8 reserved.... dataSize                16 bytes
//! <file bytes>
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};

/// Length of the outer flatten header.
pub const FLATTEN_HEADER_LEN: usize = 24;
/// Length of a fork header (both INFO and DATA).
pub const INFO_FORK_HEADER_LEN: usize = 16;
/// Length of the data fork header.
pub const DATA_FORK_HEADER_LEN: usize = 16;

/// Fixed bytes of the information fork before the name and comment.
const INFO_FORK_FIXED_LEN: usize = 74;

/// Outer header of a flattened file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenHeader {
    /// Number of forks that follow; always 2 here (INFO + DATA).
    pub fork_count: u16,
}

impl FlattenHeader {
    /// Encode the 24-byte header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FLATTEN_HEADER_LEN);
        out.extend_from_slice(b"FILP");
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&[0; 16]);
        out.extend_from_slice(&self.fork_count.to_be_bytes());
        out
    }

    /// Decode and validate the 24-byte header.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < FLATTEN_HEADER_LEN {
            return Err(Error::Malformed("flatten header truncated".into()));
        }
        if &buf[0..4] != b"FILP" {
            return Err(Error::Malformed("bad flatten magic".into()));
        }
        Ok(Self { fork_count: u16::from_be_bytes([buf[22], buf[23]]) })
    }
}

/// Fork header: a 4-char fork type and the fork's payload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkHeader {
    /// `INFO` or `DATA`.
    pub fork_type: [u8; 4],
    /// Payload bytes following this header.
    pub data_size: u32,
}

impl ForkHeader {
    /// Encode the 16-byte fork header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(INFO_FORK_HEADER_LEN);
        out.extend_from_slice(&self.fork_type);
        out.extend_from_slice(&[0; 8]); // compression + reserved
        out.extend_from_slice(&self.data_size.to_be_bytes());
        out
    }

    /// Decode a 16-byte fork header.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < INFO_FORK_HEADER_LEN {
            return Err(Error::Malformed("fork header truncated".into()));
        }
        Ok(Self {
            fork_type: [buf[0], buf[1], buf[2], buf[3]],
            data_size: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// The information fork: metadata travelling ahead of the data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoFork {
    /// 4-char type code.
    pub type_code: [u8; 4],
    /// 4-char creator code.
    pub creator_code: [u8; 4],
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Modification time.
    pub modified: DateTime<Utc>,
    /// File name bytes.
    pub name: Vec<u8>,
    /// Comment bytes.
    pub comment: Vec<u8>,
}

impl InfoFork {
    /// Wire length of this fork.
    pub fn wire_len(&self) -> usize {
        INFO_FORK_FIXED_LEN + self.name.len() + self.comment.len()
    }

    /// Encode the fork payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(b"AMAC");
        out.extend_from_slice(&self.type_code);
        out.extend_from_slice(&self.creator_code);
        out.extend_from_slice(&[0; 8]); // flags + platform flags
        out.extend_from_slice(&[0; 32]);
        out.extend_from_slice(&hotline_time(self.created));
        out.extend_from_slice(&hotline_time(self.modified));
        out.extend_from_slice(&[0; 2]); // name script
        out.extend_from_slice(&(self.name.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&(self.comment.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.comment);
        out
    }

    /// Decode the fork payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < INFO_FORK_FIXED_LEN - 2 {
            return Err(Error::Malformed("info fork truncated".into()));
        }
        let name_len = u16::from_be_bytes([buf[70], buf[71]]) as usize;
        if buf.len() < 72 + name_len + 2 {
            return Err(Error::Malformed("info fork name truncated".into()));
        }
        let name = buf[72..72 + name_len].to_vec();
        let comment_off = 72 + name_len;
        let comment_len = u16::from_be_bytes([buf[comment_off], buf[comment_off + 1]]) as usize;
        if buf.len() < comment_off + 2 + comment_len {
            return Err(Error::Malformed("info fork comment truncated".into()));
        }
        let comment = buf[comment_off + 2..comment_off + 2 + comment_len].to_vec();
        Ok(Self {
            type_code: [buf[4], buf[5], buf[6], buf[7]],
            creator_code: [buf[8], buf[9], buf[10], buf[11]],
            created: from_hotline_time(&buf[52..60]),
            modified: from_hotline_time(&buf[60..68]),
            name,
            comment,
        })
    }
}

/// Total on-wire size of a flattened file with the given data length,
/// name length and comment length.
pub fn flattened_size(data_len: u64, name_len: usize, comment_len: usize) -> u64 {
    (FLATTEN_HEADER_LEN
        + INFO_FORK_HEADER_LEN
        + INFO_FORK_FIXED_LEN
        + name_len
        + comment_len
        + DATA_FORK_HEADER_LEN) as u64
        + data_len
}

/// The 1904 epoch the 8-byte wire timestamps count from.
fn epoch_1904() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1904, 1, 1, 0, 0, 0).unwrap()
}

/// Encode a timestamp as year(2, =1904) + milliseconds(2, =0) +
/// seconds-since-1904(4).
pub fn hotline_time(t: DateTime<Utc>) -> [u8; 8] {
    let secs = (t - epoch_1904()).num_seconds().max(0) as u32;
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&1904u16.to_be_bytes());
    out[4..8].copy_from_slice(&secs.to_be_bytes());
    out
}

fn from_hotline_time(buf: &[u8]) -> DateTime<Utc> {
    let secs = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    epoch_1904() + chrono::Duration::seconds(secs as i64)
}
