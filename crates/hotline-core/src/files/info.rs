//! File type codes and the `fileNameWithInfo` listing record.

use super::store::FileStore;
use super::INCOMPLETE_SUFFIX;
use crate::error::{Error, Result};
use crate::protocol::{field, Field};
use std::path::Path;

/// Four-char type code used for directories.
pub const FOLDER_TYPE_CODE: &[u8; 4] = b"fldr";

/// Creator code reported for directories.
const FOLDER_CREATOR_CODE: &[u8; 4] = b"n/a ";

/// The protocol's 4-byte size field cannot express files over 4 GiB;
/// they are omitted from listings.
const MAX_LISTABLE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Classic Mac type/creator codes plus a human-readable label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTypeInfo {
    /// 4-char type code.
    pub type_code: &'static [u8; 4],
    /// 4-char creator code.
    pub creator_code: &'static [u8; 4],
    /// Label shown in file-info dialogs.
    pub label: &'static str,
}

const DEFAULT_FILE_TYPE: FileTypeInfo =
    FileTypeInfo { type_code: b"TEXT", creator_code: b"TTXT", label: "File" };

/// Look up type info by file extension (case-insensitive).
pub fn file_type_for(file_name: &str) -> FileTypeInfo {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" => FileTypeInfo { type_code: b"TEXT", creator_code: b"ttxt", label: "Text File" },
        "gif" => FileTypeInfo { type_code: b"GIFf", creator_code: b"ogle", label: "GIF Picture" },
        "jpg" | "jpeg" => {
            FileTypeInfo { type_code: b"JPEG", creator_code: b"ogle", label: "JPEG Picture" }
        }
        "png" => FileTypeInfo { type_code: b"PNGf", creator_code: b"ogle", label: "PNG Picture" },
        "zip" => FileTypeInfo { type_code: b"ZIP ", creator_code: b"SITx", label: "Zip Archive" },
        "sit" => {
            FileTypeInfo { type_code: b"SIT!", creator_code: b"SIT!", label: "StuffIt Archive" }
        }
        "mp3" => FileTypeInfo { type_code: b"MPEG", creator_code: b"TVOD", label: "MP3 Audio" },
        "pdf" => FileTypeInfo { type_code: b"PDF ", creator_code: b"CARO", label: "PDF Document" },
        "html" | "htm" => {
            FileTypeInfo { type_code: b"TEXT", creator_code: b"MOSS", label: "HTML Document" }
        }
        _ => DEFAULT_FILE_TYPE,
    }
}

/// One entry of a file listing: type, creator, size, reserved bytes and
/// a length-prefixed name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameWithInfo {
    /// 4-char type code; `fldr` for directories.
    pub type_code: [u8; 4],
    /// 4-char creator code.
    pub creator_code: [u8; 4],
    /// File size in bytes; entry count for directories.
    pub size: u32,
    /// Name bytes.
    pub name: Vec<u8>,
}

impl FileNameWithInfo {
    /// Encode: type(4) + creator(4) + size(4) + reserved(4)
    /// + nameLen(2) + name.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.name.len());
        out.extend_from_slice(&self.type_code);
        out.extend_from_slice(&self.creator_code);
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&(self.name.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.name);
        out
    }

    /// Decode the wire form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 18 {
            return Err(Error::Malformed("file listing entry truncated".into()));
        }
        let name_len = u16::from_be_bytes([buf[16], buf[17]]) as usize;
        if buf.len() < 18 + name_len {
            return Err(Error::Malformed("file listing name truncated".into()));
        }
        Ok(Self {
            type_code: [buf[0], buf[1], buf[2], buf[3]],
            creator_code: [buf[4], buf[5], buf[6], buf[7]],
            size: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            name: buf[18..18 + name_len].to_vec(),
        })
    }

    /// Whether this entry names a directory.
    pub fn is_folder(&self) -> bool {
        &self.type_code == FOLDER_TYPE_CODE
    }
}

/// Build the listing fields for a directory. Directories report their
/// entry count as the size; `.incomplete` suffixes are stripped from
/// names; files over 4 GiB are skipped. A missing directory yields an
/// empty listing rather than an error.
pub fn file_name_list(store: &dyn FileStore, path: &Path) -> Result<Vec<Field>> {
    let entries = match store.read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return Ok(Vec::new()),
    };

    let mut fields = Vec::with_capacity(entries.len());
    for entry in entries {
        let fnwi = if entry.info.is_dir {
            FileNameWithInfo {
                type_code: *FOLDER_TYPE_CODE,
                creator_code: *FOLDER_CREATOR_CODE,
                size: entry.entry_count,
                name: entry.name.clone().into_bytes(),
            }
        } else {
            if entry.info.len > MAX_LISTABLE_SIZE {
                continue;
            }
            let ft = file_type_for(&entry.name);
            FileNameWithInfo {
                type_code: *ft.type_code,
                creator_code: *ft.creator_code,
                size: entry.info.len as u32,
                name: entry.name.replace(INCOMPLETE_SUFFIX, "").into_bytes(),
            }
        };
        fields.push(Field::new(field::FILE_NAME_WITH_INFO, fnwi.to_bytes()));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::OsFileStore;

    #[test]
    fn test_type_lookup() {
        let txt = file_type_for("testfile.txt");
        assert_eq!(txt.type_code, b"TEXT");
        assert_eq!(txt.creator_code, b"ttxt");
        assert_eq!(txt.label, "Text File");

        assert_eq!(file_type_for("TESTFILE.TXT").type_code, b"TEXT");
        assert_eq!(file_type_for("archive.unknownext"), DEFAULT_FILE_TYPE);
    }

    #[test]
    fn test_record_roundtrip() {
        let fnwi = FileNameWithInfo {
            type_code: *b"TEXT",
            creator_code: *b"ttxt",
            size: 0x17,
            name: b"testfile.txt".to_vec(),
        };
        let wire = fnwi.to_bytes();
        assert_eq!(wire.len(), 18 + 12);
        assert_eq!(FileNameWithInfo::from_bytes(&wire).expect("decode"), fnwi);
        assert!(!fnwi.is_folder());
    }

    #[test]
    fn test_listing_marks_folders_and_strips_incomplete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = OsFileStore;
        store.mkdir(&dir.path().join("sub")).expect("mkdir");
        store.write_file(&dir.path().join("sub/one.txt"), b"1").expect("write");
        store.write_file(&dir.path().join("partial.zip.incomplete"), b"zz").expect("write");

        let fields = file_name_list(&store, dir.path()).expect("list");
        assert_eq!(fields.len(), 2);

        let first = FileNameWithInfo::from_bytes(&fields[0].data).expect("decode");
        assert_eq!(first.name, b"partial.zip");
        assert_eq!(first.size, 2);

        let second = FileNameWithInfo::from_bytes(&fields[1].data).expect("decode");
        assert!(second.is_folder());
        assert_eq!(second.creator_code, *b"n/a ");
        assert_eq!(second.size, 1); // entry count, not bytes
    }

    #[test]
    fn test_listing_missing_directory_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fields = file_name_list(&OsFileStore, &dir.path().join("nope")).expect("list");
        assert!(fields.is_empty());
    }
}
