//! Served file tree: filesystem abstraction, wire path resolution,
//! directory listings and the flattened-file transfer format.

mod flatten;
mod info;
mod path;
mod store;

pub use flatten::{
    flattened_size, hotline_time, FlattenHeader, ForkHeader, InfoFork, DATA_FORK_HEADER_LEN,
    FLATTEN_HEADER_LEN, INFO_FORK_HEADER_LEN,
};
pub use info::{file_name_list, file_type_for, FileNameWithInfo, FileTypeInfo, FOLDER_TYPE_CODE};
pub use path::{encode_file_path, resolve_path, FilePath};
pub use store::{walk_tree, DirEntryInfo, FileInfo, FileStore, OsFileStore};

/// Suffix marking a partial upload or download on disk.
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";
