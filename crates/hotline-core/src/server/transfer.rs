//! The file-transfer side channel.
//!
//! A second listener accepts connections that open with the `HTXF`
//! handshake carrying a reference number. The reservation is consumed
//! (one-shot) and the transfer runs: downloads stream a flattened file,
//! uploads stream one into `<dest>.incomplete` and rename on clean EOF,
//! folder transfers walk items in sorted order with a per-item header.
//! A dropped connection releases the reservation but leaves
//! `.incomplete` files for future resume.

use super::handlers::incomplete_path;
use super::HotlineServer;
use crate::error::{Error, Result};
use crate::files::{
    file_type_for, FlattenHeader, ForkHeader, InfoFork, FLATTEN_HEADER_LEN, INFO_FORK_HEADER_LEN,
};
use crate::transfer::{
    FileTransfer, FolderItemHeader, TransferHandshake, TransferKind, TRANSFER_HANDSHAKE_LEN,
};
use crate::{HANDSHAKE_DEADLINE_SECS, TRANSFER_IDLE_SECS};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Chunk size for streaming file data.
const CHUNK_SIZE: usize = 32 * 1024;

/// Accept transfer connections until `shutdown` fires.
pub async fn run_transfer_listener(
    server: Arc<HotlineServer>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "transfer accept failed");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    if let Err(e) = handle_transfer(server, socket).await {
                        debug!(%addr, error = %e, "transfer ended with error");
                    }
                });
            }
        }
    }
}

/// Redeem the handshake's refnum and run the matching transfer.
async fn handle_transfer(server: Arc<HotlineServer>, mut socket: TcpStream) -> Result<()> {
    let mut buf = [0u8; TRANSFER_HANDSHAKE_LEN];
    tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_DEADLINE_SECS),
        socket.read_exact(&mut buf),
    )
    .await
    .map_err(|_| Error::Timeout)??;
    let handshake = TransferHandshake::from_bytes(&buf)?;

    let transfer = {
        let mut state = server.lock();
        state.consume_transfer(handshake.refnum)
    };
    let Some(transfer) = transfer else {
        warn!(refnum = handshake.refnum, "unknown or already-used transfer refnum");
        return Err(Error::NotFound("transfer reservation".into()));
    };
    info!(
        refnum = transfer.refnum,
        kind = ?transfer.kind,
        path = %transfer.path.display(),
        "transfer started"
    );

    let client_id = transfer.client_id;
    let result = match transfer.kind {
        TransferKind::FileDownload => send_file(&mut socket, &transfer).await,
        TransferKind::FileUpload => receive_file(&mut socket, &transfer).await,
        TransferKind::FolderDownload => send_folder(&mut socket, &transfer).await,
        TransferKind::FolderUpload => receive_folder(&mut socket, &transfer).await,
    };

    let mut state = server.lock();
    state.finish_transfer(client_id);
    drop(state);

    match &result {
        Ok(()) => info!(refnum = transfer.refnum, "transfer complete"),
        Err(e) => warn!(refnum = transfer.refnum, error = %e, "transfer aborted"),
    }
    result
}

async fn idle_timeout<T>(
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(Duration::from_secs(TRANSFER_IDLE_SECS), fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout),
    }
}

/// Serialize the flatten header and both fork headers for `path`.
fn flatten_preamble(path: &Path, data_len: u64, modified: DateTime<Utc>) -> Vec<u8> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ft = file_type_for(&name);
    let info = InfoFork {
        type_code: *ft.type_code,
        creator_code: *ft.creator_code,
        created: modified,
        modified,
        name: name.into_bytes(),
        comment: Vec::new(),
    };
    let info_bytes = info.to_bytes();

    let mut out = Vec::with_capacity(
        FLATTEN_HEADER_LEN + INFO_FORK_HEADER_LEN * 2 + info_bytes.len(),
    );
    out.extend_from_slice(&FlattenHeader { fork_count: 2 }.to_bytes());
    out.extend_from_slice(
        &ForkHeader { fork_type: *b"INFO", data_size: info_bytes.len() as u32 }.to_bytes(),
    );
    out.extend_from_slice(&info_bytes);
    out.extend_from_slice(&ForkHeader { fork_type: *b"DATA", data_size: data_len as u32 }.to_bytes());
    out
}

/// Stream one flattened file, honoring the resume offset. Falls back to
/// the `.incomplete` twin when the final name is missing.
async fn send_file<W>(socket: &mut W, transfer: &FileTransfer) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (mut file, len) = match tokio::fs::File::open(&transfer.path).await {
        Ok(file) => {
            let len = file.metadata().await?.len();
            (file, len)
        }
        Err(_) => {
            let twin = incomplete_path(&transfer.path);
            let file = tokio::fs::File::open(&twin).await?;
            let len = file.metadata().await?.len();
            (file, len)
        }
    };
    let data_len = len.saturating_sub(transfer.offset);
    let preamble = flatten_preamble(&transfer.path, data_len, Utc::now());
    idle_timeout(socket.write_all(&preamble)).await?;

    if transfer.offset > 0 {
        use tokio::io::AsyncSeekExt;
        file.seek(std::io::SeekFrom::Start(transfer.offset)).await?;
    }
    copy_n(&mut file, socket, data_len).await?;
    idle_timeout(socket.flush()).await?;
    Ok(())
}

/// Stream exactly `n` bytes from `src` to `dst` in chunks, applying the
/// inactivity timeout to every read and write.
async fn copy_n<R, W>(src: &mut R, dst: &mut W, mut n: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    while n > 0 {
        let want = (n as usize).min(CHUNK_SIZE);
        let read = idle_timeout(src.read(&mut chunk[..want])).await?;
        if read == 0 {
            return Err(Error::Protocol("stream ended early".into()));
        }
        idle_timeout(dst.write_all(&chunk[..read])).await?;
        n -= read as u64;
    }
    Ok(())
}

/// Parse the flattened preamble off an upload stream and return the
/// data fork's declared size.
async fn read_flatten_preamble<R>(socket: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FLATTEN_HEADER_LEN];
    idle_timeout(socket.read_exact(&mut header)).await?;
    FlattenHeader::from_bytes(&header)?;

    // Forks up to DATA are consumed; DATA's size is the payload length.
    loop {
        let mut fork = [0u8; INFO_FORK_HEADER_LEN];
        idle_timeout(socket.read_exact(&mut fork)).await?;
        let fork = ForkHeader::from_bytes(&fork)?;
        if &fork.fork_type == b"DATA" {
            return Ok(fork.data_size as u64);
        }
        let mut skip = vec![0u8; fork.data_size as usize];
        idle_timeout(socket.read_exact(&mut skip)).await?;
    }
}

/// Receive one flattened file into `<dest>.incomplete`, renaming into
/// place on a clean end of stream.
async fn receive_file<R>(socket: &mut R, transfer: &FileTransfer) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let data_len = read_flatten_preamble(socket).await?;
    write_upload(socket, &transfer.path, data_len, transfer.offset).await
}

async fn write_upload<R>(socket: &mut R, dest: &Path, data_len: u64, offset: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let partial = incomplete_path(dest);
    let mut file = if offset > 0 {
        tokio::fs::OpenOptions::new().append(true).open(&partial).await?
    } else {
        tokio::fs::File::create(&partial).await?
    };
    copy_n(socket, &mut file, data_len).await?;
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&partial, dest).await?;
    Ok(())
}

/// Walk the registered items in order: a header per item, then the
/// flattened stream for files.
async fn send_folder<W>(socket: &mut W, transfer: &FileTransfer) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for rel in &transfer.folder_items {
        let abs = transfer.path.join(rel);
        let md = tokio::fs::metadata(&abs).await?;
        let name = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
        let header = FolderItemHeader {
            is_dir: md.is_dir(),
            name: name.into_bytes(),
            size: if md.is_dir() { 0 } else { md.len() },
        };
        idle_timeout(socket.write_all(&header.to_bytes())).await?;
        if md.is_dir() {
            continue;
        }
        let modified = md.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        let preamble = flatten_preamble(&abs, md.len(), modified);
        idle_timeout(socket.write_all(&preamble)).await?;
        let mut file = tokio::fs::File::open(&abs).await?;
        copy_n(&mut file, socket, md.len()).await?;
    }
    idle_timeout(socket.flush()).await?;
    Ok(())
}

/// Receive folder items until the peer closes the stream cleanly.
async fn receive_folder<R>(socket: &mut R, transfer: &FileTransfer) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    tokio::fs::create_dir_all(&transfer.path).await?;
    loop {
        let mut fixed = [0u8; 4];
        match tokio::time::timeout(
            Duration::from_secs(TRANSFER_IDLE_SECS),
            socket.read_exact(&mut fixed),
        )
        .await
        {
            Err(_) => return Err(Error::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }
        let name_len = u16::from_be_bytes([fixed[2], fixed[3]]) as usize;
        let mut rest = vec![0u8; name_len + 8];
        idle_timeout(socket.read_exact(&mut rest)).await?;
        let mut wire = fixed.to_vec();
        wire.extend_from_slice(&rest);
        let (item, _) = FolderItemHeader::from_bytes(&wire)?;

        // Item names are relative paths; strip anything that could
        // escape the destination folder.
        let clean: Vec<String> = String::from_utf8_lossy(&item.name)
            .split('/')
            .map(|part| part.replace("..", "").replace('\\', ""))
            .filter(|part| !part.is_empty())
            .collect();
        if clean.is_empty() {
            return Err(Error::Protocol("empty folder item name".into()));
        }
        let mut dest = transfer.path.clone();
        for part in &clean {
            dest.push(part);
        }

        if item.is_dir {
            tokio::fs::create_dir_all(&dest).await?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data_len = read_flatten_preamble(socket).await?;
        write_upload(socket, &dest, data_len, 0).await?;
    }
}

/// Client-side helper: encode the whole flattened form of a buffer.
/// Used by tests and the client's upload path.
pub fn flatten_file_bytes(name: &str, data: &[u8], modified: DateTime<Utc>) -> Vec<u8> {
    let ft = file_type_for(name);
    let info = InfoFork {
        type_code: *ft.type_code,
        creator_code: *ft.creator_code,
        created: modified,
        modified,
        name: name.as_bytes().to_vec(),
        comment: Vec::new(),
    };
    let info_bytes = info.to_bytes();
    let mut out = Vec::new();
    out.extend_from_slice(&FlattenHeader { fork_count: 2 }.to_bytes());
    out.extend_from_slice(
        &ForkHeader { fork_type: *b"INFO", data_size: info_bytes.len() as u32 }.to_bytes(),
    );
    out.extend_from_slice(&info_bytes);
    out.extend_from_slice(
        &ForkHeader { fork_type: *b"DATA", data_size: data.len() as u32 }.to_bytes(),
    );
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::flattened_size;

    #[test]
    fn test_preamble_length_matches_flattened_size() {
        let path = Path::new("/tmp/testfile.txt");
        let preamble = flatten_preamble(path, 23, Utc::now());
        assert_eq!(preamble.len() as u64 + 23, flattened_size(23, "testfile.txt".len(), 0));
    }

    #[tokio::test]
    async fn test_flattened_upload_roundtrip() {
        let data = b"the quick brown fox".to_vec();
        let wire = flatten_file_bytes("fox.txt", &data, Utc::now());
        let mut cursor = std::io::Cursor::new(wire);
        let len = read_flatten_preamble(&mut cursor).await.expect("preamble");
        assert_eq!(len, data.len() as u64);
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).await.expect("read");
        assert_eq!(rest, data);
    }

    #[tokio::test]
    async fn test_receive_file_renames_on_clean_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("upload.txt");
        let transfer = FileTransfer {
            refnum: 1,
            kind: TransferKind::FileUpload,
            client_id: 1,
            path: dest.clone(),
            size: 0,
            offset: 0,
            folder_items: vec![],
        };
        let wire = flatten_file_bytes("upload.txt", b"payload", Utc::now());
        let mut cursor = std::io::Cursor::new(wire);
        receive_file(&mut cursor, &transfer).await.expect("receive");
        assert_eq!(std::fs::read(&dest).expect("read"), b"payload");
        assert!(!incomplete_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_truncated_upload_leaves_incomplete_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("upload.txt");
        let transfer = FileTransfer {
            refnum: 1,
            kind: TransferKind::FileUpload,
            client_id: 1,
            path: dest.clone(),
            size: 0,
            offset: 0,
            folder_items: vec![],
        };
        let mut wire = flatten_file_bytes("upload.txt", b"payload", Utc::now());
        wire.truncate(wire.len() - 3); // drop the last bytes mid-stream
        let mut cursor = std::io::Cursor::new(wire);
        assert!(receive_file(&mut cursor, &transfer).await.is_err());
        assert!(!dest.exists());
        assert!(incomplete_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_send_file_resume_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("data.bin");
        std::fs::write(&src, b"0123456789").expect("write");
        let transfer = FileTransfer {
            refnum: 1,
            kind: TransferKind::FileDownload,
            client_id: 1,
            path: src,
            size: 10,
            offset: 6,
            folder_items: vec![],
        };
        let mut sink = std::io::Cursor::new(Vec::new());
        send_file(&mut sink, &transfer).await.expect("send");
        let out = sink.into_inner();
        // The stream ends with just the un-sent tail.
        assert!(out.ends_with(b"6789"));
        let mut cursor = std::io::Cursor::new(out);
        let len = read_flatten_preamble(&mut cursor).await.expect("preamble");
        assert_eq!(len, 4);
    }
}
