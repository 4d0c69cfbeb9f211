//! End-to-end tests over real TCP connections: handshake, login,
//! agreement, chat fan-out and the transfer side channel.

use hotline_core::access::{perm, AccessBitmap};
use hotline_core::account::Account;
use hotline_core::client::{Client, ClientPrefs, ClientUi};
use hotline_core::files::{flattened_size, FlattenHeader, ForkHeader, InfoFork};
use hotline_core::protocol::CLIENT_HANDSHAKE;
use hotline_core::server::{ClientSession, Config, HotlineServer, ServerState};
use hotline_core::transfer::{TransferHandshake, TransferKind};
use hotline_core::user::User;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Spin a server on ephemeral ports; returns it plus both addresses and
/// the shutdown trigger.
async fn start_server(
    mut mutate: impl FnMut(&mut ServerState),
) -> (Arc<HotlineServer>, SocketAddr, SocketAddr, watch::Sender<bool>) {
    let config = Config { bind_addr: "127.0.0.1".into(), ..Config::default() };
    let mut state = ServerState::new(config);
    let guest = Account::new(
        "guest",
        "Guest",
        "pw",
        AccessBitmap::with_bits(&[
            perm::READ_CHAT,
            perm::SEND_CHAT,
            perm::NEWS_READ_ART,
            perm::DOWNLOAD_FILE,
        ]),
    )
    .expect("account");
    state.accounts.insert("guest".into(), guest);
    mutate(&mut state);
    let server = HotlineServer::new(state);

    let main = TcpListener::bind("127.0.0.1:0").await.expect("bind main");
    let transfers = TcpListener::bind("127.0.0.1:0").await.expect("bind transfers");
    let main_addr = main.local_addr().expect("addr");
    let transfer_addr = transfers.local_addr().expect("addr");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serve.serve(main, transfers, shutdown_rx).await;
    });
    (server, main_addr, transfer_addr, shutdown_tx)
}

#[derive(Default, Clone)]
struct RecordingUi {
    chat: Arc<Mutex<Vec<String>>>,
    agreements: Arc<Mutex<Vec<String>>>,
}

impl ClientUi for RecordingUi {
    fn chat_line(&mut self, line: &str) {
        self.chat.lock().unwrap().push(line.to_string());
    }
    fn user_list(&mut self, _users: &[User]) {}
    fn modal(&mut self, _title: &str, _body: &str) {}
    fn agreement(&mut self, text: &str) -> bool {
        self.agreements.lock().unwrap().push(text.to_string());
        true
    }
}

/// Pump a client's read loop until `done` or the deadline passes.
async fn pump_until(client: &mut Client, mut done: impl FnMut(&Client) -> bool) {
    for _ in 0..100 {
        if done(client) {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_millis(100), client.run()).await;
    }
    panic!("timed out waiting for client state");
}

#[tokio::test]
async fn test_bad_handshake_is_rejected() {
    let (_server, main_addr, _xfer, _shutdown) = start_server(|_| {}).await;

    let mut socket = TcpStream::connect(main_addr).await.expect("connect");
    let mut bad = CLIENT_HANDSHAKE;
    bad[4..8].copy_from_slice(b"NOPE");
    socket.write_all(&bad).await.expect("write");

    let mut reply = [0u8; 8];
    socket.read_exact(&mut reply).await.expect("read");
    assert_eq!(&reply[0..4], b"TRTP");
    assert_ne!(&reply[4..8], &[0, 0, 0, 0], "non-zero error code");
    // Server closes after the rejection.
    let n = socket.read(&mut reply).await.expect("read");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_wrong_password_gets_error_reply_and_close() {
    let (_server, main_addr, _xfer, _shutdown) = start_server(|_| {}).await;

    let ui = RecordingUi::default();
    let mut client = Client::new(ClientPrefs::default(), Box::new(ui));
    client
        .join_server(&main_addr.to_string(), "guest", "wrong")
        .await
        .expect("join sends the login");
    // The read loop terminates once the server closes on us.
    let result = tokio::time::timeout(Duration::from_secs(5), client.run()).await;
    assert!(result.is_ok(), "server should close the connection");
}

#[tokio::test]
async fn test_login_agreement_and_access_flow() {
    let (server, main_addr, _xfer, _shutdown) = start_server(|state| {
        state.config.agreement = "Be excellent to each other.".into();
    })
    .await;

    let ui = RecordingUi::default();
    let mut client = Client::new(ClientPrefs::default(), Box::new(ui.clone()));
    client.join_server(&main_addr.to_string(), "guest", "pw").await.expect("join");

    pump_until(&mut client, |c| c.user_access.is_some()).await;

    // The agreement was shown and the access bitmap matches the account.
    assert_eq!(ui.agreements.lock().unwrap().as_slice(), ["Be excellent to each other."]);
    let access = AccessBitmap::from_bytes(client.user_access.expect("access"));
    assert!(access.has(perm::SEND_CHAT));
    assert!(!access.has(perm::DELETE_USER));
    assert_eq!(client.server_name, "Hotline Server");

    // Server side: exactly one agreed session.
    let state = server.lock();
    assert_eq!(state.clients.len(), 1);
    assert!(state.clients.values().all(|s| s.agreed));
}

#[tokio::test]
async fn test_chat_roundtrip_between_two_clients() {
    let (_server, main_addr, _xfer, _shutdown) = start_server(|_| {}).await;

    let ui_a = RecordingUi::default();
    let mut a = Client::new(
        ClientPrefs { username: "alice".into(), icon_id: 1 },
        Box::new(ui_a.clone()),
    );
    a.join_server(&main_addr.to_string(), "guest", "pw").await.expect("join a");
    pump_until(&mut a, |c| c.user_access.is_some()).await;

    let ui_b = RecordingUi::default();
    let mut b = Client::new(
        ClientPrefs { username: "bob".into(), icon_id: 2 },
        Box::new(ui_b.clone()),
    );
    b.join_server(&main_addr.to_string(), "guest", "pw").await.expect("join b");
    pump_until(&mut b, |c| c.user_access.is_some()).await;

    a.send_chat("hai").await.expect("send chat");

    // Both senders and receivers hold read-chat, so both see the line.
    pump_until(&mut b, |_| !ui_b.chat.lock().unwrap().is_empty()).await;
    let lines = ui_b.chat.lock().unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("alice"));
    assert!(lines[0].ends_with(":  hai"));
}

#[tokio::test]
async fn test_transfer_download_and_one_shot_refnum() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("testfile.txt"), vec![b'x'; 23]).expect("write");
    let root = dir.path().to_path_buf();

    let (server, _main, transfer_addr, _shutdown) = start_server(move |state| {
        state.config.file_root = root.clone();
        // A transfer registered by a handler on behalf of session 1.
        let account = Account::new("guest", "Guest", "", AccessBitmap::all()).expect("account");
        state
            .clients
            .insert(1, ClientSession::new(1, "127.0.0.1:9".into(), account));
    })
    .await;

    let refnum = {
        let mut state = server.lock();
        let path = state.config.file_root.join("testfile.txt");
        state
            .register_transfer(1, TransferKind::FileDownload, path, 23, 0, vec![])
            .expect("register")
    };

    // Redeem the reservation on the side channel.
    let mut socket = TcpStream::connect(transfer_addr).await.expect("connect");
    let handshake = TransferHandshake { refnum, data_size: 0 };
    socket.write_all(&handshake.to_bytes()).await.expect("write");

    let mut blob = Vec::new();
    socket.read_to_end(&mut blob).await.expect("read");
    assert_eq!(blob.len() as u64, flattened_size(23, "testfile.txt".len(), 0));

    // Walk the flattened structure.
    let header = FlattenHeader::from_bytes(&blob).expect("header");
    assert_eq!(header.fork_count, 2);
    let info_header = ForkHeader::from_bytes(&blob[24..]).expect("info header");
    assert_eq!(&info_header.fork_type, b"INFO");
    let info =
        InfoFork::from_bytes(&blob[40..40 + info_header.data_size as usize]).expect("info fork");
    assert_eq!(info.name, b"testfile.txt");
    assert_eq!(&info.type_code, b"TEXT");
    let data_off = 40 + info_header.data_size as usize;
    let data_header = ForkHeader::from_bytes(&blob[data_off..]).expect("data header");
    assert_eq!(&data_header.fork_type, b"DATA");
    assert_eq!(data_header.data_size, 23);
    assert_eq!(&blob[data_off + 16..], &vec![b'x'; 23][..]);

    // A second presentation of the same refnum is rejected: the server
    // closes without sending anything.
    let mut socket = TcpStream::connect(transfer_addr).await.expect("connect");
    socket.write_all(&handshake.to_bytes()).await.expect("write");
    let mut again = Vec::new();
    socket.read_to_end(&mut again).await.expect("read");
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_disconnect_notifies_peers() {
    let (_server, main_addr, _xfer, _shutdown) = start_server(|_| {}).await;

    let ui_a = RecordingUi::default();
    let mut a = Client::new(
        ClientPrefs { username: "alice".into(), icon_id: 1 },
        Box::new(ui_a),
    );
    a.join_server(&main_addr.to_string(), "guest", "pw").await.expect("join a");
    pump_until(&mut a, |c| c.user_access.is_some()).await;

    let ui_b = RecordingUi::default();
    let mut b = Client::new(
        ClientPrefs { username: "bob".into(), icon_id: 2 },
        Box::new(ui_b),
    );
    b.join_server(&main_addr.to_string(), "guest", "pw").await.expect("join b");
    pump_until(&mut b, |c| c.user_access.is_some()).await;

    // A learns about B through the change notification.
    pump_until(&mut a, |c| c.user_list.iter().any(|u| u.name == b"bob")).await;

    drop(b);
    pump_until(&mut a, |c| !c.user_list.iter().any(|u| u.name == b"bob")).await;
}
