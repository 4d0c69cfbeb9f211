//! Line-oriented Hotline client.
//!
//! Connects, logs in, then prints chat and user-list updates to stdout
//! while reading chat lines from stdin. A thin front end over the
//! client engine; proper terminal UIs can implement `ClientUi` instead.

use anyhow::Result;
use clap::Parser;
use hotline_core::client::{Client, ClientPrefs, ClientUi};
use hotline_core::user::User;
use tracing_subscriber::EnvFilter;

/// Hotline client
#[derive(Parser)]
#[command(name = "hotline-client")]
#[command(author, version, about)]
struct Args {
    /// Server address, host:port
    #[arg(default_value = "127.0.0.1:5500")]
    address: String,

    /// Login name
    #[arg(short, long, default_value = "guest")]
    login: String,

    /// Password
    #[arg(short, long, default_value = "")]
    password: String,

    /// Display name
    #[arg(short, long, default_value = "unnamed")]
    username: String,

    /// Icon ID
    #[arg(long, default_value = "145")]
    icon: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Prints everything to stdout.
struct StdoutUi;

impl ClientUi for StdoutUi {
    fn chat_line(&mut self, line: &str) {
        println!("{}", line.trim_start_matches('\r'));
    }

    fn user_list(&mut self, users: &[User]) {
        let names: Vec<String> =
            users.iter().map(|u| String::from_utf8_lossy(&u.name).into_owned()).collect();
        println!("*** online: {}", names.join(", "));
    }

    fn modal(&mut self, title: &str, body: &str) {
        println!("--- {} ---", title);
        println!("{}", body);
        println!("---");
    }

    fn agreement(&mut self, text: &str) -> bool {
        println!("--- Agreement ---");
        println!("{}", text.replace('\r', "\n"));
        println!("--- (accepted) ---");
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let prefs = ClientPrefs { username: args.username, icon_id: args.icon };
    let mut client = Client::new(prefs, Box::new(StdoutUi));
    client.join_server(&args.address, &args.login, &args.password).await?;
    println!("connected to {}", args.address);

    // Stdin lines become chat; the read loop runs alongside.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(8);
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });

    let chat = client.chat_sender()?;
    let run_fut = client.run();
    tokio::pin!(run_fut);
    loop {
        tokio::select! {
            result = &mut run_fut => {
                result?;
                println!("disconnected");
                return Ok(());
            }
            line = line_rx.recv() => {
                match line {
                    Some(line) if !line.is_empty() => chat.send_chat(&line).await?,
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
        }
    }
}
