//! TCP Chat Client - terminal front-end
//!
//! Joins a chat server and prints the transcript to stdout. Lines typed on
//! stdin are broadcast; `/msg <user> <text>` sends privately, `/users`
//! refreshes the user list and `/quit` leaves.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use tcp_chat::{Connection, ConnectionEvent, Message, MessageKind, DEFAULT_PORT};

/// Terminal chat client
#[derive(Debug, Parser)]
#[command(name = "tcp_chat_client", version, about = "Terminal client for the TCP chat server")]
struct Args {
    /// Name to join as
    username: String,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

/// One line of user input
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Say(String),
    Private { to: String, body: String },
    Users,
    Quit,
    Empty,
    Invalid(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Say(line.to_string());
    };

    let mut parts = command.splitn(3, char::is_whitespace);
    match parts.next().unwrap_or_default() {
        "quit" | "exit" => Input::Quit,
        "users" => Input::Users,
        "msg" => match (parts.next(), parts.next().map(str::trim)) {
            (Some(to), Some(body)) if !to.is_empty() && !body.is_empty() => Input::Private {
                to: to.to_string(),
                body: body.to_string(),
            },
            _ => Input::Invalid("usage: /msg <user> <text>".to_string()),
        },
        other => Input::Invalid(format!("unknown command: /{}", other)),
    }
}

/// Users to show as online, without the local user
fn online_users(message: &Message, me: &str) -> Option<Vec<String>> {
    let users = message.user_names().ok()?;
    Some(
        users
            .into_iter()
            .filter(|u| !u.trim().is_empty() && u != me)
            .collect(),
    )
}

fn render(event: ConnectionEvent, me: &str) {
    match event {
        ConnectionEvent::MessageReceived(message) if message.kind == MessageKind::UserList => {
            match online_users(&message, me) {
                Some(users) => println!("Online users ({}): {}", users.len(), users.join(", ")),
                None => println!("{}", Message::system("Error updating user list").display_text()),
            }
        }
        ConnectionEvent::MessageReceived(message) => println!("{}", message.display_text()),
        ConnectionEvent::StatusChanged(true) => println!("Connected"),
        ConnectionEvent::StatusChanged(false) => println!("Disconnected from server"),
        ConnectionEvent::ErrorOccurred(e) => eprintln!("error: {}", e),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ConnectionEvent>, me: String) {
    while let Some(event) = events.recv().await {
        render(event, &me);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr, stdout is the transcript
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcp_chat=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let me = args.username.trim().to_string();

    let (conn, events) = Connection::new();
    let printer = tokio::spawn(print_events(events, me.clone()));

    conn.connect(&args.host, args.port).await?;
    conn.join(&me).await?;
    conn.request_user_list(&me).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        if !conn.is_connected() {
            break;
        }
        let result = match parse_input(&line) {
            Input::Say(body) => conn.send_broadcast(&me, &body).await,
            Input::Private { to, body } => conn.send_private(&me, &to, &body).await,
            Input::Users => conn.request_user_list(&me).await,
            Input::Quit => break,
            Input::Empty => Ok(()),
            Input::Invalid(hint) => {
                eprintln!("{}", hint);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Send failed: {}", e);
        }
    }

    if conn.is_connected() {
        if let Err(e) = conn.leave(&me).await {
            debug!("Could not send leave: {}", e);
        }
    }
    conn.disconnect().await;

    // The event channel closes once every handle to the connection is gone
    drop(conn);
    let _ = printer.await;

    Ok(())
}
