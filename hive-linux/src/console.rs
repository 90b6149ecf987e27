//! Line-oriented console: stdin commands drive the selector, a watcher prints status
//! changes and incoming messages.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use hive_core::{ChatMessage, NetworkMode, PeerId, TransportSelector};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Discover,
    Stop,
    Peers,
    Send { prefix: String, text: String },
    Read { prefix: String },
    Mode(NetworkMode),
    Status,
    Help,
    Quit,
}

const HELP: &str = "\
commands:
  /discover                 look for peers
  /stop                     stop looking
  /peers                    list known peers
  /send <peer> <text>       send a message (peer = id prefix)
  /read <peer>              show a conversation and mark it read
  /mode broadcast|direct    switch transport
  /status                   show connection status
  /quit                     exit";

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "/discover" => Ok(Command::Discover),
        "/stop" => Ok(Command::Stop),
        "/peers" => Ok(Command::Peers),
        "/status" => Ok(Command::Status),
        "/help" => Ok(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/send" => {
            let (prefix, text) = rest.split_once(char::is_whitespace).ok_or("usage: /send <peer> <text>")?;
            let text = text.trim();
            if text.is_empty() {
                return Err("usage: /send <peer> <text>".into());
            }
            Ok(Command::Send {
                prefix: prefix.to_string(),
                text: text.to_string(),
            })
        }
        "/read" if !rest.is_empty() => Ok(Command::Read {
            prefix: rest.to_string(),
        }),
        "/read" => Err("usage: /read <peer>".into()),
        "/mode" => match rest {
            "broadcast" => Ok(Command::Mode(NetworkMode::Primary)),
            "direct" => Ok(Command::Mode(NetworkMode::Secondary)),
            _ => Err("usage: /mode broadcast|direct".into()),
        },
        "" => Err(String::new()),
        other => Err(format!("unknown command {other}; try /help")),
    }
}

/// Find the single peer whose id starts with `prefix`, among visible peers and
/// existing conversations.
fn resolve(selector: &TransportSelector, prefix: &str) -> Result<PeerId, String> {
    let mut ids: BTreeSet<PeerId> = selector.peers().iter().map(|p| p.id.clone()).collect();
    ids.extend(selector.subscribe().messages.borrow().keys().cloned());
    let matches: Vec<_> = ids.into_iter().filter(|id| id.as_str().starts_with(prefix)).collect();
    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => Err(format!("no peer matches {prefix}")),
        _ => Err(format!("{prefix} is ambiguous ({} peers)", matches.len())),
    }
}

fn print_message(m: &ChatMessage) {
    let who = if m.is_local { "me" } else { m.sender_name.as_str() };
    println!("  [{}] {}: {}", m.timestamp_ms, who, m.text);
}

/// Run one command. Returns false when the console should exit.
pub async fn execute(selector: &TransportSelector, command: Command) -> bool {
    match command {
        Command::Discover => {
            if let Err(e) = selector.start_discovery() {
                println!("cannot discover: {e}");
            }
        }
        Command::Stop => selector.stop_discovery(),
        Command::Peers => {
            let peers = selector.peers();
            if peers.is_empty() {
                println!("no peers");
            }
            for p in peers.iter() {
                let unread = selector.unread_for(&p.id);
                println!("  {}  {}  {}:{}  unread {}", p.id, p.name, p.address, p.port, unread);
            }
        }
        Command::Send { prefix, text } => match resolve(selector, &prefix) {
            Ok(peer) => {
                if let Err(e) = selector.send_message(&peer, &text).await {
                    println!("send failed: {e}");
                }
            }
            Err(e) => println!("{e}"),
        },
        Command::Read { prefix } => match resolve(selector, &prefix) {
            Ok(peer) => {
                for m in selector.messages_for(&peer).iter() {
                    print_message(m);
                }
                selector.clear_unread(&peer);
            }
            Err(e) => println!("{e}"),
        },
        Command::Mode(mode) => {
            if let Err(e) = selector.switch_transport(mode).await {
                println!("cannot switch: {e}");
            }
        }
        Command::Status => {
            println!("{} ({:?} mode)", selector.status(), selector.mode());
            if selector.is_network_restricted() {
                println!("every message port is blocked; try /mode direct");
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return false,
    }
    true
}

/// Why the console loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The user asked to quit.
    Quit,
    /// Input ran out; the daemon keeps running.
    Eof,
}

/// Read commands from stdin until /quit or EOF.
pub async fn run(selector: Arc<TransportSelector>) -> anyhow::Result<Exit> {
    println!("{HELP}");
    run_from(&selector, BufReader::new(tokio::io::stdin())).await
}

async fn run_from<R: AsyncBufRead + Unpin>(selector: &TransportSelector, reader: R) -> anyhow::Result<Exit> {
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        match parse(&line) {
            Ok(cmd) => {
                if !execute(selector, cmd).await {
                    debug!("console quit");
                    return Ok(Exit::Quit);
                }
            }
            Err(e) if e.is_empty() => {}
            Err(e) => println!("{e}"),
        }
    }
    debug!("console input closed");
    Ok(Exit::Eof)
}

/// Print status changes and messages from other peers as they arrive.
pub fn spawn_watcher(selector: &TransportSelector) -> JoinHandle<()> {
    let mut state = selector.subscribe();
    tokio::spawn(async move {
        let mut seen: HashMap<PeerId, usize> = state
            .messages
            .borrow_and_update()
            .iter()
            .map(|(id, log)| (id.clone(), log.len()))
            .collect();
        loop {
            tokio::select! {
                Ok(()) = state.connection_status.changed() => {
                    println!("* {}", state.connection_status.borrow_and_update().as_str());
                }
                Ok(()) = state.mode.changed() => {
                    println!("* mode: {:?}", *state.mode.borrow_and_update());
                }
                Ok(()) = state.messages.changed() => {
                    let all = state.messages.borrow_and_update().clone();
                    for (peer, log) in all.iter() {
                        let from = seen.get(peer).copied().unwrap_or(0).min(log.len());
                        for m in log[from..].iter().filter(|m| !m.is_local) {
                            println!("<{}> {}", m.sender_name, m.text);
                        }
                        seen.insert(peer.clone(), log.len());
                    }
                }
                else => break,
            }
        }
    })
}
