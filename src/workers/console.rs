//! Line-oriented console: reads commands from stdin, prints node events.

use std::io::BufRead;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::node::{AppEvent, Direction, Intent, NodeHandle};
use crate::core::session::CloseReason;
use crate::utils::sos::SignalOfStop;

pub const HELP: &str = "\
commands:
  /call <peer>              connect to a peer (strangers are asked first)
  /hangup <peer>            close the session
  /msg <peer> <text>        direct message
  <text>                    message every connected peer
  /send <peer> <path>       send a file
  /post <text>              publish a post
  /unpost <id>              retract a post
  /friend <peer> [name]     add a known peer
  /unfriend <peer>          remove a known peer
  /accept <peer>            accept an incoming call
  /reject <peer>            reject an incoming call
  /renegotiate <peer>       renegotiate a connected session
  /peers                    list online, connected and known peers
  /help                     this text
  /quit                     leave";

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Intent(Intent),
    Help,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command /{0}, try /help")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

fn arg<'a>(rest: &'a str, usage: &'static str) -> Result<&'a str, CommandError> {
    let rest = rest.trim();
    if rest.is_empty() {
        Err(CommandError::Usage(usage))
    } else {
        Ok(rest)
    }
}

/// `<word> <remainder>`, both non-empty.
fn split_arg<'a>(rest: &'a str, usage: &'static str) -> Result<(&'a str, &'a str), CommandError> {
    match arg(rest, usage)?.split_once(char::is_whitespace) {
        Some((head, tail)) if !tail.trim().is_empty() => Ok((head, tail.trim())),
        _ => Err(CommandError::Usage(usage)),
    }
}

pub fn parse_command(line: &str) -> Result<Input, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Intent(Intent::Chat {
            peer_id: None,
            content: line.to_string(),
        }));
    };
    let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    let peer = |usage: &'static str| arg(rest, usage).map(str::to_string);

    let intent = match name {
        "call" => Intent::Call(peer("/call <peer>")?),
        "hangup" => Intent::Hangup(peer("/hangup <peer>")?),
        "msg" => {
            let (peer_id, content) = split_arg(rest, "/msg <peer> <text>")?;
            Intent::Chat {
                peer_id: Some(peer_id.to_string()),
                content: content.to_string(),
            }
        }
        "send" => {
            let (peer_id, path) = split_arg(rest, "/send <peer> <path>")?;
            Intent::SendFile {
                peer_id: peer_id.to_string(),
                path: PathBuf::from(path),
            }
        }
        "post" => Intent::Post(arg(rest, "/post <text>")?.to_string()),
        "unpost" => Intent::Unpost(arg(rest, "/unpost <id>")?.to_string()),
        "friend" => {
            let rest = arg(rest, "/friend <peer> [name]")?;
            let (peer_id, name) = match rest.split_once(char::is_whitespace) {
                Some((peer_id, name)) => (peer_id, Some(name.trim().to_string())),
                None => (rest, None),
            };
            Intent::AddFriend {
                peer_id: peer_id.to_string(),
                name,
            }
        }
        "unfriend" => Intent::RemoveFriend(peer("/unfriend <peer>")?),
        "accept" => Intent::Accept(peer("/accept <peer>")?),
        "reject" => Intent::Reject(peer("/reject <peer>")?),
        "renegotiate" => Intent::Renegotiate(peer("/renegotiate <peer>")?),
        "peers" => Intent::ListPeers,
        "quit" | "exit" => Intent::Quit,
        "help" => return Ok(Input::Help),
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Input::Intent(intent))
}

/// One line of console output for `event`.
pub fn describe(event: &AppEvent) -> String {
    match event {
        AppEvent::LinkReady => "* registered with relay".into(),
        AppEvent::LinkFailed(e) => format!("! {e}; use /call to retry"),
        AppEvent::PeersOnline(peers) => format!("* online: {}", peers.join(", ")),
        AppEvent::PeerOffline(peer) => format!("* {peer} went offline"),
        AppEvent::PeerConnected(peer) => format!("* connected to {peer}"),
        AppEvent::PeerClosed { peer_id, reason } => match reason {
            CloseReason::Local => format!("* session with {peer_id} closed"),
            CloseReason::NotRetried => format!("* lost {peer_id}"),
            CloseReason::Abandoned { attempts } => {
                format!("* gave up on {peer_id} after {attempts} reconnect attempts")
            }
        },
        AppEvent::IncomingCall(peer) => format!("* {peer} is calling: /accept {peer} or /reject {peer}"),
        AppEvent::CallRejected(peer) => format!("* {peer} rejected the call"),
        AppEvent::CallBusy(peer) => format!("* {peer} is busy"),
        AppEvent::Message { message, .. } => format!("<{}> {}", message.sender, message.content),
        AppEvent::PostPublished(post) => format!("* posted [{}] {}", post.id, post.content),
        AppEvent::PostReceived { post, .. } => format!("# {} [{}]: {}", post.sender, post.id, post.content),
        AppEvent::PostDeleted { peer_id, post_id } => format!("# {peer_id} deleted post {post_id}"),
        AppEvent::IncomingFile { peer_id, name, size, .. } => {
            format!("* receiving {name} ({size} bytes) from {peer_id}")
        }
        AppEvent::TransferProgress {
            file_id,
            direction,
            percent,
            ..
        } => {
            let arrow = match direction {
                Direction::Inbound => "<-",
                Direction::Outbound => "->",
            };
            format!("  {arrow} {file_id} {percent}%")
        }
        AppEvent::FileSent { peer_id, file_id } => format!("* sent {file_id} to {peer_id}"),
        AppEvent::FileReceived {
            peer_id, path, size, ..
        } => format!("* saved {} ({size} bytes) from {peer_id}", path.display()),
        AppEvent::TransferFailed { file_id, error, .. } => format!("! transfer {file_id} failed: {error}"),
        AppEvent::TransferAbandoned { peer_id, file_id } => match peer_id {
            Some(peer) => format!("! transfer {file_id} with {peer} interrupted"),
            None => format!("! discarded unfinished transfer {file_id}"),
        },
        AppEvent::Error(e) => format!("! {e}"),
        AppEvent::PeerList {
            online,
            connected,
            friends,
        } => {
            let friends: Vec<String> = friends
                .iter()
                .map(|f| match &f.name {
                    Some(name) => format!("{} ({name})", f.peer_id),
                    None => f.peer_id.clone(),
                })
                .collect();
            format!(
                "online: {}\nconnected: {}\nfriends: {}",
                online.join(", "),
                connected.join(", "),
                friends.join(", ")
            )
        }
    }
}

/// Read stdin on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(event = "console_stdin_error", error = %e, "stdin unreadable");
                    break;
                }
            }
        }
    });
    rx
}

/// Drive the console until `/quit`, cancellation or the node going away.
pub async fn run(node: NodeHandle, mut events: mpsc::UnboundedReceiver<AppEvent>, local: String, sos: SignalOfStop) {
    println!("cybercall peer {local}\n{HELP}");
    let mut lines = spawn_stdin_reader();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = sos.wait() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", describe(&event)),
                None => break,
            },
            line = lines.recv(), if stdin_open => match line {
                Some(line) => match parse_command(&line) {
                    Ok(Input::Intent(intent)) => {
                        let quit = intent == Intent::Quit;
                        if !node.send(intent) || quit {
                            break;
                        }
                    }
                    Ok(Input::Help) => println!("{HELP}"),
                    Ok(Input::Empty) => {}
                    Err(e) => println!("! {e}"),
                },
                None => {
                    debug!(event = "console_stdin_closed", "stdin closed, printing events only");
                    stdin_open = false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CallError;

    fn intent(line: &str) -> Intent {
        match parse_command(line) {
            Ok(Input::Intent(intent)) => intent,
            other => panic!("{line:?} parsed to {other:?}"),
        }
    }

    #[test]
    fn plain_text_is_broadcast_chat() {
        assert_eq!(
            intent("  hello there "),
            Intent::Chat {
                peer_id: None,
                content: "hello there".into()
            }
        );
        assert_eq!(parse_command("   "), Ok(Input::Empty));
    }

    #[test]
    fn parses_peer_commands() {
        assert_eq!(intent("/call bob"), Intent::Call("bob".into()));
        assert_eq!(
            intent("/send bob /tmp/my file.txt"),
            Intent::SendFile {
                peer_id: "bob".into(),
                path: PathBuf::from("/tmp/my file.txt"),
            }
        );
        assert_eq!(
            intent("/msg bob see you"),
            Intent::Chat {
                peer_id: Some("bob".into()),
                content: "see you".into()
            }
        );
        assert_eq!(
            intent("/friend bob Bob the builder"),
            Intent::AddFriend {
                peer_id: "bob".into(),
                name: Some("Bob the builder".into())
            }
        );
        assert_eq!(
            intent("/friend bob"),
            Intent::AddFriend {
                peer_id: "bob".into(),
                name: None
            }
        );
        assert_eq!(intent("/peers"), Intent::ListPeers);
        assert_eq!(intent("/quit"), Intent::Quit);
        assert_eq!(parse_command("/help"), Ok(Input::Help));
    }

    #[test]
    fn reports_usage_and_unknown_commands() {
        assert_eq!(parse_command("/call"), Err(CommandError::Usage("/call <peer>")));
        assert_eq!(parse_command("/send bob"), Err(CommandError::Usage("/send <peer> <path>")));
        assert_eq!(parse_command("/dance"), Err(CommandError::Unknown("dance".into())));
    }

    #[test]
    fn describes_events() {
        assert_eq!(
            describe(&AppEvent::PeerClosed {
                peer_id: "bob".into(),
                reason: CloseReason::Abandoned { attempts: 3 }
            }),
            "* gave up on bob after 3 reconnect attempts"
        );
        assert_eq!(
            describe(&AppEvent::Error(CallError::NotConnected { peer_id: "bob".into() })),
            "! no connected session with bob"
        );
    }
}
