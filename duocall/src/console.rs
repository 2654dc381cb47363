use duocall_lib::negotiation::{AgentEvent, AgentEventSender, LocalCommand};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    task::JoinHandle,
};
use tracing::debug;

pub const HELP: &str = "Commands: camera on|off, mute, unmute, share, unshare, hangup";

pub fn parse_command(line: &str) -> Option<LocalCommand> {
    let words: Vec<_> = line.split_whitespace().collect();
    Some(match words.as_slice() {
        ["camera", "on"] => LocalCommand::SetCamera(true),
        ["camera", "off"] => LocalCommand::SetCamera(false),
        ["mute"] => LocalCommand::SetMuted(true),
        ["unmute"] => LocalCommand::SetMuted(false),
        ["share"] => LocalCommand::SetScreenShare(true),
        ["unshare"] => LocalCommand::SetScreenShare(false),
        ["hangup"] | ["quit"] | ["exit"] => LocalCommand::Hangup,
        _ => return None,
    })
}

/// Reads commands from stdin until EOF or the session goes away.
pub fn spawn_console(events: AgentEventSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let Some(command) = parse_command(&line) else {
                println!("{}", HELP);
                continue;
            };
            if events.send(AgentEvent::Local(command)).is_err() {
                break;
            }
        }
        debug!("console closed");
    })
}
