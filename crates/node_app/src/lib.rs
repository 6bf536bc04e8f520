//! Node wiring: configuration, command parsing and console rendering.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use node_mesh::{
    GroupEvent, GroupNode, MembershipView, MulticastConfig, NodeError, NodeSettings, Outcome,
    TieBreak,
};
use node_proto::NodeId;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const PROMPT: &str = "Command (join, leave, list, send <text>, sendto <id> <text>, exit):";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub node: GroupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_join_settle_ms")]
    pub join_settle_ms: u64,
    #[serde(default)]
    pub expected_group_size: Option<usize>,
    #[serde(default)]
    pub tie_break: TieBreak,
}

fn default_join_settle_ms() -> u64 {
    1000
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            join_settle_ms: default_join_settle_ms(),
            expected_group_size: None,
            tie_break: TieBreak::default(),
        }
    }
}

impl NodeConfig {
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            join_settle: Duration::from_millis(self.node.join_settle_ms),
            expected_group_size: self.node.expected_group_size,
            tie_break: self.node.tie_break,
        }
    }
}

/// Read the TOML config at `path`, or fall back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<NodeConfig> {
    if !path.exists() {
        return Ok(NodeConfig::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid command: {0:?}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid peer id: {0:?}")]
    InvalidId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join,
    Leave,
    List,
    Send(String),
    SendTo { target: NodeId, text: String },
    Exit,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match verb {
            "join" if rest.is_empty() => Ok(Self::Join),
            "leave" if rest.is_empty() => Ok(Self::Leave),
            "list" if rest.is_empty() => Ok(Self::List),
            "exit" if rest.is_empty() => Ok(Self::Exit),
            "send" => {
                if rest.trim().is_empty() {
                    return Err(CommandError::Usage("send <text>"));
                }
                Ok(Self::Send(rest.to_string()))
            }
            "sendto" => {
                let (id, text) = rest
                    .trim_start()
                    .split_once(' ')
                    .ok_or(CommandError::Usage("sendto <id> <text>"))?;
                if text.trim().is_empty() {
                    return Err(CommandError::Usage("sendto <id> <text>"));
                }
                let target = id
                    .parse()
                    .map_err(|_| CommandError::InvalidId(id.to_string()))?;
                Ok(Self::SendTo {
                    target,
                    text: text.to_string(),
                })
            }
            _ => Err(CommandError::Unknown(line.to_string())),
        }
    }
}

/// What the prompt should print after a command, and whether to stop.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: Option<String>,
    pub exit: bool,
}

impl Reply {
    fn say(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            exit: false,
        }
    }

    fn silent() -> Self {
        Self::default()
    }
}

pub async fn execute(node: &mut GroupNode, command: Command) -> Reply {
    let id = node.identity().id;
    let result = match command {
        Command::Join => node.join().await.map(|outcome| match outcome {
            Outcome::AlreadyJoined => Reply::say("already in the group"),
            _ => Reply::say(format!("node {id} joined the group")),
        }),
        Command::Leave => node.leave().await.map(|outcome| match outcome {
            Outcome::NotJoined => Reply::say("not in any group"),
            _ => Reply::say(format!("node {id} left the group")),
        }),
        Command::List => {
            let view = node.view().await;
            Ok(Reply::say(render_view(&view)))
        }
        Command::Send(text) => node.send_chat(&text).await.map(sent_reply),
        Command::SendTo { target, text } => {
            node.send_direct(target, &text).await.map(sent_reply)
        }
        Command::Exit => {
            node.shutdown().await;
            return Reply {
                text: Some("shutting down".into()),
                exit: true,
            };
        }
    };

    result.unwrap_or_else(|e| {
        if let NodeError::Transport(_) = e {
            warn!("command failed: {e}");
        }
        Reply::say(format!("error: {e}"))
    })
}

/// Why [`run_prompt`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptEnd {
    Exit,
    EndOfInput,
    Interrupted,
}

/// Run commands read from `lines` until `exit`, the end of input, or until
/// `interrupt` resolves. The node is shut down without LEAVE before returning.
pub async fn run_prompt<F>(
    node: &mut GroupNode,
    lines: &mut mpsc::Receiver<String>,
    interrupt: F,
) -> PromptEnd
where
    F: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let end = loop {
        println!("\n{PROMPT}");
        let line = tokio::select! {
            biased;
            _ = &mut interrupt => None,
            line = lines.recv() => Some(line),
        };
        let Some(line) = line else {
            info!("interrupted");
            break PromptEnd::Interrupted;
        };
        let Some(line) = line else {
            break PromptEnd::EndOfInput;
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(command) => {
                let reply = execute(node, command).await;
                if let Some(text) = reply.text {
                    println!("{text}");
                }
                if reply.exit {
                    break PromptEnd::Exit;
                }
            }
            Err(e) => println!("{e}"),
        }
    };

    node.shutdown().await;
    end
}

fn sent_reply(outcome: Outcome) -> Reply {
    match outcome {
        Outcome::NotJoined => Reply::say("not in any group"),
        _ => Reply::silent(),
    }
}

pub fn render_view(view: &MembershipView) -> String {
    if view.members.is_empty() {
        return "no members found".into();
    }
    let mut out = String::from("members:");
    for (id, priority) in &view.members {
        out.push_str(&format!("\n  (node {id}; priority {priority})"));
    }
    match view.master_priority {
        Some(priority) => {
            out.push_str(&format!("\nmaster: node {} (priority {priority})", view.master))
        }
        None => out.push_str(&format!("\nmaster: node {}", view.master)),
    }
    out
}

pub fn render_event(event: &GroupEvent) -> String {
    match event {
        GroupEvent::PeerJoined { id, priority } => {
            format!("peer {id} joined the group (priority {priority})")
        }
        GroupEvent::PeerLeft { id } => format!("peer {id} left the group"),
        GroupEvent::View(view) => render_view(view),
        GroupEvent::GroupComplete { size } => {
            format!("all {size} expected peers are in the group")
        }
        GroupEvent::Chat { from, text } => format!("[node {from}]: {text}"),
        GroupEvent::Direct { from, text } => format!("[node {from} -> you]: {text}"),
    }
}
