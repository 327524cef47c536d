//! Inbound command surfaces: bus command paths and the peer text grammar

use rb_core::{parse_literal, Value};
use tracing::warn;

/// A command addressed by bus path segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `[]`: report the current state
    ReportState,
    /// `["restart"]`: reload rules and re-enter the initial state
    Restart,
    /// `[name]`: a device name, or a single-key kind
    SetNamed(String),
    /// `[kind, key]`
    Set { kind: String, key: String },
}

impl Command {
    /// Interpret path segments; `None` for paths longer than two segments
    pub fn parse<S: AsRef<str>>(path: &[S]) -> Option<Self> {
        match path {
            [] => Some(Command::ReportState),
            [single] if single.as_ref() == "restart" => Some(Command::Restart),
            [single] => Some(Command::SetNamed(single.as_ref().to_string())),
            [kind, key] => Some(Command::Set {
                kind: kind.as_ref().to_string(),
                key: key.as_ref().to_string(),
            }),
            _ => None,
        }
    }
}

/// One `;`-separated command from a peer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// `action,<name>,<value>`: run an action now, evaluated
    Action { name: String, value: String },
    /// `transit,<state>`
    Transit(String),
    /// `<any>,<key>,<value>`: set a peer state slot
    State { key: String, value: Value },
}

/// A message received from the peer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Connected,
    Disconnected,
    Identified(String),
    Pull,
    Commands(Vec<PeerCommand>),
}

const LEGACY_PREFIXES: &[&str] = &["BT:", "TBC:"];

impl PeerMessage {
    pub fn parse(text: &str) -> Self {
        let mut text = text.trim();
        for prefix in LEGACY_PREFIXES {
            if let Some(rest) = text.strip_prefix(prefix) {
                text = rest.trim();
            }
        }

        match text {
            "CONNECTED" => return PeerMessage::Connected,
            "DISCONNECTED" => return PeerMessage::Disconnected,
            "PULL" => return PeerMessage::Pull,
            _ => {}
        }
        if let Some(id) = text.strip_prefix("IDD:") {
            return PeerMessage::Identified(id.trim().to_string());
        }

        let commands = text
            .split([';', '\n'])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(parse_peer_command)
            .collect();
        PeerMessage::Commands(commands)
    }
}

fn parse_peer_command(text: &str) -> Option<PeerCommand> {
    let parts: Vec<&str> = text.splitn(3, ',').map(str::trim).collect();
    match parts.as_slice() {
        ["action", name, value] => Some(PeerCommand::Action {
            name: name.to_string(),
            value: value.to_string(),
        }),
        ["transit", state] | ["transit", state, _] => Some(PeerCommand::Transit(state.to_string())),
        [_, key, value] => Some(PeerCommand::State {
            key: key.to_string(),
            value: parse_literal(value),
        }),
        _ => {
            warn!(command = text, "Unrecognised peer command");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_paths() {
        let empty: [&str; 0] = [];
        assert_eq!(Command::parse(&empty), Some(Command::ReportState));
        assert_eq!(Command::parse(&["restart"]), Some(Command::Restart));
        assert_eq!(
            Command::parse(&["motor"]),
            Some(Command::SetNamed("motor".into()))
        );
        assert_eq!(
            Command::parse(&["mcp23017", "3"]),
            Some(Command::Set {
                kind: "mcp23017".into(),
                key: "3".into()
            })
        );
        assert_eq!(Command::parse(&["a", "b", "c"]), None);
    }

    #[test]
    fn test_peer_status_messages() {
        assert_eq!(PeerMessage::parse("CONNECTED"), PeerMessage::Connected);
        assert_eq!(PeerMessage::parse("BT:DISCONNECTED"), PeerMessage::Disconnected);
        assert_eq!(
            PeerMessage::parse("TBC:IDD:phone-7"),
            PeerMessage::Identified("phone-7".into())
        );
        assert_eq!(PeerMessage::parse("PULL\n"), PeerMessage::Pull);
    }

    #[test]
    fn test_peer_commands() {
        let message = PeerMessage::parse("action,greet,{{ 1 + 1 }};transit,busy;state,speed,4;junk");
        assert_eq!(
            message,
            PeerMessage::Commands(vec![
                PeerCommand::Action {
                    name: "greet".into(),
                    value: "{{ 1 + 1 }}".into()
                },
                PeerCommand::Transit("busy".into()),
                PeerCommand::State {
                    key: "speed".into(),
                    value: Value::Int(4)
                },
            ])
        );
    }
}
