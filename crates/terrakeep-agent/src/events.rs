//! Classification of server console lines.
//!
//! Matching is pure: a line goes in, a [`GameEvent`] with its captured fields
//! comes out. Side effects live in [`crate::dispatch`].

use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Line printed once the server accepts console commands.
pub const READY_SENTINEL: &str = "Server started";

const IPV4: &str = r"[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}";
const PORT: &str = r"[0-9]{1,5}";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connection,
    PlayerJoin,
    PlayerLeft,
    PlayerIdentify,
    PlayerChat,
    PlayerBoot,
    PlayerBan,
    ServerTime,
    ServerSeed,
    ServerMotd,
    ServerPassword,
    ServerVersion,
    Unclassified,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connection => "connecting",
            Self::PlayerJoin => "player-join",
            Self::PlayerLeft => "player-left",
            Self::PlayerIdentify => "player-identify",
            Self::PlayerChat => "player-chat",
            Self::PlayerBoot => "player-boot",
            Self::PlayerBan => "player-ban",
            Self::ServerTime => "server-time",
            Self::ServerSeed => "server-seed",
            Self::ServerMotd => "server-motd",
            Self::ServerPassword => "server-password",
            Self::ServerVersion => "server-version",
            Self::Unclassified => "catch-all",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameEvent {
    Connection { ip: String },
    PlayerJoined { name: String },
    PlayerLeft { name: String },
    PlayerIdentified { name: String, ip: String },
    PlayerChat { author: String, text: String },
    PlayerBooted { ip: String, reason: String },
    PlayerBanned { ip: String, reason: String },
    ServerTime { time: String, meridiem: String },
    ServerSeed(String),
    ServerMotd(String),
    ServerPassword(String),
    ServerVersion(String),
    Unclassified,
}

impl GameEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connection { .. } => EventKind::Connection,
            Self::PlayerJoined { .. } => EventKind::PlayerJoin,
            Self::PlayerLeft { .. } => EventKind::PlayerLeft,
            Self::PlayerIdentified { .. } => EventKind::PlayerIdentify,
            Self::PlayerChat { .. } => EventKind::PlayerChat,
            Self::PlayerBooted { .. } => EventKind::PlayerBoot,
            Self::PlayerBanned { .. } => EventKind::PlayerBan,
            Self::ServerTime { .. } => EventKind::ServerTime,
            Self::ServerSeed(_) => EventKind::ServerSeed,
            Self::ServerMotd(_) => EventKind::ServerMotd,
            Self::ServerPassword(_) => EventKind::ServerPassword,
            Self::ServerVersion(_) => EventKind::ServerVersion,
            Self::Unclassified => EventKind::Unclassified,
        }
    }
}

struct EventPattern {
    kind: EventKind,
    re: Regex,
}

fn compile(pattern: &str) -> Regex {
    // Patterns are compile-time constants; a failure here is a programming error.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid event pattern {pattern:?}: {e}"))
}

/// Ordered pattern table. First match wins; the trailing catch-all matches
/// anything.
fn patterns() -> &'static [EventPattern] {
    static TABLE: OnceLock<Vec<EventPattern>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let table = [
            (
                EventKind::Connection,
                format!(r"^({IPV4}):{PORT} is connecting\.\.\.$"),
            ),
            (EventKind::PlayerJoin, r"^(.{1,20}) has joined\.$".to_string()),
            (EventKind::PlayerLeft, r"^(.{1,20}) has left\.$".to_string()),
            (
                EventKind::PlayerIdentify,
                format!(r"^(.{{1,20}}) \(({IPV4}):{PORT}\)$"),
            ),
            (EventKind::PlayerChat, r"^<(.{1,20})> (.*)$".to_string()),
            (
                EventKind::PlayerBoot,
                format!(r"^({IPV4}):{PORT} was booted: (.*)$"),
            ),
            (
                EventKind::PlayerBan,
                format!(r"^({IPV4}):{PORT} was banned: (.*)$"),
            ),
            (
                EventKind::ServerTime,
                r"^Time: ([0-9]{1,2}:[0-9]{2}) ?([AP]M)$".to_string(),
            ),
            (EventKind::ServerSeed, r"^World Seed: (.*)$".to_string()),
            (EventKind::ServerMotd, r"^MOTD: (.*)$".to_string()),
            (EventKind::ServerPassword, r"^Password: (.*)$".to_string()),
            (EventKind::ServerVersion, r"^Terraria Server v(.*)$".to_string()),
            (EventKind::Unclassified, r"(?s).*".to_string()),
        ];
        table
            .into_iter()
            .map(|(kind, p)| EventPattern {
                kind,
                re: compile(&p),
            })
            .collect()
    })
}

fn cap(caps: &Captures<'_>, i: usize) -> String {
    let m = caps.get(i);
    debug_assert!(m.is_some(), "pattern is missing capture group {i}");
    m.map(|m| m.as_str().to_string()).unwrap_or_default()
}

/// Strips the `": "` prompt the server prints in front of console output.
pub fn normalize_line(line: &str) -> &str {
    let line = line.trim_end_matches(['\r', '\n']);
    line.strip_prefix(": ").unwrap_or(line)
}

pub fn is_ready_sentinel(line: &str) -> bool {
    normalize_line(line) == READY_SENTINEL
}

/// Classifies one (already normalized) console line.
pub fn classify(line: &str) -> GameEvent {
    for p in patterns() {
        let Some(c) = p.re.captures(line) else {
            continue;
        };
        return match p.kind {
            EventKind::Connection => GameEvent::Connection { ip: cap(&c, 1) },
            EventKind::PlayerJoin => GameEvent::PlayerJoined { name: cap(&c, 1) },
            EventKind::PlayerLeft => GameEvent::PlayerLeft { name: cap(&c, 1) },
            EventKind::PlayerIdentify => GameEvent::PlayerIdentified {
                name: cap(&c, 1),
                ip: cap(&c, 2),
            },
            EventKind::PlayerChat => GameEvent::PlayerChat {
                author: cap(&c, 1),
                text: cap(&c, 2),
            },
            EventKind::PlayerBoot => GameEvent::PlayerBooted {
                ip: cap(&c, 1),
                reason: cap(&c, 2),
            },
            EventKind::PlayerBan => GameEvent::PlayerBanned {
                ip: cap(&c, 1),
                reason: cap(&c, 2),
            },
            EventKind::ServerTime => GameEvent::ServerTime {
                time: cap(&c, 1),
                meridiem: cap(&c, 2),
            },
            EventKind::ServerSeed => GameEvent::ServerSeed(cap(&c, 1)),
            EventKind::ServerMotd => GameEvent::ServerMotd(cap(&c, 1)),
            EventKind::ServerPassword => GameEvent::ServerPassword(cap(&c, 1)),
            EventKind::ServerVersion => GameEvent::ServerVersion(cap(&c, 1)),
            EventKind::Unclassified => GameEvent::Unclassified,
        };
    }
    GameEvent::Unclassified
}

/// Names that could be mistaken for protocol framing or a privileged role.
/// Reserved words are matched as a prefix, so `Administrator` is rejected
/// while `Badminton` is not.
pub fn is_illegal_name(name: &str) -> bool {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    let res = RE.get_or_init(|| {
        vec![
            compile(r"^\s|\s$"),
            compile(r"^[<>\[\]()|]|[<>\[\]()|]$"),
            compile(r"(?i)^(?:superadmin|admin|system|server)"),
        ]
    });
    name.is_empty() || res.iter().any(|re| re.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_captures_ip_without_port() {
        assert_eq!(
            classify("123.45.67.8:7777 is connecting..."),
            GameEvent::Connection {
                ip: "123.45.67.8".to_string()
            }
        );
    }

    #[test]
    fn join_and_identify() {
        assert_eq!(
            classify("Steve has joined."),
            GameEvent::PlayerJoined {
                name: "Steve".to_string()
            }
        );
        assert_eq!(
            classify("Steve (123.45.67.8:7777)"),
            GameEvent::PlayerIdentified {
                name: "Steve".to_string(),
                ip: "123.45.67.8".to_string()
            }
        );
        assert_eq!(
            classify("Steve has left."),
            GameEvent::PlayerLeft {
                name: "Steve".to_string()
            }
        );
    }

    #[test]
    fn names_longer_than_twenty_chars_are_not_players() {
        let line = format!("{} has joined.", "x".repeat(21));
        assert_eq!(classify(&line), GameEvent::Unclassified);
    }

    #[test]
    fn chat_keeps_full_text() {
        assert_eq!(
            classify("<Alex> hello: world"),
            GameEvent::PlayerChat {
                author: "Alex".to_string(),
                text: "hello: world".to_string()
            }
        );
    }

    #[test]
    fn boot_and_ban_capture_reason() {
        assert_eq!(
            classify("10.0.0.2:51234 was booted: Invalid operation at this state."),
            GameEvent::PlayerBooted {
                ip: "10.0.0.2".to_string(),
                reason: "Invalid operation at this state.".to_string()
            }
        );
        assert_eq!(
            classify("10.0.0.2:51234 was banned: griefing").kind(),
            EventKind::PlayerBan
        );
    }

    #[test]
    fn server_announcements() {
        assert_eq!(
            classify("World Seed: 0.2.1234"),
            GameEvent::ServerSeed("0.2.1234".to_string())
        );
        assert_eq!(
            classify("Terraria Server v1.4.4.9"),
            GameEvent::ServerVersion("1.4.4.9".to_string())
        );
        assert_eq!(
            classify("Password: 123123"),
            GameEvent::ServerPassword("123123".to_string())
        );
        assert_eq!(
            classify("MOTD: be nice"),
            GameEvent::ServerMotd("be nice".to_string())
        );
        assert_eq!(
            classify("Time: 4:30AM"),
            GameEvent::ServerTime {
                time: "4:30".to_string(),
                meridiem: "AM".to_string()
            }
        );
    }

    #[test]
    fn everything_else_is_unclassified() {
        for line in ["", "Saving world data: 12%", "Resetting game objects 50%"] {
            assert_eq!(classify(line), GameEvent::Unclassified, "{line:?}");
        }
    }

    #[test]
    fn sentinel_ignores_prompt_prefix() {
        assert!(is_ready_sentinel("Server started"));
        assert!(is_ready_sentinel(": Server started"));
        assert!(is_ready_sentinel(": Server started\r"));
        assert!(!is_ready_sentinel("Server started!"));
        assert_eq!(normalize_line(": : x"), ": x");
    }

    #[test]
    fn illegal_names() {
        for name in [
            "Admin",
            "ADMIN",
            "Administrator",
            "ServerAdmin",
            "Admin2",
            "SystemBot",
            "admin_",
            "System",
            "server",
            "SuperAdmin",
            "<Steve",
            "Steve>",
            "[mod]",
            "|pipe",
            " ",
            "Steve ",
            "",
        ] {
            assert!(is_illegal_name(name), "{name:?} should be illegal");
        }
        for name in ["Steve", "Badminton", "Servant", "Al(ex", "the admin"] {
            assert!(!is_illegal_name(name), "{name:?} should be allowed");
        }
    }
}
