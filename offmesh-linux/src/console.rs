//! Interactive console: slash commands drive the manager, any other line goes to the live session.

use std::future::Future;

use offmesh_core::{
    ConnectionEvent, ConnectionManager, ManagerStatus, Origin, PeerAddress, TcpTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::discovery::{DiscoveredPeer, Discovery};

const HELP: &str = "\
/peers             list discovered peers
/scan              resume discovery
/connect <addr|n>  dial an address or the n-th listed peer
/listen            wait for an inbound connection
/status            show listener, connector and session
/stop              close everything
/quit              exit
anything else is sent to the connected peer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 1-based position in the /peers list.
    Index(usize),
    Addr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Scan,
    Connect(Target),
    Listen,
    Status,
    Stop,
    Quit,
    Help,
    Send(String),
    /// Not understood; carries the message to show.
    Invalid(String),
}

/// Parse one input line. Blank lines yield nothing.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_owned()));
    };
    let mut parts = rest.split_whitespace();
    let cmd = match (parts.next().unwrap_or(""), parts.next()) {
        ("peers", None) => Command::Peers,
        ("scan", None) => Command::Scan,
        ("connect", Some(arg)) => match arg.parse::<usize>() {
            Ok(n) => Command::Connect(Target::Index(n)),
            Err(_) => Command::Connect(Target::Addr(arg.to_owned())),
        },
        ("connect", None) => Command::Invalid("usage: /connect <addr|n>".to_owned()),
        ("listen", None) => Command::Listen,
        ("status", None) => Command::Status,
        ("stop", None) => Command::Stop,
        ("quit" | "exit", None) => Command::Quit,
        ("help", _) => Command::Help,
        (name @ ("peers" | "scan" | "listen" | "status" | "stop" | "quit" | "exit"), Some(_)) => {
            Command::Invalid(format!("/{name} takes no arguments"))
        }
        (other, _) => Command::Invalid(format!("unknown command /{other}; try /help")),
    };
    if parts.next().is_some() && !matches!(cmd, Command::Help | Command::Invalid(_)) {
        return Some(Command::Invalid(format!("too many arguments to /{}", rest.trim())));
    }
    Some(cmd)
}

fn origin_label(origin: Origin) -> &'static str {
    match origin {
        Origin::Inbound => "inbound",
        Origin::Outbound => "outbound",
    }
}

pub fn render_event(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::DataReceived { payload, .. } => {
            format!("< {}", String::from_utf8_lossy(payload).trim_end())
        }
        ConnectionEvent::DataSent { payload } => {
            format!("> {}", String::from_utf8_lossy(payload).trim_end())
        }
        ConnectionEvent::Connected { origin, peer } => {
            format!("* connected to {peer} ({})", origin_label(*origin))
        }
        ConnectionEvent::ConnectionFailed { origin, reason } => {
            format!("! {} connection failed: {reason}", origin_label(*origin))
        }
        ConnectionEvent::Disconnected { peer, reason } => {
            format!("* disconnected from {peer}: {reason}")
        }
    }
}

pub fn render_status(status: &ManagerStatus) -> String {
    let listener = match status.listener {
        Some(state) => format!("{state:?}"),
        None => "none".to_owned(),
    };
    let connector = match &status.connector {
        Some((peer, state)) => format!("{state:?} ({peer})"),
        None => "none".to_owned(),
    };
    let session = match &status.session {
        Some(s) => format!(
            "{} {} ({}, {:?})",
            s.id,
            s.peer,
            origin_label(s.origin),
            s.state
        ),
        None => "none".to_owned(),
    };
    format!("listener: {listener}\nconnector: {connector}\nsession: {session}")
}

fn resolve_target(target: Target, peers: &[DiscoveredPeer]) -> Result<PeerAddress, String> {
    match target {
        Target::Addr(addr) => Ok(PeerAddress::new(addr)),
        Target::Index(n) => n
            .checked_sub(1)
            .and_then(|i| peers.get(i))
            .map(|p| PeerAddress::from(p.addr))
            .ok_or_else(|| format!("no peer #{n}; see /peers")),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct Console<'a> {
    manager: &'a ConnectionManager<TcpTransport>,
    discovery: Option<&'a Discovery>,
}

impl Console<'_> {
    async fn peers(&self) -> Vec<DiscoveredPeer> {
        match self.discovery {
            Some(d) => d.peers().await,
            None => Vec::new(),
        }
    }

    async fn handle(&self, cmd: Command) -> Flow {
        match cmd {
            Command::Peers => {
                if self.discovery.is_none() {
                    println!("discovery is off");
                }
                let peers = self.peers().await;
                if peers.is_empty() {
                    println!("no peers yet");
                }
                for (i, p) in peers.iter().enumerate() {
                    println!("{:>3}. {} [{}] {}", i + 1, p.name, p.device_id, p.addr);
                }
            }
            Command::Scan => match self.discovery {
                Some(d) => {
                    d.resume();
                    println!("scanning");
                }
                None => println!("discovery is off"),
            },
            Command::Connect(target) => match resolve_target(target, &self.peers().await) {
                Ok(peer) => {
                    println!("dialing {peer}");
                    self.manager.connect(peer);
                }
                Err(msg) => println!("{msg}"),
            },
            Command::Listen => {
                self.manager.start();
                println!(
                    "waiting for a caller on port {}",
                    self.manager.transport().bind_addr().port()
                );
            }
            Command::Status => println!("{}", render_status(&self.manager.status())),
            Command::Stop => {
                self.manager.stop();
                if let Some(d) = self.discovery {
                    d.resume();
                }
                println!("stopped");
            }
            Command::Quit => return Flow::Quit,
            Command::Help => println!("{HELP}"),
            Command::Send(text) => {
                if self.manager.is_connected() {
                    self.manager.write(format!("{text}\n").as_bytes()).await;
                } else {
                    println!("not connected; /connect or /listen first");
                }
            }
            Command::Invalid(msg) => println!("{msg}"),
        }
        Flow::Continue
    }

    fn show(&self, event: &ConnectionEvent) {
        if matches!(
            event,
            ConnectionEvent::ConnectionFailed { .. } | ConnectionEvent::Disconnected { .. }
        ) {
            if let Some(d) = self.discovery {
                d.resume();
            }
        }
        println!("{}", render_event(event));
    }
}

/// Read commands from stdin and print events until /quit, end of input or `shutdown` fires.
pub async fn run(
    manager: &ConnectionManager<TcpTransport>,
    discovery: Option<&Discovery>,
    mut events: UnboundedReceiver<ConnectionEvent>,
    shutdown: impl Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let console = Console { manager, discovery };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tokio::pin!(shutdown);
    println!("type /help for commands");
    loop {
        tokio::select! {
            r = &mut shutdown => {
                r?;
                info!("shutdown signal");
                return Ok(());
            }
            Some(event) = events.recv() => console.show(&event),
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("end of input");
                    return Ok(());
                };
                if let Some(cmd) = parse_command(&line) {
                    if console.handle(cmd).await == Flow::Quit {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offmesh_core::{DeviceId, ListenerState, SessionId, SessionInfo, SessionState};

    #[test]
    fn plain_lines_are_sent_verbatim() {
        assert_eq!(
            parse_command("hello there \r\n"),
            Some(Command::Send("hello there ".to_owned()))
        );
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("/peers"), Some(Command::Peers));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(
            parse_command("/connect 2"),
            Some(Command::Connect(Target::Index(2)))
        );
        assert_eq!(
            parse_command("/connect 10.0.0.2:45679"),
            Some(Command::Connect(Target::Addr("10.0.0.2:45679".to_owned())))
        );
        assert!(matches!(parse_command("/connect"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("/listen now"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("/bogus"), Some(Command::Invalid(_))));
    }

    #[tokio::test]
    async fn stop_resumes_paused_discovery() {
        let manager = ConnectionManager::new(TcpTransport::new(([127, 0, 0, 1], 0).into()));
        let discovery = Discovery::new(DeviceId::generate(), "me".to_owned(), 0);
        offmesh_core::DiscoveryControl::cancel_discovery(&discovery);
        assert!(!discovery.is_scanning());

        let console = Console {
            manager: &manager,
            discovery: Some(&discovery),
        };
        assert_eq!(console.handle(Command::Stop).await, Flow::Continue);
        assert!(discovery.is_scanning());
        assert_eq!(console.handle(Command::Quit).await, Flow::Quit);
    }

    #[test]
    fn target_index_is_one_based() {
        let peers = vec![DiscoveredPeer {
            device_id: DeviceId::generate(),
            name: "laptop".to_owned(),
            addr: "10.0.0.2:45679".parse().unwrap(),
        }];
        assert_eq!(
            resolve_target(Target::Index(1), &peers),
            Ok(PeerAddress::new("10.0.0.2:45679"))
        );
        assert!(resolve_target(Target::Index(0), &peers).is_err());
        assert!(resolve_target(Target::Index(2), &peers).is_err());
        assert_eq!(
            resolve_target(Target::Addr("host:1".to_owned()), &[]),
            Ok(PeerAddress::new("host:1"))
        );
    }

    #[test]
    fn events_render_as_text() {
        let received = ConnectionEvent::DataReceived {
            payload: b"hi\n".to_vec(),
            length: 3,
        };
        assert_eq!(render_event(&received), "< hi");
        let lossy = ConnectionEvent::DataReceived {
            payload: vec![0x68, 0xff],
            length: 2,
        };
        assert_eq!(render_event(&lossy), "< h\u{fffd}");
        let failed = ConnectionEvent::ConnectionFailed {
            origin: Origin::Outbound,
            reason: "refused".to_owned(),
        };
        assert_eq!(render_event(&failed), "! outbound connection failed: refused");
    }

    #[test]
    fn status_lists_each_slot() {
        let status = ManagerStatus {
            listener: Some(ListenerState::Listening),
            connector: None,
            session: Some(SessionInfo {
                id: SessionId(3),
                origin: Origin::Inbound,
                peer: PeerAddress::new("10.0.0.9:40000"),
                state: SessionState::Active,
            }),
        };
        assert_eq!(
            render_status(&status),
            "listener: Listening\nconnector: none\nsession: #3 10.0.0.9:40000 (inbound, Active)"
        );
    }
}
