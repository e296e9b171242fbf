use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use uuid::Uuid;

use peerchat::chat::chat_events::ChatEvent;
use peerchat::config::{ChatConfig, RendezvousConfig};
use peerchat::discovery::rendezvous_server::RendezvousServer;
use peerchat::messaging::peer_id::PeerId;
use peerchat::node::ChatNode;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the rendezvous service
    Rendezvous {
        /// TCP address for registration requests
        #[clap(long, default_value = "127.0.0.1:9000")]
        listen: SocketAddr,
        /// UDP address for pushing address tables to peers
        #[clap(long, default_value = "127.0.0.1:9001")]
        push: SocketAddr,
    },
    /// Runs a chat peer, reading commands from stdin
    Node {
        id: String,
        #[clap(long, default_value = "127.0.0.1:9000")]
        rendezvous: SocketAddr,
        #[clap(long, default_value = "127.0.0.1:0")]
        listen: SocketAddr,
        #[clap(long)]
        backup_dir: Option<PathBuf>,
        /// Delays processing of everything received from a peer, e.g. `--delay bob=3`
        #[clap(long)]
        delay: Vec<String>,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match args.command {
        Command::Rendezvous { listen, push } => {
            let server = RendezvousServer::bind(RendezvousConfig::new(listen, push)).await?;
            server.run().await
        }
        Command::Node { id, rendezvous, listen, backup_dir, delay } => {
            let mut config = ChatConfig::new(PeerId::new(id), listen, rendezvous);
            config.backup_dir = backup_dir;
            for d in delay {
                let (peer, delay) = parse_delay(&d)?;
                config.artificial_delays.insert(peer, delay);
            }
            run_node(config).await
        }
    }
}

fn parse_delay(s: &str) -> anyhow::Result<(PeerId, Duration)> {
    let (peer, seconds) = s.split_once('=')
        .ok_or_else(|| anyhow!("expected <peer>=<seconds>, got {:?}", s))?;
    Ok((PeerId::new(peer), Duration::try_from_secs_f64(seconds.parse()?)?))
}

async fn run_node(config: ChatConfig) -> anyhow::Result<()> {
    let node = Arc::new(ChatNode::start(config).await?);
    info!("type /help for a list of commands");

    let result = select! {
        result = node.run() => result,
        _ = print_events(node.subscribe()) => Ok(()),
        result = read_commands(node.clone()) => result,
    };

    node.shutdown().await?;
    result
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::MessageDelivered { room_id, payload }) => println!("[{}] {}: {}", short(room_id), payload.sender_id(), payload.text()),
            Ok(ChatEvent::RoomCreated { room_id, name }) => println!("* room {} ({}) created", name, short(room_id)),
            Ok(ChatEvent::RoomDeleted { room_id }) => println!("* room {} deleted", short(room_id)),
            Ok(ChatEvent::PeerConnected(peer)) => println!("* {} connected", peer),
            Ok(ChatEvent::PeerDisconnected(peer)) => println!("* {} disconnected", peer),
            Err(RecvError::Lagged(n)) => warn!("skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

fn short(room_id: Uuid) -> String {
    room_id.to_string()[..8].to_string()
}

#[derive(Debug, Eq, PartialEq)]
enum UserCommand {
    Create { name: String, members: Vec<PeerId> },
    Send { room: String, text: String },
    Delay { room: String, seconds: u32, text: String },
    Delete { room: String },
    Rooms,
    History { room: String },
    Peers,
    Help,
    Quit,
}

fn parse_command(line: &str) -> anyhow::Result<UserCommand> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let cmd = match command {
        "/create" => {
            let mut words = rest.split_whitespace();
            let name = words.next().ok_or_else(|| anyhow!("usage: /create <name> <peer>..."))?;
            UserCommand::Create { name: name.to_string(), members: words.map(PeerId::new).collect() }
        }
        "/send" => {
            let (room, text) = rest.split_once(' ').ok_or_else(|| anyhow!("usage: /send <room> <text>"))?;
            UserCommand::Send { room: room.to_string(), text: text.to_string() }
        }
        "/delay" => {
            let mut parts = rest.splitn(3, ' ');
            match (parts.next(), parts.next().map(|s| s.parse::<u32>()), parts.next()) {
                (Some(room), Some(Ok(seconds)), Some(text)) => UserCommand::Delay { room: room.to_string(), seconds, text: text.to_string() },
                _ => bail!("usage: /delay <room> <seconds> <text>"),
            }
        }
        "/delete" if !rest.is_empty() => UserCommand::Delete { room: rest.to_string() },
        "/history" if !rest.is_empty() => UserCommand::History { room: rest.to_string() },
        "/rooms" => UserCommand::Rooms,
        "/peers" => UserCommand::Peers,
        "/help" => UserCommand::Help,
        "/quit" => UserCommand::Quit,
        other => bail!("unknown command {:?} - type /help for a list of commands", other),
    };
    Ok(cmd)
}

/// finds a room by name, full id or id prefix
async fn resolve_room(node: &ChatNode, room: &str) -> anyhow::Result<Uuid> {
    node.rooms().await
        .into_iter()
        .find(|r| r.name == room || r.id.to_string().starts_with(room))
        .map(|r| r.id)
        .ok_or_else(|| anyhow!("no room {:?}", room))
}

async fn read_commands(node: Arc<ChatNode>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(UserCommand::Quit) => break,
            Ok(cmd) => {
                if let Err(e) = execute(&node, cmd).await {
                    println!("error: {}", e);
                }
            }
            Err(e) => println!("{}", e),
        }
    }
    Ok(())
}

async fn execute(node: &ChatNode, cmd: UserCommand) -> anyhow::Result<()> {
    match cmd {
        UserCommand::Create { name, members } => {
            let room_id = node.create_room(&name, members).await?;
            println!("created room {} ({})", name, room_id);
        }
        UserCommand::Send { room, text } => {
            node.send_message(resolve_room(node, &room).await?, &text).await?;
        }
        UserCommand::Delay { room, seconds, text } => {
            node.send_delayed_message(resolve_room(node, &room).await?, &text, seconds).await?;
        }
        UserCommand::Delete { room } => {
            node.delete_room(resolve_room(node, &room).await?).await?;
        }
        UserCommand::Rooms => {
            for room in node.rooms().await {
                let members = room.members.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ");
                println!("{} {} [{}] {} message(s){}", room.id, room.name, members, room.num_delivered, if room.is_closed { " (deleted)" } else { "" });
            }
        }
        UserCommand::History { room } => {
            let room_id = resolve_room(node, &room).await?;
            if let Some(snapshot) = node.room_snapshot(room_id).await {
                for payload in &snapshot.delivered {
                    println!("{:?}", payload);
                }
                if !snapshot.waiting.is_empty() {
                    println!("({} message(s) waiting for earlier messages)", snapshot.waiting.len());
                }
            }
        }
        UserCommand::Peers => {
            for peer in node.peers().await {
                println!("{} {:?} {:?} ({} queued)", peer.id, peer.address, peer.reachability, peer.num_queued);
            }
        }
        UserCommand::Help => {
            println!("/create <name> <peer>...        create a room with the given peers");
            println!("/send <room> <text>             send a message");
            println!("/delay <room> <seconds> <text>  send a message that receivers process after a delay");
            println!("/delete <room>                  delete a room");
            println!("/rooms, /history <room>, /peers, /quit");
        }
        UserCommand::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::create("/create friends bob carol", UserCommand::Create { name: "friends".to_string(), members: vec![PeerId::new("bob"), PeerId::new("carol")] })]
    #[case::send("/send friends hello there", UserCommand::Send { room: "friends".to_string(), text: "hello there".to_string() })]
    #[case::delay("/delay friends 3 slow news", UserCommand::Delay { room: "friends".to_string(), seconds: 3, text: "slow news".to_string() })]
    #[case::delete("/delete friends", UserCommand::Delete { room: "friends".to_string() })]
    #[case::history(" /history friends ", UserCommand::History { room: "friends".to_string() })]
    #[case::rooms("/rooms", UserCommand::Rooms)]
    #[case::quit("/quit", UserCommand::Quit)]
    fn test_parse_command(#[case] line: &str, #[case] expected: UserCommand) {
        assert_eq!(parse_command(line).unwrap(), expected);
    }

    #[rstest]
    #[case::unknown("/frobnicate")]
    #[case::no_text("/send friends")]
    #[case::bad_delay("/delay friends soon text")]
    #[case::no_room("/delete")]
    #[case::no_name("/create")]
    fn test_parse_command_invalid(#[case] line: &str) {
        assert!(parse_command(line).is_err());
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("bob=2.5").unwrap(), (PeerId::new("bob"), Duration::from_millis(2500)));
        assert!(parse_delay("bob").is_err());
        assert!(parse_delay("bob=x").is_err());
        assert!(parse_delay("bob=-1").is_err());
        assert!(parse_delay("bob=NaN").is_err());
        assert!(parse_delay("bob=1e30").is_err());
    }
}
