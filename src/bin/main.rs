use anyhow::{bail, Context};
use matchmate_chat::config::load_config;
use matchmate_chat::types::MessageId;
use matchmate_chat::{ChatClient, Message, OutgoingMessage, Role};
use std::collections::HashSet;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: matchmate-chat <user|agency> <your-id> <counterpart-id>";

fn parse_role(raw: &str) -> anyhow::Result<Role> {
    match raw.trim().to_lowercase().as_str() {
        "user" => Ok(Role::User),
        "agency" => Ok(Role::Agency),
        other => bail!("unknown role {other:?}\n{USAGE}"),
    }
}

fn render(message: &Message, viewer: Role) -> String {
    let who = if message.sender == viewer {
        "you".to_string()
    } else {
        message.sender.to_string()
    };
    let body = match message.payload.as_str() {
        Some(text) => text.to_string(),
        None => format!("{:?} {}", message.kind, message.payload),
    };
    format!("[{}] {}: {}", message.created_at.format("%H:%M"), who, body)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [role, self_id, counterpart_id] = args.as_slice() else {
        bail!(USAGE);
    };
    let viewer = parse_role(role)?;

    let config = load_config();
    let client = ChatClient::connect(&config).context("building chat client")?;
    // Subscribed first so the fetched history arrives through the same queue.
    let mut incoming = client.channel.subscribe();
    let session_id = client
        .start_conversation(viewer, self_id, counterpart_id)
        .await
        .context("opening conversation")?;

    let mut printed: HashSet<MessageId> = HashSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            message = incoming.recv() => {
                let Some(message) = message else { break };
                if printed.insert(message.id.clone()) {
                    println!("{}", render(&message, viewer));
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/read" => {
                        client.channel.mark_read(&session_id, viewer).await?;
                        println!("marked read");
                    }
                    text => match client.channel.send_with_echo(OutgoingMessage::text(viewer, text)).await {
                        Ok(message) => {
                            if printed.insert(message.id.clone()) {
                                println!("{}", render(&message, viewer));
                            }
                        }
                        Err(err) => eprintln!("failed to send message: {err}"),
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.channel.close().await;
    Ok(())
}
