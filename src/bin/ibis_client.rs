//! `ibis-client` — a CLI client exercising the broker's TCP control
//! protocol: set text/time/sequence content, toggle enable/stop-indicator
//! state, or query the broker's live state.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use regex::Regex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ContentType {
    Text,
    Time,
    Sequence,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TriState {
    On,
    Off,
    Toggle,
}

/// CLI client for the VDV-300/IBIS display broker.
#[derive(Parser, Debug)]
#[command(name = "ibis-client", about = "CLI client for the IBIS display broker")]
struct Args {
    /// Broker host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Broker TCP port.
    #[arg(short, long, default_value_t = 4242)]
    port: u16,

    /// Display address (0-3), or -1 to broadcast where the command allows it.
    #[arg(short, long)]
    display: Option<i32>,

    /// Content type to set.
    #[arg(short = 't', long = "type", value_enum)]
    content_type: Option<ContentType>,

    /// Content value: literal text, a strftime format, or a `|`-separated
    /// sequence (see --help for the sequence mini-syntax).
    #[arg(short, long)]
    value: Option<String>,

    /// Priority to claim when setting content.
    #[arg(short = 'r', long, default_value_t = 0)]
    priority: i32,

    /// Owner identifier. Defaults to the broker's view of this peer's IP.
    #[arg(short, long)]
    client: Option<String>,

    /// Default interval (seconds) for sequence items without their own duration.
    #[arg(short, long, default_value_t = 5.0)]
    interval: f64,

    /// Enable/disable/toggle a display.
    #[arg(short, long, value_enum)]
    enable: Option<TriState>,

    /// Enable/disable/toggle a display's stop indicator.
    #[arg(long = "stop-indicator", value_enum)]
    stop_indicator: Option<TriState>,

    /// Query the broker's state instead of mutating it.
    #[arg(short, long)]
    query: Option<String>,

    /// Client-side socket timeout, in seconds.
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,
}

/// Parses the `--value` mini-syntax for `--type sequence`: `|`-separated
/// items, an optional trailing `~<duration>` per item, and a `%x`-looking
/// item becomes a Time entry rather than Text.
fn parse_sequence(value: &str, default_interval: f64) -> Value {
    let time_pattern = Regex::new(r"%[-a-zA-Z]").unwrap();
    let messages: Vec<Value> = value
        .split('|')
        .map(|item| {
            let (body, duration) = match item.rsplit_once('~') {
                Some((rest, dur)) => match dur.parse::<f64>() {
                    Ok(d) => (rest, Some(d)),
                    Err(_) => (item, None),
                },
                None => (item, None),
            };

            let mut entry = if time_pattern.is_match(body) {
                json!({"type": "time", "format": body})
            } else {
                json!({"type": "text", "text": body})
            };
            if let Some(d) = duration {
                entry["duration"] = json!(d);
            }
            entry
        })
        .collect();

    json!({"type": "sequence", "messages": messages, "interval": default_interval})
}

async fn send_request(host: &str, port: u16, request: &Value, timeout_secs: f64) -> Result<Option<Value>> {
    let body = serde_json::to_string(request)?;
    if body.len() > 9999 {
        bail!("encoded request body ({} bytes) exceeds the 9999 byte datagram limit", body.len());
    }
    let datagram = format!("{:04}{}", body.len(), body);

    let connect = timeout(Duration::from_secs_f64(timeout_secs), TcpStream::connect((host, port)));
    let mut stream = connect.await.context("connect timed out")?.context("failed to connect")?;
    stream.write_all(datagram.as_bytes()).await?;

    let mut prefix = [0u8; 4];
    if timeout(Duration::from_secs_f64(timeout_secs), stream.read_exact(&mut prefix))
        .await
        .is_err()
    {
        return Ok(None);
    }
    let length: usize = std::str::from_utf8(&prefix)?.parse()?;
    let mut reply_body = vec![0u8; length];
    stream.read_exact(&mut reply_body).await?;
    Ok(Some(serde_json::from_slice(&reply_body)?))
}

fn tristate_to_json(state: TriState) -> Value {
    match state {
        TriState::On => json!(true),
        TriState::Off => json!(false),
        TriState::Toggle => json!("toggle"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .with_target(false)
        .init();

    let args = Args::parse();

    if let Some(query) = &args.query {
        let request = json!({"query": query});
        match send_request(&args.host, args.port, &request, args.timeout).await? {
            Some(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
            None => eprintln!("no reply received"),
        }
        return Ok(());
    }

    if let Some(state) = args.enable {
        let address = args.display.unwrap_or(-1);
        let request = json!({"address": address, "enable": tristate_to_json(state)});
        let reply = send_request(&args.host, args.port, &request, args.timeout).await?;
        println!("{}", serde_json::to_string(&reply)?);
    }

    if let Some(content_type) = args.content_type {
        let display = args.display.context("--display is required when --type is set")?;
        let value = args.value.as_deref().context("--value is required when --type is set")?;

        let message = match content_type {
            ContentType::Text => json!({"type": "text", "text": value}),
            ContentType::Time => json!({"type": "time", "format": value}),
            ContentType::Sequence => parse_sequence(value, args.interval),
        };

        let mut request = json!({
            "address": display,
            "message": message,
            "priority": args.priority,
        });
        if let Some(client) = &args.client {
            request["client"] = json!(client);
        }

        let reply = send_request(&args.host, args.port, &request, args.timeout).await?;
        println!("{}", serde_json::to_string(&reply)?);
    }

    if let Some(state) = args.stop_indicator {
        let display = args.display.context("--display is required with --stop-indicator")?;
        let request = json!({"address": display, "stop_indicator": tristate_to_json(state)});
        let reply = send_request(&args.host, args.port, &request, args.timeout).await?;
        println!("{}", serde_json::to_string(&reply)?);
    }

    Ok(())
}
