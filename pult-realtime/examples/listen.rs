//! Listen for row changes and broadcasts on a Pult realtime channel.
//!
//! ```sh
//! cargo run -p pult-realtime --example listen -- <URL> <TOKEN> <CHANNEL> [TABLE]
//! ```
//!
//! Or pass the token via environment variable:
//! ```sh
//! PULT_TOKEN=... cargo run -p pult-realtime --example listen -- <URL> <CHANNEL> [TABLE]
//! ```
//!
//! Payloads are printed to stdout (pipe to `jq` for formatting).

use pult_realtime::protocol::ANY_TABLE;
use pult_realtime::{ChangeEvent, ClientConfig, RealtimeClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_token = std::env::var("PULT_TOKEN").ok();

    let (url, token, rest) = if let Some(ref token) = env_token {
        let url = args
            .first()
            .ok_or("usage: listen <URL> <CHANNEL> [TABLE]")?;
        (url.as_str(), token.as_str(), args.get(1..).unwrap_or_default())
    } else {
        let url = args
            .first()
            .ok_or("usage: listen <URL> <TOKEN> <CHANNEL> [TABLE]")?;
        let token = args
            .get(1)
            .ok_or("usage: listen <URL> <TOKEN> <CHANNEL> [TABLE]")?;
        (url.as_str(), token.as_str(), args.get(2..).unwrap_or_default())
    };
    let channel = rest.first().ok_or("missing <CHANNEL>")?;
    let table = rest.get(1).map_or(ANY_TABLE, String::as_str);

    let client = RealtimeClient::new(ClientConfig::new(url, token))?;
    client.on_open(|| eprintln!("[connected]"));
    client.on_close(|| eprintln!("[disconnected]"));
    client.on_error(|e| eprintln!("[error] {e}"));

    let host = client.endpoint().host_str().unwrap_or("-");
    eprintln!("listening on '{channel}' (table {table}) via {host} ...");

    let ch = client.channel(channel);
    ch.on(ChangeEvent::All, table, |row| {
        eprintln!(
            "[change] {} {}",
            row.get("type").and_then(|v| v.as_str()).unwrap_or("-"),
            row.get("table").and_then(|v| v.as_str()).unwrap_or("-"),
        );
        println!("{row}");
    });
    ch.subscribe();

    tokio::signal::ctrl_c().await?;
    ch.unsubscribe();
    Ok(())
}
