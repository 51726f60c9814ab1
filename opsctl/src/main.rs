// ABOUTME: provides a user-facing cli for sending operator queries to the local agent daemon.
// ABOUTME: prints deterministic json responses returned by the daemon.

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use opsctl::{build_request, parse_and_validate, validate_verdict};

#[derive(Debug, Parser)]
#[command(name = "opsctl")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one query and print the agent's reply.
    Ask {
        #[arg(long, default_value = "/tmp/opsagentd.sock")]
        socket_path: String,

        #[arg(long)]
        user_id: u64,

        #[arg(long)]
        session_id: Option<String>,

        query: String,
    },
    /// Send a raw request json document, from a file or inline.
    Send {
        #[arg(long, default_value = "/tmp/opsagentd.sock")]
        socket_path: String,

        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        json: Option<String>,
    },
    /// Check a request json document without sending it.
    Validate {
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        json: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Ask {
            socket_path,
            user_id,
            session_id,
            query,
        } => {
            let request = build_request(user_id, &query, session_id.as_deref())?;
            let canonical = serde_json::to_string(&request)?;
            let response = send(&socket_path, &canonical).await?;
            print!("{response}");
        }
        Command::Send {
            socket_path,
            file,
            json,
        } => {
            let input = read_input(file.as_deref(), json.as_deref()).await?;
            let request = parse_and_validate(&input)?;
            let canonical = serde_json::to_string(&request)?;
            let response = send(&socket_path, &canonical).await?;
            print!("{response}");
        }
        Command::Validate { file, json } => {
            let input = read_input(file.as_deref(), json.as_deref()).await?;
            let verdict = validate_verdict(&input);
            print!("{}", serde_json::to_string_pretty(&verdict)?);
        }
    }

    Ok(())
}

async fn read_input(file: Option<&str>, json: Option<&str>) -> anyhow::Result<String> {
    if let Some(json) = json {
        return Ok(json.to_string());
    }

    if let Some(file) = file {
        return Ok(tokio::fs::read_to_string(file).await?);
    }

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    Ok(input)
}

async fn send(socket_path: &str, input: &str) -> anyhow::Result<String> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(input.as_bytes()).await?;
    stream.shutdown().await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}
