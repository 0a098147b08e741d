//! h1-engine command line.
//!
//! ```text
//! h1-engine serve [--config engine.toml] [--port 8080]
//!     → Server on TcpTransport, echoes each request back as JSON
//!
//! h1-engine fetch <url> [-X METHOD] [-H "name: value"]... [-d body]
//!     → Client + Agent on TcpTransport, prints status, headers and body
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

use h1_engine::config::loader::load_config;
use h1_engine::http::{BodyReadable, HeaderWritable, Method, ServerEvent};
use h1_engine::observability::{logging, metrics};
use h1_engine::{Agent, Client, EngineConfig, IncomingMessage, Server, ServerResponse, TcpTransport};

#[derive(Parser)]
#[command(name = "h1-engine")]
#[command(about = "HTTP/1.1 message engine: echo server and fetch client", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server that answers every request with its metadata
    Serve {
        /// Overrides `server.port`
        #[arg(short, long)]
        port: Option<u16>,

        /// Overrides `server.host`
        #[arg(long)]
        host: Option<String>,
    },
    /// Send one request and print the response
    Fetch {
        url: String,

        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request header as `name: value`; repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    logging::init_tracing(&config.observability);

    match cli.command {
        Commands::Serve { port, host } => serve(config, port, host).await,
        Commands::Fetch {
            url,
            method,
            headers,
            data,
        } => fetch(config, &url, &method, &headers, data).await,
    }
}

async fn serve(
    config: EngineConfig,
    port: Option<u16>,
    host: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("h1-engine v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let transport = Arc::new(TcpTransport::new(config.transport.clone()));
    let port = port.unwrap_or(config.server.port);
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let backlog = config.server.backlog;
    let (server, mut events) = Server::new(transport, config.server);
    server.listen(port, &host, backlog)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                server.close();
            }
            event = events.recv() => match event {
                Some(ServerEvent::Listening(addr)) => {
                    tracing::info!(address = %addr, "Listening for connections");
                }
                Some(ServerEvent::Request(req, res)) => {
                    tokio::spawn(echo(req, res));
                }
                Some(ServerEvent::ClientError { error, socket }) => {
                    tracing::debug!(connection_id = %socket.id(), error = %error, "Client error");
                }
                Some(ServerEvent::Error(error)) => {
                    tracing::error!(error = %error, "Server error");
                    return Err(error.into());
                }
                Some(ServerEvent::Close) | None => break,
                Some(_) => {}
            }
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn echo(req: IncomingMessage, res: ServerResponse) {
    let body = match req.read_to_end().await {
        Ok(body) => body,
        Err(error) => {
            tracing::debug!(error = %error, "Request body not received");
            return;
        }
    };

    let headers: Map<String, Value> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            let values: Vec<Value> = value.values().map(Value::from).collect();
            let value = match values.len() {
                1 => values.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(values),
            };
            (name.to_string(), value)
        })
        .collect();
    let payload = json!({
        "method": req.method(),
        "url": req.url(),
        "httpVersion": req.http_version(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });

    let rendered = match serde_json::to_vec_pretty(&payload) {
        Ok(rendered) => rendered,
        Err(error) => {
            tracing::error!(error = %error, "Failed to render echo body");
            res.set_status_code(500);
            res.end();
            return;
        }
    };
    if let Err(error) = res.set_header("content-type", "application/json") {
        tracing::debug!(error = %error, "Echo header rejected");
    }
    if let Err(error) = res.end_with(rendered) {
        tracing::debug!(error = %error, "Echo response not sent");
    }
}

async fn fetch(
    config: EngineConfig,
    url: &str,
    method: &str,
    headers: &[String],
    data: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let method: Method = method.to_ascii_uppercase().parse()?;
    let headers: Vec<(&str, &str)> = headers
        .iter()
        .map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim(), value.trim()))
                .ok_or_else(|| format!("header {:?} is not `name: value`", line))
        })
        .collect::<Result<_, _>>()?;

    let transport = Arc::new(TcpTransport::new(config.transport.clone()));
    let client = Client::new(Agent::new(transport, config.agent));
    let response = client
        .fetch(method, url, &headers, data.map(Bytes::from))
        .await?;

    println!("HTTP/1.1 {} {}", response.status, response.status_message);
    for (name, value) in response.headers.iter() {
        for value in value.values() {
            println!("{}: {}", name, value);
        }
    }
    println!();
    match serde_json::from_slice::<Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.text()),
    }
    client.agent().destroy();
    Ok(())
}
