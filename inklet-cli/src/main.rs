//! `inklet` binary: runs the collaboration server or an interactive
//! line-oriented client against one.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use inklet_collab::protocol::{Cursor, Request};
use inklet_collab::server::{CollabServer, ServerConfig};
use inklet_collab::{ClientEvent, CollabClient};

#[derive(Parser)]
#[command(name = "inklet", version, about = "Collaborative plain-text editing over TCP")]
struct Cli {
    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collaboration server.
    Serve {
        /// JSON config file; flags below override it.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Connect to a server and issue commands interactively.
    Connect {
        /// Server address as host:port.
        addr: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve {
            config,
            bind,
            port,
            workers,
            data_dir,
        } => serve(cli.log_file, config, bind, port, workers, data_dir).await,
        Command::Connect { addr } => {
            init_logging(cli.log_file.as_deref());
            connect(&addr).await
        }
    };
    if let Err(e) = result {
        // The logger may not be up yet when config loading fails.
        eprintln!("inklet: {e}");
        std::process::exit(1);
    }
}

fn init_logging(log_file: Option<&Path>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        match std::fs::File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("cannot open log file {}: {e}", path.display()),
        }
    }
    builder.init();
}

async fn serve(
    log_file: Option<PathBuf>,
    config: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
    workers: Option<usize>,
    data_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(workers) = workers {
        config.workers = workers;
    }
    if let Some(data_dir) = data_dir {
        config.data_dir = data_dir;
    }
    if let Some(log_file) = log_file {
        config.log_file = Some(log_file);
    }
    init_logging(config.log_file.as_deref());

    let server = CollabServer::bind(config).await?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received");
            shutdown.signal();
        }
    });
    server.run().await?;
    Ok(())
}

async fn connect(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = CollabClient::connect(addr).await?;
    let mut events = client.take_event_rx().ok_or("event stream already taken")?;
    println!("connected to {addr}");
    print_help();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Reply(reply) if reply.is_error() => {
                    println!("error: {}", reply.fields.join(" "));
                }
                ClientEvent::Reply(reply) => {
                    println!("{:?} ok: {}", reply.kind, reply.fields.join(" | "));
                }
                ClientEvent::Edit(Request::Write { cursor, text, .. }) => {
                    println!("[{},{}] wrote {text:?}", cursor.line, cursor.column);
                }
                ClientEvent::Edit(Request::Erase { cursor, count, .. }) => {
                    println!("[{},{}] erased {count}", cursor.line, cursor.column);
                }
                ClientEvent::Edit(_) => {}
                ClientEvent::Disconnected => {
                    println!("server closed the connection");
                    std::process::exit(0);
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if let Err(e) = dispatch(&client, line) {
            println!("error: {e}");
        }
    }
    Ok(())
}

fn dispatch(client: &CollabClient, line: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    match command {
        "help" => print_help(),
        "register" => {
            let (user, pass) = two_args(parts, "register <username> <password>")?;
            client.register(&user, &pass)?;
        }
        "login" => {
            let (user, pass) = two_args(parts, "login <username> <password>")?;
            client.login(&user, &pass)?;
        }
        "create" => {
            let filename = one_arg(parts, "create <filename>")?;
            client.create(&filename)?;
        }
        "load" => {
            let filename = one_arg(parts, "load <filename>")?;
            client.load(&filename)?;
        }
        "join" => {
            let code = one_arg(parts, "join <access-code>")?;
            client.join(&code)?;
        }
        "write" => {
            let cursor = cursor_args(&mut parts)?;
            let text: Vec<&str> = parts.collect();
            if text.is_empty() {
                return Err("usage: write <line> <col> <text>".into());
            }
            // "\n" in the input stands for a newline.
            let text = text.join(" ").replace("\\n", "\n");
            client.write(cursor, &text)?;
        }
        "erase" => {
            let cursor = cursor_args(&mut parts)?;
            let count: u32 = parts
                .next()
                .ok_or("usage: erase <line> <col> <count>")?
                .parse()?;
            client.erase(cursor, count)?;
        }
        other => return Err(format!("unknown command {other:?}; try help").into()),
    }
    Ok(())
}

fn one_arg<'a>(
    mut parts: impl Iterator<Item = &'a str>,
    usage: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    match (parts.next(), parts.next()) {
        (Some(a), None) => Ok(a.to_string()),
        _ => Err(format!("usage: {usage}").into()),
    }
}

fn two_args<'a>(
    mut parts: impl Iterator<Item = &'a str>,
    usage: &str,
) -> Result<(String, String), Box<dyn std::error::Error>> {
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => Ok((a.to_string(), b.to_string())),
        _ => Err(format!("usage: {usage}").into()),
    }
}

fn cursor_args<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
) -> Result<Cursor, Box<dyn std::error::Error>> {
    let line: u16 = parts.next().ok_or("missing line number")?.parse()?;
    let column: u16 = parts.next().ok_or("missing column number")?.parse()?;
    Ok(Cursor::new(line, column))
}

fn print_help() {
    println!("commands:");
    println!("  register <username> <password>");
    println!("  login <username> <password>");
    println!("  create <filename>        start a new shared document");
    println!("  load <filename>          reopen one of your documents");
    println!("  join <access-code>       join someone else's session");
    println!("  write <line> <col> <text>");
    println!("  erase <line> <col> <count>");
    println!("  exit");
}
