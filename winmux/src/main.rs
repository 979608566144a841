// Copyright 2024 WinMux Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command line entry point for winmux: a thin dispatcher over the
//! `libwinmux` daemon core and the wire protocol in `winmux-protocol`,
//! shaped after `shpool`'s own `main.rs` + `libshpool::{Args, Commands}`
//! split, collapsed into one binary since there's no separate systemd-unit
//! packaging concern here.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libwinmux::{config, registry::SessionRegistry, Server};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;
use winmux_protocol::{Event, Request};

mod attach;
mod client;

use client::Client;

/// Command line arguments winmux expects.
#[derive(Parser, Debug)]
#[clap(author, about, version)]
struct Args {
    #[clap(short, long, help = "The file to write logs to; defaults to stderr for `daemon`, discarded otherwise")]
    log_file: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    verbose: u8,

    #[clap(short, long, help = "A JSON file containing daemon configuration")]
    config_file: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[clap(about = "Starts the daemon that holds the pool of pseudoconsole sessions")]
    Daemon,

    #[clap(about = "Checks that the daemon is reachable and responsive")]
    Ping,

    #[clap(about = "Lists all running shell sessions")]
    Ls,

    #[clap(about = "Creates a new shell session")]
    New {
        #[clap(short, long, default_value = "", help = "Name for the new session")]
        name: String,
        #[clap(short, long, help = "Shell executable to launch, overriding the daemon's default")]
        shell: Option<String>,
        #[clap(short = 'C', long, help = "Working directory, overriding the daemon's default")]
        cwd: Option<String>,
        #[clap(short, long, help = "Initial pseudoconsole width")]
        cols: Option<u16>,
        #[clap(short, long, help = "Initial pseudoconsole height")]
        rows: Option<u16>,
    },

    #[clap(about = "Attaches to an existing shell session")]
    Attach {
        #[clap(help = "The id or name of the session to attach to")]
        id_or_name: String,
    },

    #[clap(about = "Kills the given shell session")]
    Kill {
        #[clap(help = "The id or name of the session to kill")]
        id_or_name: String,
    },

    #[clap(about = "Resizes the given shell session's pseudoconsole")]
    Resize {
        #[clap(help = "The id or name of the session to resize")]
        id_or_name: String,
        #[clap(help = "New width")]
        cols: u16,
        #[clap(help = "New height")]
        rows: u16,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = runtime.block_on(dispatch(args));
    if let Err(err) = result {
        error!("{:?}", err);
        eprintln!("winmux: {err:?}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    if let Some(log_file) = &args.log_file {
        if let Ok(file) = fs::File::create(log_file) {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(Mutex::new(file))
                .init();
            return;
        }
    }
    if matches!(args.command, Commands::Daemon) {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }
}

async fn dispatch(args: Args) -> Result<()> {
    match args.command {
        Commands::Daemon => run_daemon(args.config_file.map(PathBuf::from)).await,
        Commands::Ping => {
            let mut client = Client::connect().await?;
            match client.roundtrip(Request::Ping).await? {
                Event::Pong { server_time } => {
                    println!("pong ({server_time})");
                    Ok(())
                }
                other => anyhow::bail!("unexpected reply to ping: {other:?}"),
            }
        }
        Commands::Ls => {
            let mut client = Client::connect().await?;
            match client.roundtrip(Request::List).await? {
                Event::Sessions { sessions } => {
                    for session in sessions {
                        println!(
                            "{}\t{}\t{}\t{}x{}\t{}",
                            session.id, session.name, session.state, session.cols, session.rows, session.shell
                        );
                    }
                    Ok(())
                }
                other => anyhow::bail!("unexpected reply to ls: {other:?}"),
            }
        }
        Commands::New { name, shell, cwd, cols, rows } => {
            let mut client = Client::connect().await?;
            let request = Request::CreateSession { name, shell, cwd, env: None, cols, rows };
            match client.roundtrip(request).await? {
                Event::Created { session_id } => {
                    println!("{session_id}");
                    Ok(())
                }
                Event::Error { code, message, .. } => anyhow::bail!("create failed: {code}: {message}"),
                other => anyhow::bail!("unexpected reply to new: {other:?}"),
            }
        }
        Commands::Attach { id_or_name } => attach::run(id_or_name).await,
        Commands::Kill { id_or_name } => {
            let mut client = Client::connect().await?;
            match client.roundtrip(Request::Kill { session_id: id_or_name }).await? {
                Event::Ack { .. } => Ok(()),
                Event::Error { code, message, .. } => anyhow::bail!("kill failed: {code}: {message}"),
                other => anyhow::bail!("unexpected reply to kill: {other:?}"),
            }
        }
        Commands::Resize { id_or_name, cols, rows } => {
            let mut client = Client::connect().await?;
            client.send(&Request::Resize { session_id: id_or_name, cols, rows }).await?;
            // Resize has no success reply on the wire; only give the miss
            // case a moment to arrive before treating silence as success.
            if let Ok(Ok(Some(Event::Error { code, message, .. }))) =
                tokio::time::timeout(std::time::Duration::from_millis(200), client.recv()).await
            {
                anyhow::bail!("resize failed: {code}: {message}");
            }
            Ok(())
        }
    }
}

async fn run_daemon(config_path: Option<PathBuf>) -> Result<()> {
    let config = config::read_config(config_path.as_deref())?;
    let registry = std::sync::Arc::new(SessionRegistry::new(config));
    let server = Server::new(registry);
    server.serve().await
}
