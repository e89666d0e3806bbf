// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! multiaudio - command-line controller for the multiaudio daemon.

mod daemon_client;

use clap::{Parser, Subcommand, ValueEnum};
use daemon_client::{DaemonClient, DaemonEvent};
use multiaudio_ipc::StatusInfo;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "multiaudio")]
#[command(about = "Control concurrent audio playback through the multiaudio daemon")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Turn multi-audio on
    Start,
    /// Turn multi-audio off and restore the system settings
    Stop,
    /// Ask the broker for its permission
    Grant,
    /// Record whether the overlay permission is granted
    Overlay {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Show broker, permission and activation state
    Status,
    /// Print status messages and state changes as they happen
    Watch,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "multiaudio=debug" } else { "multiaudio=warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive(default_level.parse().unwrap())
                .add_directive("zbus=warn".parse().unwrap()),
        )
        .init();

    let client = DaemonClient::connect().await?;

    match cli.command {
        Command::Start => {
            let (strategy, success) = client.activate().await?;
            if success {
                println!("Multi-audio enabled ({})", strategy);
            } else {
                println!("Multi-audio unavailable: every strategy failed");
            }
        }
        Command::Stop => {
            client.deactivate().await?;
            println!("Multi-audio disabled");
        }
        Command::Grant => {
            client.request_grant().await?;
            println!("Permission requested, answer the broker prompt");
        }
        Command::Overlay { state } => {
            client.set_overlay_granted(state == Toggle::On).await?;
        }
        Command::Status => {
            print_status(&client.get_status().await?);
        }
        Command::Watch => {
            print_status(&client.get_status().await?);
            client
                .watch(|event| match event {
                    DaemonEvent::StatusMessage(message) => println!("{}", message),
                    DaemonEvent::StateChanged(status) => println!("{}", status_line(&status)),
                })
                .await?;
        }
    }

    Ok(())
}

fn granted(flag: bool) -> &'static str {
    if flag {
        "granted"
    } else {
        "missing"
    }
}

fn print_status(status: &StatusInfo) {
    let running = if status.broker_alive { "running" } else { "not running" };
    println!("Broker:       {} ({})", status.broker_state, running);
    println!("Overlay:      {}", granted(status.overlay_granted));
    println!("Permissions:  {}", granted(status.all_permissions_granted()));
    println!("Multi-audio:  {}", status.activation_state);
    println!(
        "Last attempt: {} ({})",
        status.last_strategy,
        if status.last_success { "ok" } else { "failed" }
    );
}

fn status_line(status: &StatusInfo) -> String {
    format!(
        "[broker {}, {}, last {}]",
        status.broker_state, status.activation_state, status.last_strategy
    )
}
