use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{Command, EngineStatus, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "vwctl")]
#[command(about = "Video Wallpaper Daemon Control", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a video file as the wallpaper
    Apply {
        /// Path to the video file
        path: String,

        /// Display name for the selection (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Report surface lifecycle events (for hosts and scripts)
    Surface {
        #[command(subcommand)]
        event: SurfaceCommands,
    },

    /// Write the last drawn frame to a PNG file
    Snapshot {
        /// Output path
        path: String,
    },

    /// Query engine status
    Status,

    /// Kill the running daemon
    Kill,

    /// Ping the daemon to check if it's running
    Ping,
}

#[derive(Subcommand)]
enum SurfaceCommands {
    /// A drawing surface was created
    Acquire { width: u32, height: u32 },

    /// The drawing surface changed size
    Resize { width: u32, height: u32 },

    /// The surface became visible (true) or hidden (false)
    Visible {
        #[arg(action = clap::ArgAction::Set)]
        visible: bool,
    },

    /// Home screen paging offsets (0.0-1.0, 0.5 is the middle page)
    Offset {
        #[arg(value_parser = parse_unit)]
        x: f32,
        #[arg(value_parser = parse_unit)]
        y: f32,
    },

    /// The drawing surface was destroyed
    Release,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = build_command(cli.command)?;

    match send_command(command).await {
        Ok(response) => {
            handle_response(response);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("\nIs the daemon running? Try starting it with: vidwalld");
            std::process::exit(1);
        }
    }
}

fn build_command(command: Commands) -> Result<Command> {
    let command = match command {
        Commands::Apply { path, name } => {
            // The daemon only accepts absolute paths
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("Cannot open {}", path))?;
            let name = name.unwrap_or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_else(|| "Wallpaper".to_string())
            });
            Command::Apply {
                name,
                path: path.to_string_lossy().to_string(),
            }
        }
        Commands::Surface { event } => match event {
            SurfaceCommands::Acquire { width, height } => {
                Command::SurfaceAcquired { width, height }
            }
            SurfaceCommands::Resize { width, height } => Command::SurfaceResized { width, height },
            SurfaceCommands::Visible { visible } => Command::VisibilityChanged { visible },
            SurfaceCommands::Offset { x, y } => Command::OffsetsChanged { x, y },
            SurfaceCommands::Release => Command::SurfaceReleased,
        },
        Commands::Snapshot { path } => {
            let path = std::path::absolute(&path)
                .with_context(|| format!("Invalid snapshot path {}", path))?;
            Command::Snapshot {
                path: path.to_string_lossy().to_string(),
            }
        }
        Commands::Status => Command::Query,
        Commands::Kill => Command::Kill,
        Commands::Ping => Command::Ping,
    };
    Ok(command)
}

async fn send_command(command: Command) -> Result<Response> {
    let socket_path = common::get_socket_path();

    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Send command
    let command_json = serde_json::to_string(&command)?;
    writer.write_all(command_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    // Read response
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    let response: Response = serde_json::from_str(&response_line)?;
    Ok(response)
}

fn handle_response(response: Response) {
    match response {
        Response::Ok => {
            println!("✓ Success");
        }
        Response::Error(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(1);
        }
        Response::Status(status) => print_status(&status),
        Response::Pong => {
            println!("✓ Daemon is running");
        }
    }
}

fn print_status(status: &EngineStatus) {
    println!("Engine Status:");
    println!("  Version: {}", status.version);
    println!("  Uptime: {}s", status.uptime_secs);
    println!("  State: {}", status.state);
    match status.source {
        Some(ref source) => println!(
            "  Source: {} ({:?}) {}",
            source.name, source.kind, source.locator
        ),
        None => println!("  Source: none"),
    }
    if let Some((width, height, rotation)) = status.video {
        println!("  Video: {}x{} rotated {}°", width, height, rotation);
    }
    if let Some((width, height)) = status.screen {
        println!("  Screen: {}x{}", width, height);
    }
    println!(
        "  Frames: {} delivered, {} consumed, {} texture updates",
        status.frames_delivered, status.frames_consumed, status.texture_updates
    );
    if let Some(ref error) = status.last_error {
        println!("  Last error: {}", error);
    }
}

fn parse_unit(value: &str) -> Result<f32, String> {
    let parsed: f32 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(format!("{} is outside 0.0-1.0", parsed));
    }
    Ok(parsed)
}
