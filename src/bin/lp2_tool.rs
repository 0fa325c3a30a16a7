//! Minimal CLI driver for the LP2 engine: connects to a serial port and
//! reads or writes a single CV.
//!
//! Usage: `lmrs-lp2-tool [--config <path>] <serial-port> read <cv>`
//!        `lmrs-lp2-tool [--config <path>] <serial-port> write <cv> <value>`

use lmrs::lp2::{self, Lp2Config, Lp2Engine};
use log::{error, info};

struct Args {
    config_path: Option<String>,
    port: String,
    command: Command,
}

enum Command {
    Read { cv: u16 },
    Write { cv: u16, value: u8 },
}

fn parse_args() -> Args {
    let mut args: Vec<String> = std::env::args().collect();
    let usage = |args: &[String]| -> ! {
        eprintln!("usage: {} [--config <path>] <serial-port> read <cv>", args[0]);
        eprintln!("       {} [--config <path>] <serial-port> write <cv> <value>", args[0]);
        std::process::exit(1);
    };

    let config_path = match args.iter().position(|a| a == "--config") {
        Some(pos) => {
            if pos + 1 >= args.len() {
                usage(&args);
            }
            let path = args.remove(pos + 1);
            args.remove(pos);
            Some(path)
        }
        None => None,
    };

    if args.len() < 4 {
        usage(&args);
    }
    let port = args[1].clone();
    let command = match args[2].as_str() {
        "read" if args.len() == 4 => Command::Read {
            cv: args[3].parse().unwrap_or_else(|_| usage(&args)),
        },
        "write" if args.len() == 5 => Command::Write {
            cv: args[3].parse().unwrap_or_else(|_| usage(&args)),
            value: args[4].parse().unwrap_or_else(|_| usage(&args)),
        },
        _ => usage(&args),
    };
    Args { config_path, port, command }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => lp2::config::parse_config(path).unwrap_or_else(|e| {
            error!("failed to parse config file {path}: {e}");
            std::process::exit(1);
        }),
        None => Lp2Config::default(),
    };

    let mut engine = Lp2Engine::new(config);
    if let Err(e) = engine.connect(&args.port).await {
        error!("failed to connect to {}: {e}", args.port);
        std::process::exit(1);
    }
    info!("connected to {}", args.port);

    let result = match args.command {
        Command::Read { cv } => engine.read_cv(cv).await.map(|value| {
            info!("CV{cv} = {value}");
        }),
        Command::Write { cv, value } => engine.write_cv(cv, value).await.map(|()| {
            info!("CV{cv} <- {value}");
        }),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
