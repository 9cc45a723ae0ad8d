//! SSH test client CLI
//!
//! Simple tool for poking at an sshframe server.
//!
//! Usage:
//!   cargo run --bin sshtest --features testing -- --send "hello"
//!   cargo run --bin sshtest --features testing -- --exec "ls -l" --password secret

use anyhow::Result;
use sshframe::testing::{ClientAuth, SshTestClient};
use std::time::Duration;

#[derive(Default)]
struct Args {
    addr: String,
    key: Option<String>,
    password: Option<String>,
    anonymous: bool,
    username: String,
    exec: Option<String>,
    inputs: Vec<String>,
    pty: bool,
    wait_ms: u64,
    raw: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        addr: "localhost:2222".to_string(),
        username: std::env::var("USER").unwrap_or_else(|_| "guest".to_string()),
        wait_ms: 500,
        ..Default::default()
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--addr" | "-a" => {
                args.addr = iter.next().ok_or_else(|| anyhow::anyhow!("--addr requires value"))?;
            }
            "--key" | "-k" => {
                args.key = Some(iter.next().ok_or_else(|| anyhow::anyhow!("--key requires value"))?);
            }
            "--password" | "-p" => {
                args.password =
                    Some(iter.next().ok_or_else(|| anyhow::anyhow!("--password requires value"))?);
            }
            "--anonymous" | "-n" => {
                args.anonymous = true;
            }
            "--user" | "-u" => {
                args.username = iter.next().ok_or_else(|| anyhow::anyhow!("--user requires value"))?;
            }
            "--exec" | "-e" => {
                args.exec = Some(iter.next().ok_or_else(|| anyhow::anyhow!("--exec requires value"))?);
            }
            "--send" | "-s" => {
                args.inputs.push(iter.next().ok_or_else(|| anyhow::anyhow!("--send requires value"))?);
            }
            "--pty" | "-t" => {
                args.pty = true;
            }
            "--wait" | "-w" => {
                args.wait_ms = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--wait requires value"))?
                    .parse()?;
            }
            "--raw" | "-r" => {
                args.raw = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    Ok(args)
}

fn print_help() {
    eprintln!(
        r#"sshtest - SSH test client for sshframe

USAGE:
    sshtest [OPTIONS]

OPTIONS:
    -a, --addr <ADDR>      Server address [default: localhost:2222]
    -k, --key <PATH>       SSH private key [default: agent, then ~/.ssh/id_ed25519]
    -p, --password <PW>    Authenticate with a password instead of a key
    -n, --anonymous        Authenticate with the none method
    -u, --user <NAME>      Username [default: $USER]
    -e, --exec <COMMAND>   Run a command instead of a shell
    -s, --send <INPUT>     Input line to send (can be repeated)
    -t, --pty              Request a PTY for the shell
    -w, --wait <MS>        Wait time after input [default: 500]
    -r, --raw              Print raw bytes (hex dump)
    -h, --help             Print help

EXAMPLES:
    sshtest --anonymous --send "hello"
    sshtest --pty --send "hello" --send "world"
    sshtest --addr 192.168.1.10:2222 --exec "uptime"
"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    let auth = if args.anonymous {
        ClientAuth::None
    } else if let Some(password) = args.password.clone() {
        ClientAuth::Password(password)
    } else {
        ClientAuth::AgentOrKeyFile(args.key.clone())
    };

    eprintln!("connecting to {} as {}...", args.addr, args.username);
    let client = SshTestClient::connect(&args.addr, &args.username, auth).await?;

    let mut channel = match &args.exec {
        Some(command) => client.exec(command).await?,
        None => {
            let pty = args.pty.then_some(("xterm-256color", 80, 24));
            client.shell(pty).await?
        }
    };

    eprintln!("connected, sending {} input(s)...", args.inputs.len());
    for input in &args.inputs {
        eprintln!("> {}", input);
        channel.send(input).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let output = channel
        .wait_and_collect(Duration::from_millis(args.wait_ms))
        .await?;

    eprintln!("--- output ({} bytes) ---", output.len());

    if args.raw {
        // Hex dump
        for (i, chunk) in output.chunks(16).enumerate() {
            print!("{:04x}: ", i * 16);
            for byte in chunk {
                print!("{:02x} ", byte);
            }
            print!("  ");
            for byte in chunk {
                if byte.is_ascii_graphic() || *byte == b' ' {
                    print!("{}", *byte as char);
                } else {
                    print!(".");
                }
            }
            println!();
        }
    } else {
        print!("{}", String::from_utf8_lossy(&output));
    }

    eprintln!("---");
    if let Some(status) = channel.exit_status() {
        eprintln!("exit status: {}", status);
    }

    client.close().await?;
    eprintln!("disconnected");

    Ok(())
}
