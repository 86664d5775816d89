//! hotctl - command-line client for the hotify control plane
//!
//! Usage:
//!   hotctl list                  List services
//!   hotctl info <name>           Show service details
//!   hotctl logs <name> [--live]  Print captured output
//!   hotctl create <name> --repo <url> --exec <cmd> [options]
//!   hotctl start|stop|update|restart|delete <name>
//!   hotctl configure --address <host:port> --secret <secret>

use anyhow::{bail, Context, Result};
use hotify::config::{ProxyRule, ServiceSpec};
use hotify::signature::sign;
use serde::{Deserialize, Serialize};
use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

/// Default control plane address
const DEFAULT_ADDRESS: &str = "127.0.0.1:3000";

/// CLI configuration stored in ~/.hotify/cli.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CliConfig {
    /// Control plane address (host:port)
    address: Option<String>,
    /// Shared API secret
    secret: Option<String>,
}

/// Service summary from the API
#[derive(Debug, Deserialize)]
struct ServiceSummary {
    name: String,
    status: String,
    restarts: u32,
}

/// Full service view from the API
#[derive(Debug, Deserialize)]
struct ServiceInfo {
    name: String,
    status: String,
    restarts: u32,
    path: String,
    pid: Option<u32>,
    config: ServiceSpec,
    #[serde(default)]
    logs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceLogs {
    logs: Vec<String>,
    /// Lines produced so far, including ones no longer retained
    #[serde(default)]
    total: u64,
}

/// Lines of `logs` not printed yet, given that `seen` of `total` were
fn unseen(logs: &[String], total: u64, seen: u64) -> &[String] {
    let fresh = total.saturating_sub(seen);
    let fresh = usize::try_from(fresh).unwrap_or(usize::MAX).min(logs.len());
    &logs[logs.len() - fresh..]
}

/// Error body from the API
#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    message: String,
}

/// CLI command structure
#[derive(Debug, PartialEq)]
enum Command {
    List,
    Info { name: String },
    Logs { name: String, live: bool },
    Create(Box<ServiceSpec>),
    Delete { name: String },
    Action { name: String, action: &'static str },
    Configure { address: Option<String>, secret: Option<String> },
    Help,
    Version,
}

/// Raw HTTP response
#[derive(Debug)]
struct HttpResponse {
    status: u16,
    body: String,
}

/// API client using raw TCP and HTTP/1.1
struct ApiClient {
    address: String,
    secret: String,
}

impl ApiClient {
    fn new() -> Result<Self> {
        let config = load_config()?;
        let address = env::var("HOTIFY_ADDRESS")
            .ok()
            .or(config.address)
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let secret = env::var("HOTIFY_SECRET")
            .ok()
            .or(config.secret)
            .context("No API secret configured; run `hotctl configure --secret <secret>` or set HOTIFY_SECRET")?;

        Ok(Self { address, secret })
    }

    fn request(&self, method: &str, path: &str, body: &str) -> Result<HttpResponse> {
        let host_port = self
            .address
            .strip_prefix("http://")
            .unwrap_or(&self.address)
            .trim_end_matches('/');

        let mut stream = TcpStream::connect(host_port)
            .with_context(|| format!("Failed to connect to hotify at {}", host_port))?;

        stream.set_read_timeout(Some(Duration::from_secs(300)))?;
        stream.set_write_timeout(Some(Duration::from_secs(30)))?;

        let request = format!(
            "{} {} HTTP/1.1\r\n\
             Host: {}\r\n\
             X-Signature-256: {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            method,
            path,
            host_port,
            sign(&self.secret, body.as_bytes()),
            body.len(),
            body
        );

        stream.write_all(request.as_bytes())?;
        stream.flush()?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        parse_response(&response)
    }

    /// Send a request and fail on a non-2xx status
    fn call(&self, method: &str, path: &str, body: &str) -> Result<String> {
        let response = self.request(method, path, body)?;
        if (200..300).contains(&response.status) {
            return Ok(response.body);
        }

        match serde_json::from_str::<ApiError>(&response.body) {
            Ok(err) => bail!("{} ({}): {}", response.status, err.code, err.message),
            Err(_) if response.status == 403 => {
                bail!("403: request rejected, check the configured secret")
            }
            Err(_) => bail!("request failed with status {}", response.status),
        }
    }
}

fn parse_response(raw: &str) -> Result<HttpResponse> {
    let status = raw
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .context("Malformed HTTP response")?;

    let body = match raw.find("\r\n\r\n") {
        Some(idx) => raw[idx + 4..].to_string(),
        None => String::new(),
    };

    Ok(HttpResponse { status, body })
}

fn service_path(name: &str) -> String {
    format!("/api/services/{}", urlencoding::encode(name))
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    match parse_command(&args)? {
        Command::Help => print_help(),
        Command::Version => print_version(),
        Command::Configure { address, secret } => handle_configure(address, secret)?,
        command => {
            let client = ApiClient::new()?;
            handle_service_command(&client, command)?;
        }
    }

    Ok(())
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    let name = || -> Result<String> {
        args.get(1)
            .filter(|n| !n.starts_with("--"))
            .cloned()
            .with_context(|| format!("Usage: hotctl {} <name>", first))
    };

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "list" | "ls" => Command::List,
        "info" => Command::Info { name: name()? },
        "logs" => Command::Logs {
            name: name()?,
            live: args[2..].iter().any(|a| a == "--live" || a == "-l"),
        },
        "delete" => Command::Delete { name: name()? },
        "start" => Command::Action { name: name()?, action: "start" },
        "stop" => Command::Action { name: name()?, action: "stop" },
        "update" => Command::Action { name: name()?, action: "update" },
        "restart" => Command::Action { name: name()?, action: "restart" },
        "create" => Command::Create(Box::new(parse_create(name()?, &args[2..])?)),
        "configure" => {
            let mut address = None;
            let mut secret = None;
            let mut iter = args[1..].iter();
            while let Some(flag) = iter.next() {
                match flag.as_str() {
                    "--address" => address = Some(flag_value(flag, iter.next())?),
                    "--secret" => secret = Some(flag_value(flag, iter.next())?),
                    other => bail!("Unknown option for configure: {}", other),
                }
            }
            Command::Configure { address, secret }
        }
        other => bail!("Unknown command: {} (see `hotctl help`)", other),
    };

    Ok(command)
}

fn flag_value(flag: &str, value: Option<&String>) -> Result<String> {
    value
        .cloned()
        .with_context(|| format!("Option {} requires a value", flag))
}

fn parse_create(name: String, args: &[String]) -> Result<ServiceSpec> {
    let mut spec = ServiceSpec {
        name,
        ..Default::default()
    };
    let mut proxy = ProxyRule::default();

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--repo" => spec.repo = flag_value(flag, iter.next())?,
            "--exec" => spec.exec = flag_value(flag, iter.next())?,
            "--build" => spec.build = flag_value(flag, iter.next())?,
            "--restart" => spec.restart = true,
            "--max-restarts" => {
                let value = flag_value(flag, iter.next())?;
                spec.max_restarts = value
                    .parse()
                    .with_context(|| format!("Invalid --max-restarts value: {}", value))?;
            }
            "--secret" => spec.secret = Some(flag_value(flag, iter.next())?),
            "--proxy-match" => proxy.match_rule = flag_value(flag, iter.next())?,
            "--proxy-upstream" => proxy.upstream = flag_value(flag, iter.next())?,
            other => bail!("Unknown option for create: {}", other),
        }
    }

    if spec.repo.is_empty() || spec.exec.is_empty() {
        bail!("Usage: hotctl create <name> --repo <url> --exec <command> [options]");
    }
    if !proxy.match_rule.is_empty() || !proxy.upstream.is_empty() {
        spec.proxy = Some(proxy);
    }

    Ok(spec)
}

fn handle_service_command(client: &ApiClient, command: Command) -> Result<()> {
    match command {
        Command::List => {
            let body = client.call("GET", "/api/services", "")?;
            let services: Vec<ServiceSummary> =
                serde_json::from_str(&body).context("Failed to parse API response")?;

            if services.is_empty() {
                println!("No services. Create one with `hotctl create`.");
                return Ok(());
            }

            println!("{:<24} {:<14} {:>8}", "NAME", "STATUS", "RESTARTS");
            for service in services {
                println!(
                    "{:<24} {:<14} {:>8}",
                    service.name, service.status, service.restarts
                );
            }
        }
        Command::Info { name } => {
            let body = client.call("GET", &service_path(&name), "")?;
            let info: ServiceInfo =
                serde_json::from_str(&body).context("Failed to parse API response")?;

            println!("Service: {}", info.name);
            println!("  Status:   {}", info.status);
            println!("  Restarts: {}", info.restarts);
            if let Some(pid) = info.pid {
                println!("  PID:      {}", pid);
            }
            println!("  Path:     {}", info.path);
            println!("  Repo:     {}", info.config.repo);
            println!("  Exec:     {}", info.config.exec);
            if !info.config.build.is_empty() {
                println!("  Build:    {}", info.config.build);
            }
            println!(
                "  Restart:  {} (max {})",
                info.config.restart, info.config.max_restarts
            );
            if let Some(proxy) = &info.config.proxy {
                println!("  Proxy:    {} -> {}", proxy.match_rule, proxy.upstream);
            }
            println!("  Webhook:  {}", if info.config.secret.is_some() { "signed" } else { "open" });
            println!("  Log lines: {}", info.logs.len());
        }
        Command::Logs { name, live } => {
            let path = format!("{}/logs", service_path(&name));
            let mut seen = 0u64;
            loop {
                let body = client.call("GET", &path, "")?;
                let logs: ServiceLogs =
                    serde_json::from_str(&body).context("Failed to parse API response")?;

                for line in unseen(&logs.logs, logs.total, seen) {
                    println!("{}", line);
                }
                seen = seen.max(logs.total);

                if !live {
                    break;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        Command::Create(spec) => {
            println!("Creating service: {}", spec.name);
            let body = serde_json::to_string(&spec)?;
            client.call("POST", "/api/services", &body)?;
            println!("Service {} created and started", spec.name);
            if let Some(secret) = &spec.secret {
                if !secret.is_empty() {
                    println!();
                    println!("Webhook: POST /hooks/{} signed with X-Hub-Signature-256", spec.name);
                }
            }
        }
        Command::Delete { name } => {
            client.call("DELETE", &service_path(&name), "")?;
            println!("Service {} deleted", name);
        }
        Command::Action { name, action } => {
            let path = format!("{}/{}", service_path(&name), action);
            let body = client.call("GET", &path, "")?;
            let summary: ServiceSummary =
                serde_json::from_str(&body).context("Failed to parse API response")?;
            println!("{}: {} ({} restarts)", summary.name, summary.status, summary.restarts);
        }
        Command::Help | Command::Version | Command::Configure { .. } => {}
    }

    Ok(())
}

fn handle_configure(address: Option<String>, secret: Option<String>) -> Result<()> {
    let mut config = load_config()?;

    if address.is_none() && secret.is_none() {
        println!(
            "Address: {}",
            config.address.as_deref().unwrap_or(DEFAULT_ADDRESS)
        );
        println!(
            "Secret:  {}",
            if config.secret.is_some() { "(set)" } else { "(not set)" }
        );
        println!("Config:  {}", config_path().display());
        return Ok(());
    }

    if let Some(address) = address {
        config.address = Some(address);
    }
    if let Some(secret) = secret {
        config.secret = Some(secret);
    }
    save_config(&config)?;
    println!("Configuration saved to {}", config_path().display());

    Ok(())
}

fn print_help() {
    println!(
        r#"
hotctl - control a hotify deploy daemon

USAGE:
    hotctl <command> [options]

COMMANDS:
    list                     List services with status and restart count
    info <name>              Show service details
    logs <name> [--live]     Print captured output, optionally following it
    create <name>            Create and start a service
        --repo <url>             Git repository (required)
        --exec <command>         Command that runs the service (required)
        --build <command>        Command that builds the service
        --restart                Restart the service when it exits
        --max-restarts <n>       Restart limit
        --secret <secret>        Webhook secret
        --proxy-match <host>     Reverse proxy host match
        --proxy-upstream <addr>  Reverse proxy upstream
    delete <name>            Stop and remove a service
    start <name>             Start a service
    stop <name>              Stop a service
    update <name>            Pull, build and restart a service
    restart <name>           Restart a service

    configure [--address <host:port>] [--secret <secret>]
                             Show or save connection settings

    help                     Show this help
    version                  Show version

ENVIRONMENT:
    HOTIFY_ADDRESS           Overrides the configured address
    HOTIFY_SECRET            Overrides the configured secret
"#
    );
}

fn print_version() {
    println!("hotctl {}", env!("CARGO_PKG_VERSION"));
}

fn config_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hotify")
        .join("cli.json")
}

fn load_config() -> Result<CliConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(CliConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    let config: CliConfig =
        serde_json::from_str(&content).context("Failed to parse config file")?;

    Ok(config)
}

fn save_config(config: &CliConfig) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;

    Ok(())
}
