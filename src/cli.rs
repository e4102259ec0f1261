//! Library Vault CLI - client for the lending daemon
//!
//! Usage:
//!   library-cli check-out <set>              Borrow an account
//!   library-cli check-in <set> [accounts]    Return borrowed accounts
//!   library-cli status <set>                 Show who holds what
//!   library-cli set write <set> -a <account> Create or update a set
//!   library-cli creds <role>                 Read a static role's passwords
//!   library-cli health                       Check daemon health

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use library_vault::config::EngineConfig;
use library_vault::library::SetParams;
use library_vault::protocol::{Method, Request, Response, ResponseResult};
use library_vault::roles::RoleParams;

#[derive(Parser, Debug)]
#[command(name = "library-cli")]
#[command(author, version, about = "Library Vault CLI client", long_about = None)]
struct Args {
    /// Path to daemon socket
    #[arg(short, long, env = "LIBRARY_SOCKET")]
    socket: Option<PathBuf>,

    /// Client token, recorded as the borrower's token
    #[arg(short, long, env = "LIBRARY_TOKEN")]
    token: Option<String>,

    /// Entity id, recorded as the borrower
    #[arg(short, long, env = "LIBRARY_ENTITY")]
    entity: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Borrow any available account from a set
    CheckOut {
        set: String,
        /// Requested loan length in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Return accounts to a set
    CheckIn {
        set: String,
        /// Accounts to return (optional if you hold exactly one)
        accounts: Vec<String>,
        /// Return accounts borrowed by someone else
        #[arg(long)]
        force: bool,
    },

    /// Show the loan state of every account in a set
    Status { set: String },

    /// Extend a loan
    Renew {
        set: String,
        account: String,
        /// Seconds to extend by (defaults to the set TTL)
        #[arg(long)]
        increment: Option<u64>,
    },

    /// End a loan early
    Return { set: String, account: String },

    /// Set management
    Set {
        #[command(subcommand)]
        action: SetCommand,
    },

    /// Static role management
    Role {
        #[command(subcommand)]
        action: RoleCommand,
    },

    /// Read a static role's current and previous password
    Creds {
        role: String,
        /// Rotate first, even if the role's TTL hasn't passed
        #[arg(long)]
        rotate: bool,
    },

    /// Engine config management
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Rotate the directory bind password
    RotateRoot,

    /// Check daemon health
    Health,
}

#[derive(Subcommand, Debug)]
enum SetCommand {
    /// Create a set, or update the fields given
    Write {
        name: String,
        /// Member account (repeatable, replaces the member list)
        #[arg(short, long = "account", action = clap::ArgAction::Append)]
        accounts: Vec<String>,
        /// Loan length in seconds, 0 = unlimited
        #[arg(long)]
        ttl: Option<u64>,
        /// Longest renewal in seconds, 0 = unlimited
        #[arg(long)]
        max_ttl: Option<u64>,
        /// Let anyone check accounts in
        #[arg(long)]
        disable_check_in_enforcement: Option<bool>,
    },
    Read { name: String },
    Delete { name: String },
    List,
}

#[derive(Subcommand, Debug)]
enum RoleCommand {
    /// Create a role, or update the fields given
    Write {
        name: String,
        /// Account whose password the role rotates
        #[arg(short, long = "account")]
        account: Option<String>,
        /// Rotation period in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    Read { name: String },
    Delete { name: String },
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Show the engine config (passwords redacted)
    Read,
    /// Replace the engine config from a TOML file
    Write { path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let socket_path = args.socket.clone().unwrap_or_else(|| {
        std::env::var("XDG_RUNTIME_DIR")
            .map(|d| PathBuf::from(d).join("library-vault.sock"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/library-vault.sock"))
    });

    let token = args.token.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|h| h.join(".library-token"))
            .and_then(|f| std::fs::read_to_string(f).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    });

    let request = build_request(&args.command, &token)?.with_entity(args.entity.clone());

    let mut stream = match UnixStream::connect(&socket_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to connect to {}: {}", socket_path.display(), e);
            eprintln!("is the library-vault daemon running?");
            std::process::exit(1);
        }
    };

    stream.set_read_timeout(Some(Duration::from_secs(120)))?;
    stream.set_write_timeout(Some(Duration::from_secs(30)))?;

    let request_json = serde_json::to_string(&request)? + "\n";
    stream.write_all(request_json.as_bytes())?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: Response = serde_json::from_str(&response_line)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response)?;
    }

    if response.error.is_some() {
        std::process::exit(1);
    }

    Ok(())
}

fn build_request(command: &Command, token: &str) -> anyhow::Result<Request> {
    let id = format!("cli-{}", std::process::id());

    let request = match command {
        Command::CheckOut { set, ttl } => Request::check_out(id, token, set, *ttl),
        Command::CheckIn { set, accounts, force } => Request::check_in(id, token, set, accounts.clone(), *force),
        Command::Status { set } => Request::for_set(id, token, Method::Status, set),
        Command::Renew { set, account, increment } => {
            Request::for_account(id, token, Method::Renew, set, account, *increment)
        }
        Command::Return { set, account } => Request::for_account(id, token, Method::Return, set, account, None),
        Command::Set { action } => match action {
            SetCommand::Write {
                name,
                accounts,
                ttl,
                max_ttl,
                disable_check_in_enforcement,
            } => Request::write_set(
                id,
                token,
                name,
                SetParams {
                    service_account_names: (!accounts.is_empty()).then(|| accounts.clone()),
                    ttl: *ttl,
                    max_ttl: *max_ttl,
                    disable_check_in_enforcement: *disable_check_in_enforcement,
                },
            ),
            SetCommand::Read { name } => Request::for_set(id, token, Method::ReadSet, name),
            SetCommand::Delete { name } => Request::for_set(id, token, Method::DeleteSet, name),
            SetCommand::List => Request::simple(id, token, Method::ListSets),
        },
        Command::Role { action } => match action {
            RoleCommand::Write { name, account, ttl } => Request::write_role(
                id,
                token,
                name,
                RoleParams {
                    service_account_name: account.clone(),
                    ttl: *ttl,
                },
            ),
            RoleCommand::Read { name } => Request::for_role(id, token, Method::ReadRole, name),
            RoleCommand::Delete { name } => Request::for_role(id, token, Method::DeleteRole, name),
            RoleCommand::List => Request::simple(id, token, Method::ListRoles),
        },
        Command::Creds { role, rotate } => {
            let method = if *rotate { Method::RotateRole } else { Method::ReadCreds };
            Request::for_role(id, token, method, role)
        }
        Command::Config { action } => match action {
            ConfigCommand::Read => Request::simple(id, token, Method::ReadConfig),
            ConfigCommand::Write { path } => {
                let contents = std::fs::read_to_string(path)?;
                let engine: EngineConfig = toml::from_str(&contents)?;
                Request::write_config(id, token, engine)
            }
        },
        Command::RotateRoot => Request::simple(id, token, Method::RotateRoot),
        Command::Health => Request::simple(id, token, Method::Health),
    };

    Ok(request)
}

fn print_response(response: &Response) -> anyhow::Result<()> {
    if let Some(error) = &response.error {
        eprintln!("error: {} ({})", error.message, serde_json::to_string(&error.code)?.trim_matches('"'));
        return Ok(());
    }

    match &response.result {
        Some(ResponseResult::Lease(lease)) => {
            println!("account:   {}", lease.service_account_name);
            println!("password:  {}", lease.password);
            println!("ttl:       {}s", lease.ttl);
            println!("due:       {}", lease.due.to_rfc3339());
        }
        Some(ResponseResult::CheckIn(result)) => {
            if result.check_ins.is_empty() {
                eprintln!("nothing to check in");
            }
            for account in &result.check_ins {
                println!("checked in {account}");
            }
        }
        Some(ResponseResult::Status(status)) => {
            println!("{:<32} {:<10} {:<26} BORROWER", "ACCOUNT", "AVAILABLE", "DUE");
            for (account, s) in &status.accounts {
                println!(
                    "{:<32} {:<10} {:<26} {}",
                    account,
                    if s.available { "yes" } else { "no" },
                    s.due.map(|d| d.to_rfc3339()).unwrap_or_default(),
                    s.borrower_entity_id.as_deref().unwrap_or("")
                );
            }
        }
        Some(ResponseResult::Renewed(renewed)) => println!("due: {}", renewed.due.to_rfc3339()),
        Some(ResponseResult::Set(set)) => {
            println!("accounts: {}", set.service_account_names.join(", "));
            println!("ttl:      {}s", set.ttl);
            println!("max_ttl:  {}s", set.max_ttl);
            println!("check-in enforcement: {}", !set.disable_check_in_enforcement);
        }
        Some(ResponseResult::Config(engine)) => print!("{}", toml::to_string_pretty(engine)?),
        Some(ResponseResult::List(list)) => {
            if list.sets.is_empty() {
                eprintln!("no sets configured");
            }
            for set in &list.sets {
                println!("{set}");
            }
        }
        Some(ResponseResult::Health(health)) => {
            println!("status: {}", health.status);
            println!("role: {}", health.role);
            println!("uptime: {} seconds", health.uptime_seconds);
            println!("watched loans: {}", health.watched_accounts);
        }
        Some(ResponseResult::Role(role)) => {
            println!("role:     {}", role.name);
            println!("account:  {}", role.role.service_account_name);
            println!("ttl:      {}s", role.role.ttl);
            if let Some(at) = role.role.last_vault_rotation {
                println!("last rotated: {}", at.to_rfc3339());
            }
            if let Some(at) = role.role.password_last_set {
                println!("password last set: {}", at.to_rfc3339());
            }
        }
        Some(ResponseResult::Creds(creds)) => {
            println!("username:          {}", creds.username);
            println!("current_password:  {}", creds.current_password);
            if let Some(last) = &creds.last_password {
                println!("last_password:     {last}");
            }
        }
        Some(ResponseResult::RoleList(list)) => {
            if list.roles.is_empty() {
                eprintln!("no roles configured");
            }
            for role in &list.roles {
                println!("{role}");
            }
        }
        Some(ResponseResult::Ok(_)) => println!("ok"),
        None => eprintln!("unexpected response"),
    }

    Ok(())
}
