use anyhow::{anyhow, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use config::{Config, File as ConfigFile};
use masque_identity::{IdentityConfig, IdentityService, MappedActorDirectory};
use masque_storage::{MemoryStorage, SledStorage, Storage};
use masque_types::{ActorId, HandleId};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod audit;
mod version;

use audit::TracingAuditSink;
use version::{git_commit_hash, MASQUE_VERSION};

const DEFAULT_CONFIG_PATH: &str = "config/masque.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageBackend {
    Sled,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow!("Unknown storage backend '{other}' (expected sled or memory)")),
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Sled => f.write_str("sled"),
            StorageBackend::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone)]
struct AppConfig {
    config_path: Option<PathBuf>,
    data_dir: String,
    storage: StorageBackend,
    reserved_handles: Vec<String>,
    lock_timeout_ms: u64,
    audit_post_retries: u32,
    /// External chat user id → actor id.
    actors: Vec<(String, String)>,
    log_level: String,
    log_format: String,
}

impl AppConfig {
    fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|path| path.exists())
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("MASQUE"));
        let config = builder.build()?;

        let defaults = IdentityConfig::default();
        let storage = match get_string_value(&config, &["storage", "storage.backend"]) {
            Some(value) => value.parse()?,
            None => StorageBackend::Sled,
        };
        let actors = get_list_value(&config, &["actors", "directory.actors"])
            .iter()
            .map(|entry| parse_actor_pair(entry))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config_path: resolved_path,
            data_dir: get_string_value(&config, &["data_dir", "storage.data_dir"])
                .unwrap_or_else(|| "./data/masque".to_string()),
            storage,
            reserved_handles: get_list_value(
                &config,
                &["reserved_handles", "identity.reserved_handles"],
            ),
            lock_timeout_ms: get_u64_value(
                &config,
                &["lock_timeout_ms", "identity.lock_timeout_ms"],
                defaults.lock_timeout_ms,
            )?,
            audit_post_retries: get_u64_value(
                &config,
                &["audit_post_retries", "identity.audit_post_retries"],
                u64::from(defaults.audit_post_retries),
            )?
            .try_into()
            .map_err(|_| anyhow!("audit_post_retries is out of range"))?,
            actors,
            log_level: get_string_value(&config, &["log_level", "logging.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["log_format", "logging.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.storage == StorageBackend::Sled && self.data_dir.trim().is_empty() {
            anyhow::bail!("DATA_DIR must not be empty when using sled storage");
        }
        if self.lock_timeout_ms == 0 {
            anyhow::bail!("LOCK_TIMEOUT_MS must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("LOG_FORMAT must be json or pretty, got '{}'", self.log_format);
        }
        Ok(())
    }

    fn identity(&self) -> IdentityConfig {
        IdentityConfig {
            reserved_handles: self.reserved_handles.clone(),
            lock_timeout_ms: self.lock_timeout_ms,
            audit_post_retries: self.audit_post_retries,
        }
    }

    fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("db")
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_u64_value(config: &Config, keys: &[&str], default: u64) -> Result<u64> {
    for key in keys {
        if let Ok(value) = config.get_int(key) {
            return u64::try_from(value).map_err(|_| anyhow!("{key} must not be negative"));
        }
        if let Some(raw) = get_string_value(config, &[*key]) {
            return raw
                .parse::<u64>()
                .map_err(|err| anyhow!("{key} must be a number: {err}"));
        }
    }
    Ok(default)
}

/// A list given either as a TOML array or as a comma separated string.
fn get_list_value(config: &Config, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Ok(values) = config.get_array(key) {
            return values
                .into_iter()
                .filter_map(|value| value.into_string().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect();
        }
        if let Some(raw) = get_string_value(config, &[*key]) {
            return raw
                .split(',')
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect();
        }
    }
    Vec::new()
}

fn parse_actor_pair(entry: &str) -> Result<(String, String)> {
    match entry.split_once('=') {
        Some((user, actor)) if !user.trim().is_empty() && !actor.trim().is_empty() => {
            Ok((user.trim().to_string(), actor.trim().to_string()))
        }
        _ => Err(anyhow!("Invalid actor mapping '{entry}' (expected external_user=actor)")),
    }
}

fn load_config_with_overrides(matches: &ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &ArgMatches, config: &mut AppConfig) -> Result<()> {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = data_dir.clone();
    }
    if let Some(storage) = matches.get_one::<String>("storage") {
        config.storage = storage.parse()?;
    }
    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }
    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }
    Ok(())
}

fn cli() -> Command {
    let actor_args = [
        Arg::new("actor")
            .long("actor")
            .value_name("ACTOR")
            .help("Actor issuing the command"),
        Arg::new("user")
            .long("user")
            .value_name("USER_ID")
            .conflicts_with("actor")
            .help("External chat user id, resolved through the actor directory"),
    ];

    Command::new("masque-node")
        .version(MASQUE_VERSION)
        .about("Masque identity and ledger service")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory")
                .global(true),
        )
        .arg(
            Arg::new("storage")
                .long("storage")
                .value_name("BACKEND")
                .value_parser(["sled", "memory"])
                .help("Storage backend")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .subcommand(
            Command::new("register")
                .about("Register an actor with its base handle")
                .args(actor_args.clone())
                .arg(Arg::new("handle").required(true).help("Base handle")),
        )
        .subcommand(
            Command::new("handle")
                .about("Show, switch to or create a handle")
                .args(actor_args.clone())
                .arg(Arg::new("name").help("Handle to switch to"))
                .arg(
                    Arg::new("burner")
                        .long("burner")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("npc")
                        .help("Create or switch to a burner handle"),
                )
                .arg(
                    Arg::new("npc")
                        .long("npc")
                        .action(ArgAction::SetTrue)
                        .help("Create or switch to an NPC handle"),
                ),
        )
        .subcommand(
            Command::new("burn")
                .about("Destroy a burner handle")
                .args(actor_args.clone())
                .arg(Arg::new("name").help("Burner handle to destroy")),
        )
        .subcommand(
            Command::new("pay")
                .about("Pay from the active handle")
                .args(actor_args.clone())
                .arg(Arg::new("recipient").required(true).help("Recipient handle"))
                .arg(
                    Arg::new("amount")
                        .required(true)
                        .value_parser(value_parser!(u64))
                        .help("Amount to transfer"),
                ),
        )
        .subcommand(
            Command::new("balance")
                .about("Balances of every handle of an actor")
                .args(actor_args.clone()),
        )
        .subcommand(
            Command::new("collect")
                .about("Move all funds into the active handle")
                .args(actor_args),
        )
        .subcommand(
            Command::new("set-balance")
                .about("Override the balance of a handle")
                .arg(Arg::new("handle").required(true))
                .arg(
                    Arg::new("amount")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("add-funds")
                .about("Credit a handle from the system")
                .arg(Arg::new("handle").required(true))
                .arg(
                    Arg::new("amount")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("remove-handle")
                .about("Remove a handle and its balance without rescue")
                .arg(Arg::new("handle").required(true)),
        )
        .subcommand(
            Command::new("clear-all")
                .about("Delete every actor, handle and balance")
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .action(ArgAction::SetTrue)
                        .help("Confirm the deletion"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;
    init_logging(&config)?;
    info!(
        version = MASQUE_VERSION,
        commit = git_commit_hash(),
        storage = %config.storage,
        config = ?config.config_path,
        "Starting masque-node"
    );

    let (storage, service) = build_service(&config)?;
    let output = run_command(&service, &matches).await;
    storage.flush()?;
    println!("{}", output?);
    Ok(())
}

fn build_service(config: &AppConfig) -> Result<(Arc<dyn Storage>, IdentityService)> {
    let storage: Arc<dyn Storage> = match config.storage {
        StorageBackend::Sled => {
            let path = config.db_path();
            fs::create_dir_all(&path)?;
            debug!(path = %path.display(), "Opening sled storage");
            Arc::new(SledStorage::new(&path)?)
        }
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    };
    let directory = MappedActorDirectory::from_pairs(config.actors.iter().cloned());
    let service = IdentityService::new(
        storage.clone(),
        Arc::new(TracingAuditSink::new()),
        config.identity(),
    )
    .with_directory(Arc::new(directory));
    Ok((storage, service))
}

async fn run_command(service: &IdentityService, matches: &ArgMatches) -> Result<String> {
    let Some((name, sub)) = matches.subcommand() else {
        anyhow::bail!("No command given");
    };
    match name {
        "register" => {
            let actor = resolve_actor(service, sub).await?;
            let (handle_id, _) = HandleId::normalize(required(sub, "handle")?)?;
            let handle = service
                .register_actor(&actor, &handle_id)
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            Ok(format!("Registered {actor} as **{}**.", handle.handle_id))
        }
        "handle" => {
            let actor = resolve_actor(service, sub).await?;
            let name = sub.get_one::<String>("name").map(String::as_str);
            Ok(service
                .process_handle_command(&actor, name, sub.get_flag("burner"), sub.get_flag("npc"))
                .await)
        }
        "burn" => {
            let actor = resolve_actor(service, sub).await?;
            let name = sub.get_one::<String>("name").map(String::as_str);
            Ok(service.process_burn_command(&actor, name).await)
        }
        "pay" => {
            let actor = resolve_actor(service, sub).await?;
            let recipient = sub.get_one::<String>("recipient").map(String::as_str);
            let amount = *sub
                .get_one::<u64>("amount")
                .ok_or_else(|| anyhow!("amount is required"))?;
            let tx = service.try_to_pay(&actor, recipient, amount, false).await;
            Ok(tx.report.unwrap_or_default())
        }
        "balance" => {
            let actor = resolve_actor(service, sub).await?;
            Ok(service.get_all_handles_balance_report(&actor))
        }
        "collect" => {
            let actor = resolve_actor(service, sub).await?;
            Ok(service.process_collect_command(&actor).await)
        }
        "set-balance" => {
            let (handle_id, _) = HandleId::normalize(required(sub, "handle")?)?;
            let amount = required_amount(sub)?;
            service
                .adjust_balance(&handle_id, amount)
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            Ok(format!("Balance of {handle_id} set to ¥ {amount}."))
        }
        "add-funds" => {
            let (handle_id, _) = HandleId::normalize(required(sub, "handle")?)?;
            let amount = required_amount(sub)?;
            let balance = service
                .add_funds(&handle_id, amount)
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            Ok(format!("Added ¥ {amount} to {handle_id}; balance is now ¥ {balance}."))
        }
        "remove-handle" => {
            let handle = required(sub, "handle")?;
            service
                .remove_handle(handle)
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            Ok(format!("Removed handle {}.", handle.trim().to_lowercase()))
        }
        "clear-all" => {
            if !sub.get_flag("yes") {
                anyhow::bail!("Refusing to clear all handles without --yes");
            }
            service
                .clear_all_handles()
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            Ok("All handles cleared.".to_string())
        }
        other => Err(anyhow!("Unknown command {other}")),
    }
}

async fn resolve_actor(service: &IdentityService, matches: &ArgMatches) -> Result<ActorId> {
    if let Some(actor) = matches.get_one::<String>("actor") {
        return Ok(ActorId::new(actor.trim()));
    }
    if let Some(user) = matches.get_one::<String>("user") {
        return service
            .actor_for_user(user)
            .await
            .map_err(|err| anyhow!("{err}"));
    }
    anyhow::bail!("Either --actor or --user is required")
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{id} is required"))
}

fn required_amount(matches: &ArgMatches) -> Result<u64> {
    matches
        .get_one::<u64>("amount")
        .copied()
        .ok_or_else(|| anyhow!("amount is required"))
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture_config() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("config")
            .join("masque.toml")
    }

    fn memory_config() -> AppConfig {
        AppConfig {
            config_path: None,
            data_dir: String::new(),
            storage: StorageBackend::Memory,
            reserved_handles: vec!["gm".to_string()],
            lock_timeout_ms: 1_000,
            audit_post_retries: 0,
            actors: vec![("42".to_string(), "p1".to_string())],
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }

    #[test]
    fn sample_config_loads() {
        let path = fixture_config();
        let config = AppConfig::load(Some(path.to_str().unwrap())).unwrap();

        assert_eq!(config.storage, StorageBackend::Sled);
        assert_eq!(config.data_dir, "./data/masque");
        assert_eq!(config.lock_timeout_ms, 60_000);
        assert_eq!(config.audit_post_retries, 3);
        assert!(config.reserved_handles.contains(&"eclipse".to_string()));
        assert_eq!(
            config.actors,
            vec![("100000000000000001".to_string(), "gm".to_string())]
        );
        config.validate().unwrap();
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = AppConfig::load(Some("/nonexistent/masque.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"), "unexpected error: {err}");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = memory_config();
        config.lock_timeout_ms = 0;
        assert!(config.validate().unwrap_err().to_string().contains("LOCK_TIMEOUT_MS"));

        let mut config = memory_config();
        config.log_format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = memory_config();
        config.storage = StorageBackend::Sled;
        assert!(config.validate().is_err());
    }

    #[test]
    fn actor_pairs_parse() {
        assert_eq!(
            parse_actor_pair(" 42 = p1 ").unwrap(),
            ("42".to_string(), "p1".to_string())
        );
        assert!(parse_actor_pair("missing-separator").is_err());
        assert!(parse_actor_pair("=p1").is_err());
    }

    #[tokio::test]
    async fn commands_run_against_memory_storage() {
        let (_, service) = build_service(&memory_config()).unwrap();
        let run = |args: &[&str]| {
            let mut argv = vec!["masque-node"];
            argv.extend_from_slice(args);
            cli().try_get_matches_from(argv).unwrap()
        };

        let out = run_command(&service, &run(&["register", "--user", "42", "alice"]))
            .await
            .unwrap();
        assert_eq!(out, "Registered p1 as **alice**.");

        run_command(&service, &run(&["add-funds", "alice", "20"])).await.unwrap();
        let out = run_command(&service, &run(&["handle", "--actor", "p1", "--burner", "mask"]))
            .await
            .unwrap();
        assert!(out.starts_with("Switched to new burner handle **mask**"));

        let out = run_command(&service, &run(&["balance", "--actor", "p1"]))
            .await
            .unwrap();
        assert!(out.ends_with("Total: ¥ **20**"));

        let out = run_command(&service, &run(&["pay", "--actor", "p1", "alice", "5"]))
            .await
            .unwrap();
        assert!(out.contains("current balance is ¥ **0**"));

        assert!(run_command(&service, &run(&["clear-all"])).await.is_err());
        run_command(&service, &run(&["clear-all", "--yes"])).await.unwrap();
    }

    #[tokio::test]
    async fn sled_backend_opens_under_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = memory_config();
        config.storage = StorageBackend::Sled;
        config.data_dir = dir.path().to_string_lossy().to_string();
        let (storage, service) = build_service(&config).unwrap();
        service
            .register_actor(&ActorId::new("p1"), &HandleId::parse("alice").unwrap())
            .await
            .unwrap();
        storage.flush().unwrap();
        assert!(dir.path().join("db").exists());
    }
}
