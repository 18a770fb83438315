use anyhow::{Context, bail};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use serde_json::json;
use std::time::Duration;
use whatsapp_auth_store::codec::{self, Value};
use whatsapp_auth_store::config::{DEFAULT_SESSION, DEFAULT_TABLE_NAME};
use whatsapp_auth_store::store::{self, AuthState, CredentialBackend as _, LogicalId};
use whatsapp_auth_store::types::SignalDataType;
use whatsapp_auth_store::StoreConfig;

// Inspection and maintenance tool for stored auth state.
//
// Usage:
//   whatsapp-auth-store --db auth.db init
//   whatsapp-auth-store --engine redb --db auth.redb show-creds
//   whatsapp-auth-store get pre-key 1 2 3
//   whatsapp-auth-store gc-tables --keep-prefix bot_ --yes

#[derive(Parser)]
#[command(name = "whatsapp-auth-store")]
#[command(about = "Inspect and maintain persisted WhatsApp auth state")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Engine::Sqlite, env = "AUTH_STORE_ENGINE")]
    engine: Engine,

    /// SQLite URL or redb file path.
    #[arg(long = "db", default_value = "whatsapp-auth.db", env = "AUTH_STORE_DB")]
    database_url: String,

    #[arg(long, default_value = DEFAULT_TABLE_NAME, env = "AUTH_STORE_TABLE")]
    table: String,

    #[arg(long, default_value = DEFAULT_SESSION, env = "AUTH_STORE_SESSION")]
    session: String,

    /// Expiry window in seconds, 0 disables expiry.
    #[arg(long, default_value_t = 24 * 60 * 60, env = "AUTH_STORE_RETENTION_SECS")]
    retention_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    Sqlite,
    Redb,
}

#[derive(Subcommand)]
enum Commands {
    /// Creates the schema and persists fresh credentials if none are stored.
    Init,
    /// Prints the public part of the stored credentials.
    ShowCreds,
    /// Prints the stored values of one category.
    Get {
        category: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Deletes every key of the session except its credentials.
    ClearKeys,
    /// Deletes every row of the session, credentials included.
    RemoveAll,
    /// Physically deletes expired rows of the session.
    PurgeExpired,
    /// Lists the rows of the session.
    Scan,
    /// Drops SQLite tables that are neither the store's table nor start with the prefix.
    GcTables {
        #[arg(long)]
        keep_prefix: String,
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        let retention = (self.retention_secs > 0).then(|| Duration::from_secs(self.retention_secs));
        StoreConfig::new(self.database_url.clone())
            .with_table_name(self.table.clone())
            .with_session(self.session.clone())
            .with_retention(retention)
            .with_purge_on_open(false)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.store_config();

    if let Commands::GcTables { keep_prefix, yes } = &cli.command {
        if cli.engine != Engine::Sqlite {
            bail!("gc-tables is only supported by the sqlite engine");
        }
        if !yes {
            bail!("gc-tables drops tables permanently, pass --yes to confirm");
        }
        let sqlite = store::open_sqlite_store(&config).await?;
        let dropped = sqlite.drop_unrelated_tables(keep_prefix).await?;
        for table in &dropped {
            info!("Dropped table {table}");
        }
        info!("Dropped {} tables", dropped.len());
        return Ok(());
    }

    let state = match cli.engine {
        Engine::Sqlite => store::open_sqlite(&config).await,
        Engine::Redb => store::open_redb(&config).await,
    }
    .with_context(|| format!("Failed to open auth state at {}", config.database_url))?;

    let outcome = execute(&state, cli.command).await;
    state.close().await?;
    outcome
}

async fn execute(state: &AuthState, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            if state.query(&LogicalId::Creds).await?.is_some() {
                info!("Credentials already stored for session {}", state.session());
            } else {
                state.save_creds().await?;
                info!("Stored new credentials for session {}", state.session());
            }
        }
        Commands::ShowCreds => {
            if state.query(&LogicalId::Creds).await?.is_none() {
                warn!("No credentials stored for session {}", state.session());
                return Ok(());
            }
            let creds = state.creds().await;
            let summary = json!({
                "registrationId": creds.registration_id,
                "registered": creds.registered,
                "noiseKey": codec::encode(&Value::Bytes(creds.noise_key.public.clone()))?,
                "signedIdentityKey": codec::encode(&Value::Bytes(creds.signed_identity_key.public.clone()))?,
                "signedPreKeyId": creds.signed_pre_key.key_id,
                "nextPreKeyId": creds.next_pre_key_id,
                "firstUnuploadedPreKeyId": creds.first_unuploaded_pre_key_id,
                "deviceId": creds.device_id,
                "phoneId": creds.phone_id,
                "me": creds.me.as_ref().map(|me| &me.id),
                "platform": creds.platform,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Get { category, ids } => {
            let Some(category) = SignalDataType::parse(&category) else {
                let known: Vec<_> = SignalDataType::ALL.iter().map(|ty| ty.as_str()).collect();
                bail!("unknown category {category}, expected one of {}", known.join(", "));
            };
            let found = state.get(category, &ids).await?;
            for id in &ids {
                match found.get(id) {
                    Some(value) => {
                        let encoded = codec::encode(&value.to_value()?)?;
                        println!("{id}\t{encoded}");
                    }
                    None => println!("{id}\t<absent>"),
                }
            }
        }
        Commands::ClearKeys => {
            let removed = state.clear_keys().await?;
            info!("Removed {removed} keys from session {}", state.session());
        }
        Commands::RemoveAll => {
            let removed = state.clear_all().await?;
            info!("Removed {removed} rows from session {}", state.session());
        }
        Commands::PurgeExpired => {
            let purged = state.backend().purge_expired(state.session()).await?;
            info!("Purged {purged} expired rows from session {}", state.session());
        }
        Commands::Scan => {
            let retention = state.backend().retention();
            let now = store::now_ms();
            for row in state.backend().scan_session(state.session()).await? {
                let status = if retention.is_expired(row.timestamp, now) {
                    "expired"
                } else {
                    "live"
                };
                println!("{}\t{}\t{}", row.id, row.timestamp, status);
            }
        }
        Commands::GcTables { .. } => bail!("gc-tables does not operate on a session"),
    }
    Ok(())
}
