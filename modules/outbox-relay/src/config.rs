use outbox::OutboxConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Connection pool limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

impl DbPoolConfig {
    /// `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS`, `DB_ACQUIRE_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let pool = Self {
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            acquire_timeout: Duration::from_secs(env_or(
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )?),
        };
        pool.validate()?;
        Ok(pool)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("DB_MAX_CONNECTIONS must be at least 1".to_string());
        }
        if self.min_connections > self.max_connections {
            return Err(format!(
                "DB_MIN_CONNECTIONS ({}) exceeds DB_MAX_CONNECTIONS ({})",
                self.min_connections, self.max_connections
            ));
        }
        Ok(())
    }
}

/// Relay configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub database_url: String,
    pub pool: DbPoolConfig,
    pub nats_url: Option<String>,
    /// Publish through JetStream and wait for broker acks
    pub nats_jetstream: bool,
    /// When set, the relay also consumes its own events under this service
    /// name and records them in the ledger
    pub ledger_service_name: Option<String>,
    /// Ledger rows older than this are purged; zero disables the sweeper
    pub ledger_retention: Duration,
    pub ledger_sweep_interval: Duration,
    pub outbox: OutboxConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let nats_url = match bus_type {
            BusType::Nats => Some(
                env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        let nats_jetstream = match env::var("NATS_JETSTREAM") {
            Ok(raw) => parse_bool(&raw)
                .ok_or_else(|| format!("NATS_JETSTREAM must be true or false, got '{raw}'"))?,
            Err(_) => false,
        };

        let ledger_service_name = env::var("LEDGER_SERVICE_NAME")
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        let ledger_retention = retention_from_days(env_or("LEDGER_RETENTION_DAYS", 30)?)?;
        let sweep_interval_secs: u64 = env_or("LEDGER_SWEEP_INTERVAL_SECS", 3600)?;

        Ok(Self {
            bus_type,
            database_url,
            pool: DbPoolConfig::from_env()?,
            nats_url,
            nats_jetstream,
            ledger_service_name,
            ledger_retention,
            ledger_sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
            outbox: OutboxConfig::from_env()?,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => parse_number(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("{key} must be a valid number, got '{raw}'"))
}

fn retention_from_days(days: u64) -> Result<Duration, String> {
    days.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("LEDGER_RETENTION_DAYS is too large: {days}"))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
