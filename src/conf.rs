use std::{
    fmt::Debug,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context;

pub static GLOBAL: LazyLock<Arc<Conf>> = LazyLock::new(|| {
    let conf = read_or_create_default().unwrap_or_else(|error| {
        panic!("Failed to initialize global config: {error:?}")
    });
    Arc::new(conf)
});

#[must_use]
pub fn global() -> Arc<Conf> {
    (*GLOBAL).clone()
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Conf {
    #[serde(
        serialize_with = "serialize_log_level",
        deserialize_with = "deserialize_log_level"
    )]
    pub log_level: tracing::Level,
    pub addr: IpAddr,
    pub port: u16,
    pub db_file: PathBuf,
    pub sqlite_busy_timeout: f32,
    pub cors_origins: Vec<String>,
    pub jwt: ConfJwt,
    pub provider: ConfProvider,
    pub pricing: ConfPricing,
    pub ledger: ConfLedger,
    pub stripe: ConfStripe,
    pub tls: Option<Tls>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            addr: "127.0.0.1".parse().unwrap_or_else(|_| {
                unreachable!("Fat-fingered default IP address!")
            }),
            port: 3001,
            db_file: PathBuf::from("data/data.db"),
            sqlite_busy_timeout: 60.0,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "https://localhost:3000".to_string(),
            ],
            jwt: ConfJwt::default(),
            provider: ConfProvider::default(),
            pricing: ConfPricing::default(),
            ledger: ConfLedger::default(),
            stripe: ConfStripe::default(),
            tls: None,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Tls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ConfJwt {
    pub secret: String,
    pub audience: String,
    pub issuer: String,
}

impl Default for ConfJwt {
    fn default() -> Self {
        Self {
            secret: "super-secret".to_string(),
            audience: "authenticated".to_string(),
            issuer: "creditgate".to_string(),
        }
    }
}

impl Debug for ConfJwt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfJwt")
            .field("secret", &"<XXXXX>")
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish()
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ConfProvider {
    pub base_url: String,
    pub api_key: String,
    /// Seconds between status polls.
    pub poll_interval: f32,
    /// Seconds to wait for a job when the tool does not set its own limit.
    pub default_timeout: f32,
    /// Seconds any single HTTP request to the provider may take.
    pub request_timeout: f32,
    pub connect_timeout: f32,
}

impl Default for ConfProvider {
    fn default() -> Self {
        Self {
            base_url: "https://queue.fal.run".to_string(),
            api_key: String::new(),
            poll_interval: 2.0,
            default_timeout: 120.0,
            request_timeout: 30.0,
            connect_timeout: 10.0,
        }
    }
}

impl Debug for ConfProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"<XXXXX>")
            .field("poll_interval", &self.poll_interval)
            .field("default_timeout", &self.default_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConfProvider {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f32(self.poll_interval)
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.default_timeout)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.request_timeout)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.connect_timeout)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct ConfPricing {
    /// Multiplier applied to the provider's base cost.
    pub markup: f64,
    pub credit_price_usd: f64,
    pub min_credits: i64,
}

impl Default for ConfPricing {
    fn default() -> Self {
        Self {
            markup: 1.5,
            credit_price_usd: 0.01,
            min_credits: 1,
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct ConfLedger {
    pub signup_credits: i64,
    /// Seconds after which an unsettled reservation is refunded. Must exceed
    /// the longest tool timeout.
    pub reservation_ttl: f32,
    pub reconcile_interval: f32,
    pub history_limit: u32,
}

impl Default for ConfLedger {
    fn default() -> Self {
        Self {
            signup_credits: 0,
            reservation_ttl: 900.0,
            reconcile_interval: 60.0,
            history_limit: 50,
        }
    }
}

impl ConfLedger {
    #[must_use]
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs_f32(self.reservation_ttl)
    }

    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs_f32(self.reconcile_interval)
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ConfStripe {
    pub webhook_secret: String,
    /// Max age, in seconds, of a signed webhook timestamp.
    pub tolerance: u64,
}

impl Default for ConfStripe {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            tolerance: 300,
        }
    }
}

impl Debug for ConfStripe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfStripe")
            .field("webhook_secret", &"<XXXXX>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

fn serialize_log_level<S>(
    level: &tracing::Level,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = level.to_string();
    serializer.serialize_str(&s)
}

fn deserialize_log_level<'de, D>(
    deserializer: D,
) -> Result<tracing::Level, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let s = String::deserialize(deserializer)?;
    tracing::Level::from_str(&s).map_err(serde::de::Error::custom)
}

pub fn read_or_create_default() -> anyhow::Result<Conf> {
    let path = "conf/conf.toml";
    read_or_create_default_(path).context(path)
}

pub fn read_or_create_default_<P: AsRef<Path>>(
    path: P,
) -> anyhow::Result<Conf> {
    let path = path.as_ref();
    let conf = if fs::exists(path)? {
        let s = fs::read_to_string(path)?;
        toml::from_str(&s)?
    } else {
        if let Some(parent) = path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for conf file: {path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let conf = Conf::default();
        let s = toml::to_string_pretty(&conf)?;
        fs::write(path, s)?;
        conf
    };
    Ok(conf)
}
