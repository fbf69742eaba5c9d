//! Configuration module for billing-service.

use crate::models::BillingStatus;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub billing: BillingPolicyConfig,
    /// Register mock adapters for every provider (local development).
    pub mock_providers: bool,
    pub stripe: Option<StripeConfig>,
    pub paypal: Option<PaypalConfig>,
    pub authorize_net: Option<AuthorizeNetConfig>,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Postgres(DatabaseConfig),
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub concurrency: usize,
    pub lease_duration: Duration,
    pub worker_id: String,
}

#[derive(Debug, Clone)]
pub struct BillingPolicyConfig {
    pub max_retry_attempts: i32,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Status applied once retries are exhausted: suspended or cancelled.
    pub exhaustion_status: BillingStatus,
    pub membership_grace_days: i64,
    /// In-call retries for transient provider errors.
    pub provider_call_retries: u32,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub webhook_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct AuthorizeNetConfig {
    pub api_login_id: String,
    pub transaction_key: Secret<String>,
    pub signature_key: Secret<String>,
    pub api_url: String,
    pub duplicate_window_secs: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(60),
            batch_size: 50,
            concurrency: 8,
            lease_duration: Duration::from_secs(300),
            worker_id: format!("billing-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

impl Default for BillingPolicyConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_initial: Duration::from_secs(24 * 3600),
            retry_max: Duration::from_secs(7 * 24 * 3600),
            exhaustion_status: BillingStatus::Suspended,
            membership_grace_days: 3,
            provider_call_retries: 2,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("Invalid value for {}: {}", name, raw))
        }),
        _ => Ok(default),
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &str, group: &str) -> Result<String, AppError> {
    non_empty(name).ok_or_else(|| {
        AppError::ConfigError(anyhow::anyhow!("{} is required when {} is configured", name, group))
    })
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let storage = match non_empty("STORAGE_BACKEND").as_deref().unwrap_or("postgres") {
            "postgres" => StorageConfig::Postgres(DatabaseConfig {
                url: Secret::new(non_empty("DATABASE_URL").ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_var("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            "memory" => StorageConfig::Memory,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORAGE_BACKEND must be postgres or memory, got {}",
                    other
                )))
            }
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: parse_var("SCHEDULER_ENABLED", scheduler_defaults.enabled)?,
            poll_interval: Duration::from_secs(parse_var("SCHEDULER_POLL_INTERVAL_SECS", 60)?),
            batch_size: parse_var("SCHEDULER_BATCH_SIZE", scheduler_defaults.batch_size)?,
            concurrency: parse_var("SCHEDULER_CONCURRENCY", scheduler_defaults.concurrency)?,
            lease_duration: Duration::from_secs(parse_var("SCHEDULER_LEASE_SECS", 300)?),
            worker_id: non_empty("SCHEDULER_WORKER_ID").unwrap_or(scheduler_defaults.worker_id),
        };
        if scheduler.batch_size < 1 || scheduler.concurrency < 1 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SCHEDULER_BATCH_SIZE and SCHEDULER_CONCURRENCY must be at least 1"
            )));
        }

        let exhaustion_status = match non_empty("BILLING_EXHAUSTION_ACTION")
            .as_deref()
            .unwrap_or("suspend")
        {
            "suspend" | "suspended" => BillingStatus::Suspended,
            "cancel" | "cancelled" => BillingStatus::Cancelled,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "BILLING_EXHAUSTION_ACTION must be suspend or cancel, got {}",
                    other
                )))
            }
        };

        let billing = BillingPolicyConfig {
            max_retry_attempts: parse_var("BILLING_MAX_RETRY_ATTEMPTS", 3)?,
            retry_initial: Duration::from_secs(parse_var::<u64>("BILLING_RETRY_INITIAL_HOURS", 24)? * 3600),
            retry_max: Duration::from_secs(parse_var::<u64>("BILLING_RETRY_MAX_HOURS", 168)? * 3600),
            exhaustion_status,
            membership_grace_days: parse_var("MEMBERSHIP_GRACE_DAYS", 3)?,
            provider_call_retries: parse_var("BILLING_PROVIDER_CALL_RETRIES", 2)?,
        };
        if billing.max_retry_attempts < 1 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_MAX_RETRY_ATTEMPTS must be at least 1"
            )));
        }

        let stripe = match non_empty("STRIPE_SECRET_KEY") {
            Some(secret_key) => Some(StripeConfig {
                secret_key: Secret::new(secret_key),
                webhook_secret: Secret::new(required("STRIPE_WEBHOOK_SECRET", "Stripe")?),
                api_base: non_empty("STRIPE_API_BASE")
                    .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            }),
            None => None,
        };

        let paypal = match non_empty("PAYPAL_CLIENT_ID") {
            Some(client_id) => Some(PaypalConfig {
                client_id,
                client_secret: Secret::new(required("PAYPAL_CLIENT_SECRET", "PayPal")?),
                webhook_id: required("PAYPAL_WEBHOOK_ID", "PayPal")?,
                api_base: non_empty("PAYPAL_API_BASE")
                    .unwrap_or_else(|| "https://api-m.paypal.com".to_string()),
            }),
            None => None,
        };

        let authorize_net = match non_empty("AUTHORIZE_NET_API_LOGIN_ID") {
            Some(api_login_id) => Some(AuthorizeNetConfig {
                api_login_id,
                transaction_key: Secret::new(required("AUTHORIZE_NET_TRANSACTION_KEY", "Authorize.Net")?),
                signature_key: Secret::new(required("AUTHORIZE_NET_SIGNATURE_KEY", "Authorize.Net")?),
                api_url: non_empty("AUTHORIZE_NET_API_URL")
                    .unwrap_or_else(|| "https://api.authorize.net/xml/v1/request.api".to_string()),
                duplicate_window_secs: parse_var("AUTHORIZE_NET_DUPLICATE_WINDOW_SECS", 28800)?,
            }),
            None => None,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "billing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: non_empty("OTLP_ENDPOINT"),
            storage,
            scheduler,
            billing,
            mock_providers: parse_var("BILLING_MOCK_PROVIDERS", false)?,
            stripe,
            paypal,
            authorize_net,
        })
    }

    /// In-memory configuration with no providers and the scheduler off.
    pub fn for_memory() -> Self {
        Self {
            common: core_config::Config::default(),
            service_name: "billing-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            storage: StorageConfig::Memory,
            scheduler: SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            },
            billing: BillingPolicyConfig::default(),
            mock_providers: false,
            stripe: None,
            paypal: None,
            authorize_net: None,
        }
    }
}
