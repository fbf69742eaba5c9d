//! Payment provider identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A third-party payment processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Stripe,
    Paypal,
    AuthorizeNet,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Stripe, Provider::Paypal, Provider::AuthorizeNet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::Paypal => "paypal",
            Provider::AuthorizeNet => "authorize_net",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Provider::Stripe),
            "paypal" => Ok(Provider::Paypal),
            "authorize_net" => Ok(Provider::AuthorizeNet),
            other => Err(anyhow::anyhow!("Unknown payment provider: {}", other)),
        }
    }
}
