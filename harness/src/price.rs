//! USD-denominated amounts.
//!
//! Tests size positions in dollars so magnitudes stay meaningful as prices
//! move. [`AmountConverter`] turns a USD notional into token base units using a
//! [`PriceFeed`]; a missing or non-positive price is an error, never a default.

use crate::assets::AssetBook;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use ethers::types::U256;
use ethers::utils::{format_units, parse_units, ParseUnits};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Fixed-point scale used for USD notionals and prices
const USD_DECIMALS: u32 = 18;

/// Source of USD unit prices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Decimal USD price of one whole `symbol` token
    async fn unit_price_usd(&self, symbol: &str) -> Result<String>;
}

/// Prices fixed up front, typically from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticPriceTable {
    prices: HashMap<String, String>,
}

impl StaticPriceTable {
    /// Build a table from `symbol -> price` pairs
    pub fn new(prices: HashMap<String, String>) -> Self {
        Self { prices }
    }

    /// Set one price
    pub fn with_price(mut self, symbol: impl Into<String>, price: impl Into<String>) -> Self {
        self.prices.insert(symbol.into(), price.into());
        self
    }
}

#[async_trait]
impl PriceFeed for StaticPriceTable {
    async fn unit_price_usd(&self, symbol: &str) -> Result<String> {
        self.prices
            .get(symbol)
            .cloned()
            .ok_or_else(|| HarnessError::PriceUnavailable {
                symbol: symbol.to_string(),
                reason: "no static price configured".to_string(),
            })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriceField {
    Text(String),
    Number(f64),
}

#[derive(Deserialize)]
struct PriceResponse {
    price: PriceField,
}

/// Prices fetched over HTTP: `GET {base_url}?symbol=<SYMBOL>` answering `{"price": ...}`
pub struct HttpPriceFeed {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceFeed {
    /// Create a feed against `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HarnessError::NetworkError)?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    async fn unit_price_usd(&self, symbol: &str) -> Result<String> {
        let unavailable = |reason: String| HarnessError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason,
        };

        let response = self
            .client
            .get(&self.base_url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {}", status)));
        }

        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let price = match body.price {
            PriceField::Text(text) => text,
            PriceField::Number(n) => n.to_string(),
        };
        debug!("Price of {}: {} USD", symbol, price);
        Ok(price)
    }
}

/// Token amount in base units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAmount {
    /// Token symbol
    pub symbol: String,
    /// Decimal precision
    pub decimals: u8,
    /// Integer amount in base units
    pub base_units: U256,
}

impl TokenAmount {
    /// Decimal string sized to the token's precision, e.g. `"1.500000"` for 6 decimals
    pub fn to_decimal_string(&self) -> Result<String> {
        format_units(self.base_units, u32::from(self.decimals))
            .map_err(|e| HarnessError::InvalidAmount(e.to_string()))
    }
}

/// Widest integer part whose scaling by 10^18 still fits in a `U256`
const MAX_INTEGER_DIGITS: usize = 59;

fn parse_positive(value: &str) -> Result<U256> {
    let trimmed = value.trim();
    let (integer, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    let is_decimal = !(integer.is_empty() && fraction.is_empty())
        && integer.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit());
    if !is_decimal {
        return Err(HarnessError::InvalidAmount(format!(
            "{:?} is not a decimal number",
            value
        )));
    }
    if integer.trim_start_matches('0').len() > MAX_INTEGER_DIGITS {
        return Err(HarnessError::InvalidAmount(format!(
            "{:?} is out of range",
            value
        )));
    }

    match parse_units(trimmed, USD_DECIMALS)
        .map_err(|e| HarnessError::InvalidAmount(format!("{:?}: {}", value, e)))?
    {
        ParseUnits::U256(v) if !v.is_zero() => Ok(v),
        _ => Err(HarnessError::InvalidAmount(format!(
            "{:?} is not a positive amount",
            value
        ))),
    }
}

/// Converts USD notionals into token amounts
pub struct AmountConverter {
    feed: Arc<dyn PriceFeed>,
    assets: AssetBook,
}

impl AmountConverter {
    /// Create a converter
    pub fn new(feed: Arc<dyn PriceFeed>, assets: AssetBook) -> Self {
        Self { feed, assets }
    }

    /// Amount of `symbol` worth `usd_amount` dollars at the current price.
    ///
    /// Rounds down to a whole base unit, but never below one base unit for a
    /// positive notional.
    pub async fn fetch_amount_in_usd_price(
        &self,
        symbol: &str,
        usd_amount: &str,
    ) -> Result<TokenAmount> {
        let asset = self.assets.get(symbol)?;
        let usd = parse_positive(usd_amount)?;

        let (quoted, price) = self.quote(symbol).await?;

        let base_units = usd
            .checked_mul(U256::exp10(usize::from(asset.decimals)))
            .map(|scaled| scaled / price)
            .ok_or_else(|| {
                HarnessError::InvalidAmount(format!("{} USD of {} overflows", usd_amount, symbol))
            })?
            .max(U256::one());

        debug!(
            "{} USD of {} at {} USD = {} base units",
            usd_amount, symbol, quoted, base_units
        );

        Ok(TokenAmount {
            symbol: symbol.to_string(),
            decimals: asset.decimals,
            base_units,
        })
    }

    /// Base units of `dest` paid per whole `src` base unit, scaled by 10^18.
    ///
    /// Multiplying an amount of `src` base units by the rate and dividing by
    /// 10^18 gives the `dest` base units it is worth at current prices.
    pub async fn exchange_rate(&self, src: &str, dest: &str) -> Result<U256> {
        let src_asset = self.assets.get(src)?;
        let dest_asset = self.assets.get(dest)?;
        let (_, src_price) = self.quote(src).await?;
        let (_, dest_price) = self.quote(dest).await?;

        let overflow =
            || HarnessError::InvalidAmount(format!("{} -> {} rate overflows", src, dest));
        let scale = (USD_DECIMALS + u32::from(dest_asset.decimals))
            .checked_sub(u32::from(src_asset.decimals))
            .ok_or_else(overflow)?;

        let rate = U256::from(10)
            .checked_pow(U256::from(scale))
            .and_then(|factor| src_price.checked_mul(factor))
            .map(|scaled| scaled / dest_price)
            .ok_or_else(overflow)?;

        debug!("{} -> {} rate: {}", src, dest, rate);
        Ok(rate)
    }

    async fn quote(&self, symbol: &str) -> Result<(String, U256)> {
        let quoted = self.feed.unit_price_usd(symbol).await?;
        let price = parse_positive(&quoted).map_err(|e| HarnessError::PriceUnavailable {
            symbol: symbol.to_string(),
            reason: e.to_string(),
        })?;
        Ok((quoted, price))
    }
}
