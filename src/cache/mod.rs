//! Data Cache (C3): periodic market/news fetchers exposing a read-only
//! snapshot to agents, plus `buildDataContext()` (§4.2).
//!
//! Grounded in the `agent::cache` in-process cache pattern, extended
//! with per-slot TTLs and best-effort refresh: a failed fetch is logged
//! and the previous value is kept.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const CRYPTO_NEWS_TTL: Duration = Duration::from_secs(3600);
const TOKEN_MARKET_TTL: Duration = Duration::from_secs(5 * 60);
const GLOBAL_MARKET_TTL: Duration = Duration::from_secs(5 * 60);
const FEAR_GREED_TTL: Duration = Duration::from_secs(30 * 60);
const TOP_MOVERS_COUNT: usize = 5;

#[derive(Debug, Clone)]
pub struct CryptoNewsItem {
    pub title: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct TokenMarket {
    pub symbol: String,
    pub price_usd: f64,
    pub change_24h_pct: f64,
}

#[derive(Debug, Clone)]
pub struct GlobalMarketOverview {
    pub total_market_cap_usd: f64,
    pub top_gainers: Vec<TokenMarket>,
    pub top_losers: Vec<TokenMarket>,
}

#[derive(Debug, Clone)]
pub struct FearGreedIndex {
    pub value: u8,
    pub previous_value: u8,
    pub classification: String,
}

/// The external feeds the cache pulls from. Implemented over `reqwest`
/// in production; tests supply a hand-rolled fake.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_crypto_news(&self, page_size: usize) -> anyhow::Result<Vec<CryptoNewsItem>>;
    async fn fetch_token_market(&self, symbols: &[String]) -> anyhow::Result<Vec<TokenMarket>>;
    async fn fetch_global_market(&self) -> anyhow::Result<GlobalMarketOverview>;
    async fn fetch_fear_greed(&self) -> anyhow::Result<FearGreedIndex>;
}

struct Slot<T> {
    value: Option<T>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl<T> Slot<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            value: None,
            fetched_at: None,
            ttl,
        }
    }

    fn is_fresh(&self) -> bool {
        matches!(self.fetched_at, Some(at) if at.elapsed() < self.ttl)
    }
}

struct Slots {
    news: Slot<Vec<CryptoNewsItem>>,
    token_market: Slot<Vec<TokenMarket>>,
    global_market: Slot<GlobalMarketOverview>,
    fear_greed: Slot<FearGreedIndex>,
}

/// The in-process read-only snapshot consulted by every agent loop
/// (§4.9 step 3). A background task refreshes each slot on its own
/// cadence; a missing slot is simply omitted from the markdown block.
pub struct DataCache {
    source: Arc<dyn MarketDataSource>,
    slots: RwLock<Slots>,
    tracked_symbols: Vec<String>,
}

impl DataCache {
    pub fn new(source: Arc<dyn MarketDataSource>, tracked_symbols: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            source,
            slots: RwLock::new(Slots {
                news: Slot::new(CRYPTO_NEWS_TTL),
                token_market: Slot::new(TOKEN_MARKET_TTL),
                global_market: Slot::new(GLOBAL_MARKET_TTL),
                fear_greed: Slot::new(FEAR_GREED_TTL),
            }),
            tracked_symbols,
        })
    }

    /// Spawns the four periodic refresh loops. Never blocks an agent
    /// loop: each fetch runs independently and best-effort (§4.2).
    pub fn spawn_refresh_loops(self: &Arc<Self>) {
        for kind in [FeedKind::News, FeedKind::TokenMarket, FeedKind::GlobalMarket, FeedKind::FearGreed] {
            let cache = self.clone();
            tokio::spawn(async move { cache.run_refresh_loop(kind).await });
        }
    }

    async fn run_refresh_loop(self: Arc<Self>, kind: FeedKind) {
        let period = match kind {
            FeedKind::News => CRYPTO_NEWS_TTL,
            FeedKind::TokenMarket => TOKEN_MARKET_TTL,
            FeedKind::GlobalMarket => GLOBAL_MARKET_TTL,
            FeedKind::FearGreed => FEAR_GREED_TTL,
        };
        loop {
            self.refresh_one(kind).await;
            tokio::time::sleep(period).await;
        }
    }

    async fn refresh_one(&self, kind: FeedKind) {
        match kind {
            FeedKind::News => match self.source.fetch_crypto_news(30).await {
                Ok(items) => {
                    let mut slots = self.slots.write().await;
                    slots.news.value = Some(items);
                    slots.news.fetched_at = Some(Instant::now());
                    debug!("cache: crypto news refreshed");
                }
                Err(e) => warn!(error = %e, "cache: crypto news fetch failed, keeping previous value"),
            },
            FeedKind::TokenMarket => match self.source.fetch_token_market(&self.tracked_symbols).await {
                Ok(items) => {
                    let mut slots = self.slots.write().await;
                    slots.token_market.value = Some(items);
                    slots.token_market.fetched_at = Some(Instant::now());
                    debug!("cache: token market refreshed");
                }
                Err(e) => warn!(error = %e, "cache: token market fetch failed, keeping previous value"),
            },
            FeedKind::GlobalMarket => match self.source.fetch_global_market().await {
                Ok(overview) => {
                    let mut slots = self.slots.write().await;
                    slots.global_market.value = Some(overview);
                    slots.global_market.fetched_at = Some(Instant::now());
                    debug!("cache: global market overview refreshed");
                }
                Err(e) => warn!(error = %e, "cache: global market fetch failed, keeping previous value"),
            },
            FeedKind::FearGreed => match self.source.fetch_fear_greed().await {
                Ok(fgi) => {
                    let mut slots = self.slots.write().await;
                    slots.fear_greed.value = Some(fgi);
                    slots.fear_greed.fetched_at = Some(Instant::now());
                    debug!("cache: fear & greed index refreshed");
                }
                Err(e) => warn!(error = %e, "cache: fear & greed fetch failed, keeping previous value"),
            },
        }
    }

    /// Composes a stable human-readable markdown block from whichever
    /// slots are fresh; missing slots are omitted (§4.2). Never blocks:
    /// reads whatever is currently cached.
    pub async fn build_data_context(&self) -> String {
        let slots = self.slots.read().await;
        let mut sections = Vec::new();

        if slots.global_market.is_fresh() {
            if let Some(overview) = &slots.global_market.value {
                sections.push(format!(
                    "## Global Market\nTotal market cap: ${:.0}\nTop gainer: {}\nTop loser: {}",
                    overview.total_market_cap_usd,
                    overview.top_gainers.first().map(|t| t.symbol.as_str()).unwrap_or("n/a"),
                    overview.top_losers.first().map(|t| t.symbol.as_str()).unwrap_or("n/a"),
                ));
            }
        }

        if slots.token_market.is_fresh() {
            if let Some(tokens) = &slots.token_market.value {
                let lines: Vec<String> = tokens
                    .iter()
                    .map(|t| format!("- {}: ${:.2} ({:+.1}% 24h)", t.symbol, t.price_usd, t.change_24h_pct))
                    .collect();
                sections.push(format!("## Token Market\n{}", lines.join("\n")));
            }
        }

        if slots.fear_greed.is_fresh() {
            if let Some(fgi) = &slots.fear_greed.value {
                sections.push(format!(
                    "## Fear & Greed Index\n{} ({}), previous {}",
                    fgi.value, fgi.classification, fgi.previous_value
                ));
            }
        }

        if slots.news.is_fresh() {
            if let Some(news) = &slots.news.value {
                let lines: Vec<String> = news.iter().take(10).map(|n| format!("- {} ({})", n.title, n.source)).collect();
                sections.push(format!("## Crypto News\n{}", lines.join("\n")));
            }
        }

        if sections.is_empty() {
            "Market data unavailable".to_string()
        } else {
            sections.join("\n\n")
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FeedKind {
    News,
    TokenMarket,
    GlobalMarket,
    FearGreed,
}

/// Production [`MarketDataSource`] over public HTTP feeds: CryptoCompare
/// for headlines, CoinGecko for prices/market cap, alternative.me for
/// the Fear & Greed Index. No API key is required for any of the three.
pub struct HttpMarketDataSource {
    client: reqwest::Client,
}

impl HttpMarketDataSource {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpMarketDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketDataSource {
    async fn fetch_crypto_news(&self, page_size: usize) -> anyhow::Result<Vec<CryptoNewsItem>> {
        let value: serde_json::Value = self
            .client
            .get("https://min-api.cryptocompare.com/data/v2/news/?lang=EN")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let items = value["Data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .take(page_size)
            .map(|item| CryptoNewsItem {
                title: item["title"].as_str().unwrap_or_default().to_string(),
                source: item["source"].as_str().unwrap_or("unknown").to_string(),
            })
            .collect();
        Ok(items)
    }

    async fn fetch_token_market(&self, symbols: &[String]) -> anyhow::Result<Vec<TokenMarket>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let ids = symbols.join(",");
        let url = format!(
            "https://api.coingecko.com/api/v3/simple/price?ids={ids}&vs_currencies=usd&include_24hr_change=true"
        );
        let value: serde_json::Value = self.client.get(url).send().await?.error_for_status()?.json().await?;
        let markets = symbols
            .iter()
            .filter_map(|symbol| {
                let entry = value.get(symbol)?;
                Some(TokenMarket {
                    symbol: symbol.clone(),
                    price_usd: entry["usd"].as_f64().unwrap_or(0.0),
                    change_24h_pct: entry["usd_24h_change"].as_f64().unwrap_or(0.0),
                })
            })
            .collect();
        Ok(markets)
    }

    async fn fetch_global_market(&self) -> anyhow::Result<GlobalMarketOverview> {
        let global: serde_json::Value = self
            .client
            .get("https://api.coingecko.com/api/v3/global")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let total_market_cap_usd = global["data"]["total_market_cap"]["usd"].as_f64().unwrap_or(0.0);

        let movers: serde_json::Value = self
            .client
            .get("https://api.coingecko.com/api/v3/coins/markets?vs_currency=usd&order=market_cap_desc&per_page=100&page=1&price_change_percentage=24h")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut ranked: Vec<TokenMarket> = movers
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|coin| TokenMarket {
                symbol: coin["symbol"].as_str().unwrap_or_default().to_uppercase(),
                price_usd: coin["current_price"].as_f64().unwrap_or(0.0),
                change_24h_pct: coin["price_change_percentage_24h"].as_f64().unwrap_or(0.0),
            })
            .collect();
        ranked.sort_by(|a, b| b.change_24h_pct.total_cmp(&a.change_24h_pct));
        let top_gainers = ranked.iter().take(TOP_MOVERS_COUNT).cloned().collect();
        let top_losers = ranked.iter().rev().take(TOP_MOVERS_COUNT).cloned().collect();

        Ok(GlobalMarketOverview {
            total_market_cap_usd,
            top_gainers,
            top_losers,
        })
    }

    async fn fetch_fear_greed(&self) -> anyhow::Result<FearGreedIndex> {
        let value: serde_json::Value = self
            .client
            .get("https://api.alternative.me/fng/?limit=2")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let entries = value["data"].as_array().cloned().unwrap_or_default();
        let parse = |s: &str| s.parse::<u8>().unwrap_or(0);
        let current = entries.first().map(|e| parse(e["value"].as_str().unwrap_or("0"))).unwrap_or(0);
        let previous = entries.get(1).map(|e| parse(e["value"].as_str().unwrap_or("0"))).unwrap_or(current);
        let classification = entries
            .first()
            .and_then(|e| e["value_classification"].as_str())
            .unwrap_or("unknown")
            .to_string();
        Ok(FearGreedIndex {
            value: current,
            previous_value: previous,
            classification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource {
        fail: bool,
    }

    #[async_trait]
    impl MarketDataSource for FakeSource {
        async fn fetch_crypto_news(&self, _page_size: usize) -> anyhow::Result<Vec<CryptoNewsItem>> {
            if self.fail {
                anyhow::bail!("simulated timeout");
            }
            Ok(vec![CryptoNewsItem {
                title: "ETF inflows continue".to_string(),
                source: "wire".to_string(),
            }])
        }

        async fn fetch_token_market(&self, symbols: &[String]) -> anyhow::Result<Vec<TokenMarket>> {
            Ok(symbols
                .iter()
                .map(|s| TokenMarket {
                    symbol: s.clone(),
                    price_usd: 100.0,
                    change_24h_pct: 1.5,
                })
                .collect())
        }

        async fn fetch_global_market(&self) -> anyhow::Result<GlobalMarketOverview> {
            Ok(GlobalMarketOverview {
                total_market_cap_usd: 2_000_000_000.0,
                top_gainers: vec![],
                top_losers: vec![],
            })
        }

        async fn fetch_fear_greed(&self) -> anyhow::Result<FearGreedIndex> {
            Ok(FearGreedIndex {
                value: 55,
                previous_value: 50,
                classification: "Greed".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn missing_slots_are_omitted_and_empty_cache_yields_sentinel() {
        let cache = DataCache::new(Arc::new(FakeSource { fail: false }), vec!["BTC".to_string()]);
        assert_eq!(cache.build_data_context().await, "Market data unavailable");
        cache.refresh_one(FeedKind::FearGreed).await;
        let ctx = cache.build_data_context().await;
        assert!(ctx.contains("Fear & Greed"));
        assert!(!ctx.contains("Token Market"));
    }

    struct FlakySource {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl MarketDataSource for FlakySource {
        async fn fetch_crypto_news(&self, _page_size: usize) -> anyhow::Result<Vec<CryptoNewsItem>> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Ok(vec![CryptoNewsItem {
                    title: "ETF inflows continue".to_string(),
                    source: "wire".to_string(),
                }])
            } else {
                anyhow::bail!("simulated timeout")
            }
        }

        async fn fetch_token_market(&self, _symbols: &[String]) -> anyhow::Result<Vec<TokenMarket>> {
            Ok(vec![])
        }

        async fn fetch_global_market(&self) -> anyhow::Result<GlobalMarketOverview> {
            Ok(GlobalMarketOverview { total_market_cap_usd: 0.0, top_gainers: vec![], top_losers: vec![] })
        }

        async fn fetch_fear_greed(&self) -> anyhow::Result<FearGreedIndex> {
            Ok(FearGreedIndex { value: 0, previous_value: 0, classification: "unknown".to_string() })
        }
    }

    #[tokio::test]
    async fn failed_fetch_leaves_previous_value_in_place() {
        let cache = DataCache::new(Arc::new(FlakySource { calls: std::sync::atomic::AtomicU32::new(0) }), vec![]);

        cache.refresh_one(FeedKind::News).await;
        let after_success = cache.build_data_context().await;
        assert!(after_success.contains("ETF inflows"));

        cache.refresh_one(FeedKind::News).await;
        let after_failure = cache.build_data_context().await;
        assert_eq!(after_failure, after_success);
    }
}
