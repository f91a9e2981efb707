use crate::config::ENGINE_SETTING_KEYS;
use crate::models::{PriceBar, PriceHistory};
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    histories: BTreeMap<String, Vec<PriceBar>>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

/// JSON import layout: `{ "settings": {..}, "histories": { "TICKER": [bar, ..] } }`.
#[derive(Deserialize)]
struct MarketDataDocument {
    #[serde(default)]
    settings: HashMap<String, Value>,
    histories: BTreeMap<String, Vec<DocumentBar>>,
}

#[derive(Deserialize)]
struct DocumentBar {
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

fn parse_bar_date(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .with_context(|| format!("Unrecognized bar date '{}'", raw))?;
    day.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| anyhow!("Unrecognized bar date '{}'", raw))
}

fn setting_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn scrub_snapshot_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    settings
        .iter()
        .filter(|(key, _)| ENGINE_SETTING_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Validated price histories keyed by ticker, plus the settings stored alongside them.
pub struct MarketData {
    histories: BTreeMap<String, PriceHistory>,
    settings: HashMap<String, String>,
}

impl MarketData {
    pub fn new(histories: Vec<PriceHistory>, settings: HashMap<String, String>) -> Result<Self> {
        let mut by_ticker = BTreeMap::new();
        for history in histories {
            let ticker = history.ticker().to_string();
            if by_ticker.insert(ticker.clone(), history).is_some() {
                return Err(anyhow!("Duplicate history for ticker {}", ticker));
            }
        }
        Ok(Self {
            histories: by_ticker,
            settings,
        })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let histories = snapshot
            .histories
            .into_iter()
            .map(|(ticker, bars)| PriceHistory::new(ticker, bars))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Loaded {} histor{} from {} (generated {})",
            histories.len(),
            if histories.len() == 1 { "y" } else { "ies" },
            path.display(),
            snapshot.generated_at.format("%Y-%m-%d %H:%M")
        );
        Self::new(histories, snapshot.settings)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            histories: self
                .histories
                .iter()
                .map(|(ticker, history)| (ticker.clone(), history.bars().to_vec()))
                .collect(),
            settings: scrub_snapshot_settings(&self.settings),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn load_from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read market data JSON at {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("Invalid market data JSON in {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let document: MarketDataDocument =
            serde_json::from_str(raw).context("Market data JSON decode failed")?;

        let mut histories = Vec::with_capacity(document.histories.len());
        for (ticker, rows) in document.histories {
            let bars = rows
                .into_iter()
                .map(|row| {
                    Ok(PriceBar {
                        date: parse_bar_date(&row.date)?,
                        open: row.open,
                        high: row.high,
                        low: row.low,
                        close: row.close,
                        volume: row.volume,
                    })
                })
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("Invalid bar in history for {}", ticker))?;
            histories.push(PriceHistory::new(ticker, bars)?);
        }

        let settings = document
            .settings
            .iter()
            .filter_map(|(key, value)| setting_to_string(value).map(|text| (key.clone(), text)))
            .collect();
        Self::new(histories, settings)
    }

    pub fn has_data(&self) -> bool {
        !self.histories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    /// Tickers in ascending order.
    pub fn tickers(&self) -> Vec<&str> {
        self.histories.keys().map(|ticker| ticker.as_str()).collect()
    }

    pub fn histories(&self) -> impl Iterator<Item = &PriceHistory> {
        self.histories.values()
    }

    pub fn history(&self, ticker: &str) -> Result<&PriceHistory> {
        if let Some(history) = self.histories.get(ticker) {
            return Ok(history);
        }
        let upper = ticker.to_ascii_uppercase();
        self.histories
            .get(&upper)
            .ok_or_else(|| anyhow!("No price history for ticker {}", ticker))
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.settings
    }

    pub fn setting_value(&self, setting_key: &str) -> Option<&str> {
        self.settings.get(setting_key).map(|value| value.as_str())
    }

    pub fn restrict_to_tickers(self, allowed_tickers: &HashSet<String>) -> Result<Self> {
        let MarketData {
            histories,
            settings,
        } = self;
        let histories: BTreeMap<String, PriceHistory> = histories
            .into_iter()
            .filter(|(ticker, _)| {
                allowed_tickers.contains(ticker)
                    || allowed_tickers.contains(&ticker.to_ascii_uppercase())
            })
            .collect();
        if histories.is_empty() {
            return Err(anyhow!(
                "None of the requested tickers are present in the market data"
            ));
        }
        Ok(Self {
            histories,
            settings,
        })
    }
}
