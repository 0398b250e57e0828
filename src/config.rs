use anyhow::{bail, Context, Result};
use serde::Deserialize;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::observation::Extreme;
use crate::signal::{SourceSchema, TemperatureUnit};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub fusion: FusionConfig,
    pub edge: EdgeConfig,
    pub sizing: SizingConfig,
    pub adaptive: AdaptiveConfig,
    pub risk: RiskConfig,
    pub exit: ExitConfig,
    pub observations: ObservationConfig,
    pub gateway: GatewayConfig,
    pub persistence: PersistenceConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sources: Vec<SourceConfig>,
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scan cadence, e.g. "30s".
    pub scan_interval: String,
    pub fetch_timeout_ms: u64,
    pub max_parallel_fetches: usize,
    pub bankroll_dollars: f64,
    /// Number of settlement dates scanned per segment, starting today.
    pub horizon_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval: "30s".to_string(),
            fetch_timeout_ms: 8_000,
            max_parallel_fetches: 4,
            bankroll_dollars: 100.0,
            horizon_days: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub half_life_hours: f64,
    pub outlier_iqr_multiplier: f64,
    pub min_records_for_outlier_filter: usize,
    pub bin_width: f64,
    pub bin_span_sigmas: f64,
    /// Upper bound on finite bins per distribution.
    pub max_bins: usize,
    pub min_spread: f64,
    pub horizon_floor_base: f64,
    pub horizon_floor_per_day: f64,
    pub ensemble_kernel_std: f64,
    pub bootstrap_samples: usize,
    /// 0 seeds from entropy.
    pub bootstrap_seed: u64,
    pub max_source_rmse: f64,
    pub bias_history_len: usize,
    pub bias_min_samples: usize,
    pub bias_max_correction: f64,
    pub spread_floor_history_len: usize,
    pub spread_floor_min_samples: usize,
    pub spread_floor_minimum: f64,
    pub spread_floor_fallback: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 12.0,
            outlier_iqr_multiplier: 1.5,
            min_records_for_outlier_filter: 4,
            bin_width: 2.0,
            bin_span_sigmas: 4.0,
            max_bins: 200,
            min_spread: 2.5,
            horizon_floor_base: 1.0,
            horizon_floor_per_day: 0.5,
            ensemble_kernel_std: 1.0,
            bootstrap_samples: 1_000,
            bootstrap_seed: 0,
            max_source_rmse: 4.0,
            bias_history_len: 50,
            bias_min_samples: 10,
            bias_max_correction: 3.0,
            spread_floor_history_len: 200,
            spread_floor_min_samples: 20,
            spread_floor_minimum: 1.5,
            spread_floor_fallback: 3.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub fee_rate: f64,
    pub min_edge_pct: f64,
    pub min_ev: f64,
    pub asymmetric_max_price_cents: u32,
    pub asymmetric_min_probability: f64,
    pub asymmetric_min_edge_pct: f64,
    pub max_buy_price_cents: u32,
    /// Skip when the fused mean sits this close to a strike. 0 disables.
    pub min_distance_from_threshold: f64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.05,
            min_edge_pct: 8.0,
            min_ev: 0.02,
            asymmetric_max_price_cents: 10,
            asymmetric_min_probability: 0.50,
            asymmetric_min_edge_pct: 30.0,
            max_buy_price_cents: 55,
            min_distance_from_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentCorrelation {
    pub a: String,
    pub b: String,
    pub correlation: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub kelly_fraction_asymmetric: f64,
    pub kelly_fraction_standard: f64,
    pub max_bankroll_fraction: f64,
    pub base_contracts: u32,
    pub min_order_contracts: u32,
    pub min_sources_for_kelly: usize,
    pub time_decay_full_hours: f64,
    pub time_decay_floor_hours: f64,
    pub time_decay_min_factor: f64,
    pub correlation_threshold: f64,
    pub max_correlation_discount: f64,
    pub correlation_saturation_contracts: f64,
    pub depth_penalty_cents: f64,
    pub segment_correlations: Vec<SegmentCorrelation>,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            kelly_fraction_asymmetric: 0.5,
            kelly_fraction_standard: 0.25,
            max_bankroll_fraction: 0.25,
            base_contracts: 1,
            min_order_contracts: 1,
            min_sources_for_kelly: 2,
            time_decay_full_hours: 24.0,
            time_decay_floor_hours: 72.0,
            time_decay_min_factor: 0.5,
            correlation_threshold: 0.5,
            max_correlation_discount: 0.5,
            correlation_saturation_contracts: 10.0,
            depth_penalty_cents: 0.1,
            segment_correlations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub min_trades: u32,
    pub win_rate_floor: f64,
    /// Disable duration, e.g. "24h".
    pub cooldown: String,
    pub trial_trades: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_trades: 10,
            win_rate_floor: 0.40,
            cooldown: "24h".to_string(),
            trial_trades: 10,
        }
    }
}

impl AdaptiveConfig {
    pub fn cooldown_ms(&self) -> Result<u64> {
        parse_interval_ms(&self.cooldown)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DrawdownLevel {
    pub losses: u32,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_contracts_per_market: u32,
    pub max_dollars_per_market: f64,
    pub max_daily_loss: f64,
    /// Pause after each loss, e.g. "30m".
    pub loss_cooldown: String,
    pub session_pause_losses: u32,
    pub drawdown_levels: Vec<DrawdownLevel>,
    pub drawdown_edge_after_losses: u32,
    pub drawdown_edge_multiplier: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_contracts_per_market: 10,
            max_dollars_per_market: 5.0,
            max_daily_loss: 10.0,
            loss_cooldown: "30m".to_string(),
            session_pause_losses: 6,
            drawdown_levels: vec![
                DrawdownLevel { losses: 3, multiplier: 0.75 },
                DrawdownLevel { losses: 5, multiplier: 0.5 },
                DrawdownLevel { losses: 8, multiplier: 0.25 },
                DrawdownLevel { losses: 10, multiplier: 0.0 },
            ],
            drawdown_edge_after_losses: 5,
            drawdown_edge_multiplier: 1.2,
        }
    }
}

impl RiskConfig {
    pub fn loss_cooldown_ms(&self) -> Result<u64> {
        parse_interval_ms(&self.loss_cooldown)
    }
}

/// When held positions are sold before settlement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub enabled: bool,
    /// Sell once the bid is this many percent above the entry price.
    pub take_profit_pct: f64,
    /// Sell once the bid is this many percent below the entry price.
    pub stop_loss_pct: f64,
    /// No exit before a position has been held this long, e.g. "5m".
    pub min_hold: String,
    /// Sell when the re-fused model no longer shows edge on the held side.
    pub edge_gone: bool,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            take_profit_pct: 20.0,
            stop_loss_pct: 30.0,
            min_hold: "5m".to_string(),
            edge_gone: true,
        }
    }
}

impl ExitConfig {
    pub fn min_hold_ms(&self) -> Result<u64> {
        parse_interval_ms(&self.min_hold)
    }
}

/// Same-day gating on observed extremes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    pub enabled: bool,
    /// Local hour from which the daily high is taken as reached.
    pub high_cutoff_hour: u32,
    /// Local hour from which the daily low is taken as reached.
    pub low_cutoff_hour: u32,
    /// An observation this close to the forecast extreme counts as reached.
    pub extreme_margin: f64,
    /// Live feed. Without one only the cutoff hours apply.
    pub source: Option<ObservationSourceConfig>,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_cutoff_hour: 16,
            low_cutoff_hour: 8,
            extreme_margin: 2.0,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationSourceConfig {
    pub id: String,
    /// Endpoint with `{segment}`, `{date}` and `{extreme}` placeholders.
    pub url_template: String,
    /// Dotted path to the running extreme in the payload.
    pub value_field: String,
    #[serde(default)]
    pub observed_at_field: Option<String>,
    #[serde(default)]
    pub unit: TemperatureUnit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f64,
    pub circuit_breaker_failures: u32,
    /// JSON snapshot of markets and books served by the paper gateway.
    pub paper_book_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_attempts: 3,
            backoff_initial_ms: 250,
            backoff_max_ms: 4_000,
            backoff_factor: 2.0,
            circuit_breaker_failures: 3,
            paper_book_path: "config/paper_books.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: "data".to_string(),
        }
    }
}

impl PersistenceConfig {
    pub fn path(&self, file_name: &str) -> PathBuf {
        Path::new(&self.state_dir).join(file_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8089".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "forecast-edge.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Endpoint with `{segment}` and `{date}` placeholders.
    pub url_template: String,
    #[serde(default)]
    pub is_ensemble: bool,
    #[serde(default)]
    pub schema: SourceSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentConfig {
    pub id: String,
    /// Spread floor used until enough settled errors exist for this segment.
    #[serde(default)]
    pub fallback_spread: Option<f64>,
    #[serde(default)]
    pub extreme: Extreme,
    /// Fixed offset of the segment's local day from UTC.
    #[serde(default)]
    pub utc_offset_hours: i32,
}

impl SegmentConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fallback_spread: None,
            extreme: Extreme::High,
            utc_offset_hours: 0,
        }
    }

    /// `at` shifted to the segment's wall clock. Only the date and time
    /// fields of the result are meaningful.
    pub fn local(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at + chrono::Duration::hours(self.utc_offset_hours as i64)
    }
}

/// Parse a duration string (e.g. "30s", "30m", "24h", "2d", "1w") into milliseconds.
pub fn parse_interval_ms(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.len() < 2 {
        bail!("invalid interval '{}': expected format like '30m'", s);
    }

    let (num_str, suffix) = s.split_at(s.len() - 1);
    let n: u64 = num_str.parse().with_context(|| {
        format!(
            "invalid interval '{}': quantity must be a positive integer",
            s
        )
    })?;
    if n == 0 {
        bail!("invalid interval '{}': quantity must be > 0", s);
    }

    let unit_ms = match suffix {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        _ => bail!(
            "invalid interval '{}': unsupported suffix '{}', expected one of s/m/h/d/w",
            s,
            suffix
        ),
    };

    n.checked_mul(unit_ms)
        .with_context(|| format!("invalid interval '{}': value is too large", s))
}

fn config_path() -> PathBuf {
    std::env::var("FE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/default.toml"))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = config_path();
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;

        let mut config = Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        if let Ok(dir) = std::env::var("FE_STATE_DIR") {
            config.persistence.state_dir = dir;
        }
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("invalid config toml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn scan_interval_ms(&self) -> Result<u64> {
        parse_interval_ms(&self.engine.scan_interval)
    }

    pub fn segment(&self, segment_id: &str) -> Option<&SegmentConfig> {
        self.segments.iter().find(|s| s.id == segment_id)
    }

    pub fn fallback_spread_for(&self, segment_id: &str) -> f64 {
        self.segments
            .iter()
            .find(|s| s.id == segment_id)
            .and_then(|s| s.fallback_spread)
            .unwrap_or(self.fusion.spread_floor_fallback)
    }

    pub fn validate(&self) -> Result<()> {
        self.scan_interval_ms()
            .context("engine.scan_interval is invalid")?;
        self.adaptive
            .cooldown_ms()
            .context("adaptive.cooldown is invalid")?;
        self.risk
            .loss_cooldown_ms()
            .context("risk.loss_cooldown is invalid")?;
        self.exit
            .min_hold_ms()
            .context("exit.min_hold is invalid")?;

        if self.fusion.bin_width <= 0.0 {
            bail!("fusion.bin_width must be > 0");
        }
        if self.fusion.max_bins < 2 {
            bail!("fusion.max_bins must be >= 2");
        }
        if self.fusion.half_life_hours <= 0.0 {
            bail!("fusion.half_life_hours must be > 0");
        }
        if !(0.0..1.0).contains(&self.edge.fee_rate) {
            bail!("edge.fee_rate must be within [0, 1)");
        }
        if self.edge.max_buy_price_cents == 0 || self.edge.max_buy_price_cents > 99 {
            bail!("edge.max_buy_price_cents must be within 1..=99");
        }
        if !(0.0..=1.0).contains(&self.adaptive.win_rate_floor) {
            bail!("adaptive.win_rate_floor must be within [0, 1]");
        }
        if self.risk.max_dollars_per_market <= 0.0 || self.risk.max_contracts_per_market == 0 {
            bail!("risk per-market caps must be > 0");
        }
        if self.exit.take_profit_pct <= 0.0 || self.exit.stop_loss_pct <= 0.0 {
            bail!("exit.take_profit_pct and exit.stop_loss_pct must be > 0");
        }
        if self.observations.high_cutoff_hour > 24 || self.observations.low_cutoff_hour > 24 {
            bail!("observations cutoff hours must be within 0..=24");
        }
        for segment in &self.segments {
            if !(-14..=14).contains(&segment.utc_offset_hours) {
                bail!("segment '{}' utc_offset_hours must be within -14..=14", segment.id);
            }
        }
        if let Some(source) = &self.observations.source {
            url::Url::parse(&source.url_template.replace(['{', '}'], "")).with_context(|| {
                format!("observation source '{}' has an invalid url_template", source.id)
            })?;
        }
        let mut last = 0;
        for level in &self.risk.drawdown_levels {
            if level.losses <= last {
                bail!("risk.drawdown_levels must be sorted by strictly increasing losses");
            }
            if !(0.0..=1.0).contains(&level.multiplier) {
                bail!("risk.drawdown_levels multiplier must be within [0, 1]");
            }
            last = level.losses;
        }
        for source in &self.sources {
            url::Url::parse(&source.url_template.replace(['{', '}'], ""))
                .with_context(|| format!("source '{}' has an invalid url_template", source.id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let toml_str = r#"
[engine]
scan_interval = "45s"
bankroll_dollars = 250.0

[edge]
min_edge_pct = 10.0

[[sources]]
id = "nws"
url_template = "https://api.example.com/forecast/{segment}/{date}"

[[segments]]
id = "NY"
fallback_spread = 4.0

[logging]
level = "debug"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert_eq!(config.scan_interval_ms().unwrap(), 45_000);
        assert!((config.engine.bankroll_dollars - 250.0).abs() < f64::EPSILON);
        assert!((config.edge.min_edge_pct - 10.0).abs() < f64::EPSILON);
        assert!((config.edge.fee_rate - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.risk.drawdown_levels.len(), 4);
        assert!((config.fallback_spread_for("NY") - 4.0).abs() < f64::EPSILON);
        assert!((config.fallback_spread_for("CHI") - 3.5).abs() < f64::EPSILON);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn validate_rejects_unsorted_drawdown_levels() {
        let toml_str = r#"
[risk]
drawdown_levels = [
  { losses = 5, multiplier = 0.5 },
  { losses = 3, multiplier = 0.75 },
]
"#;
        assert!(Config::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn exit_and_observation_sections_parse() {
        let toml_str = r#"
[exit]
take_profit_pct = 25.0
min_hold = "10m"

[observations]
high_cutoff_hour = 15

[observations.source]
id = "station"
url_template = "https://obs.example.com/{segment}/{date}/{extreme}"
value_field = "max"
unit = "celsius"

[[segments]]
id = "DEN"
extreme = "low"
utc_offset_hours = -7
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert!((config.exit.take_profit_pct - 25.0).abs() < f64::EPSILON);
        assert!((config.exit.stop_loss_pct - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.exit.min_hold_ms().unwrap(), 600_000);
        assert_eq!(config.observations.high_cutoff_hour, 15);
        assert_eq!(config.observations.low_cutoff_hour, 8);
        let source = config.observations.source.as_ref().unwrap();
        assert_eq!(source.unit, TemperatureUnit::Celsius);
        let den = config.segment("DEN").unwrap();
        assert_eq!(den.extreme, Extreme::Low);
        assert_eq!(den.utc_offset_hours, -7);

        assert!(Config::from_toml_str("[exit]\nmin_hold = \"soon\"").is_err());
        assert!(Config::from_toml_str("[[segments]]\nid = \"X\"\nutc_offset_hours = 20").is_err());
    }

    #[test]
    fn parse_interval_valid() {
        assert_eq!(parse_interval_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_interval_ms("30m").unwrap(), 1_800_000);
        assert_eq!(parse_interval_ms("24h").unwrap(), 86_400_000);
        assert_eq!(parse_interval_ms("1w").unwrap(), 604_800_000);
    }

    #[test]
    fn parse_interval_rejects_invalid_inputs() {
        assert!(parse_interval_ms("").is_err());
        assert!(parse_interval_ms("m").is_err());
        assert!(parse_interval_ms("0m").is_err());
        assert!(parse_interval_ms("1x").is_err());
    }
}
