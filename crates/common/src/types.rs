use serde::Deserialize;

/// How a wallet entered the system. The `migration` tag marks wallets created
/// by the migration handler and must stay distinguishable at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPeriod {
    Days14,
    Days30,
    Days200,
    Days360,
    Manual,
    Migration,
}

impl DiscoveryPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Days14 => "14d",
            Self::Days30 => "30d",
            Self::Days200 => "200d",
            Self::Days360 => "360d",
            Self::Manual => "manual",
            Self::Migration => "migration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "14d" => Some(Self::Days14),
            "30d" => Some(Self::Days30),
            "200d" => Some(Self::Days200),
            "360d" => Some(Self::Days360),
            "manual" => Some(Self::Manual),
            "migration" => Some(Self::Migration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Self::In),
            "out" => Some(Self::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Buy,
    Sell,
    Airdrop,
    TransferIn,
    TransferOut,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Airdrop => "airdrop",
            Self::TransferIn => "transfer_in",
            Self::TransferOut => "transfer_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            "airdrop" => Some(Self::Airdrop),
            "transfer_in" => Some(Self::TransferIn),
            "transfer_out" => Some(Self::TransferOut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Gagnant,
    Perdant,
    Neutre,
    AirdropGagnant,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gagnant => "GAGNANT",
            Self::Perdant => "PERDANT",
            Self::Neutre => "NEUTRE",
            Self::AirdropGagnant => "AIRDROP_GAGNANT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Elite,
    Excellent,
    Bon,
    Moyen,
    Faible,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elite => "ELITE",
            Self::Excellent => "EXCELLENT",
            Self::Bon => "BON",
            Self::Moyen => "MOYEN",
            Self::Faible => "FAIBLE",
        }
    }

    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Elite
        } else if score >= 60.0 {
            Self::Excellent
        } else if score >= 40.0 {
            Self::Bon
        } else if score >= 20.0 {
            Self::Moyen
        } else {
            Self::Faible
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdStatus {
    Exceptional,
    Excellent,
    Good,
    Average,
    Poor,
    Neutral,
    NoReliableTiers,
    Manual,
    Migration,
}

impl ThresholdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exceptional => "EXCEPTIONAL",
            Self::Excellent => "EXCELLENT",
            Self::Good => "GOOD",
            Self::Average => "AVERAGE",
            Self::Poor => "POOR",
            Self::Neutral => "NEUTRAL",
            Self::NoReliableTiers => "NO_RELIABLE_TIERS",
            Self::Manual => "MANUAL",
            Self::Migration => "MIGRATION",
        }
    }

    pub fn from_quality(q: f64) -> Self {
        if q < 0.1 {
            Self::Neutral
        } else if q < 0.3 {
            Self::Poor
        } else if q < 0.5 {
            Self::Average
        } else if q < 0.7 {
            Self::Good
        } else if q < 0.9 {
            Self::Excellent
        } else {
            Self::Exceptional
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    New,
    Accumulation,
    Reduction,
    Exit,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Accumulation => "ACCUMULATION",
            Self::Reduction => "REDUCTION",
            Self::Exit => "EXIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "ACCUMULATION" => Some(Self::Accumulation),
            "REDUCTION" => Some(Self::Reduction),
            "EXIT" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// One normalized row of the append-only transfer log.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRow {
    pub wallet_address: String,
    pub transaction_hash: String,
    pub symbol: String,
    pub contract_address: Option<String>,
    pub fungible_id: String,
    pub direction: Direction,
    pub action_type: ActionType,
    /// Always positive.
    pub quantity: f64,
    /// USD per token at transaction time; 0.0 = no cost / unknown.
    pub price_per_token: f64,
    pub inherited_price_per_token: Option<f64>,
    pub is_inherited_from_wallet: Option<String>,
    pub counterparty_address: Option<String>,
    /// ISO-8601 UTC.
    pub timestamp: String,
    pub block_number: i64,
}

/// One token position as reported by the balance endpoint, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBalance {
    pub symbol: String,
    pub contract_address: Option<String>,
    pub chain: String,
    pub fungible_id: String,
    pub amount: f64,
    pub usd_value: f64,
}

impl TokenBalance {
    pub fn price_per_token(&self) -> f64 {
        if self.amount > 0.0 {
            self.usd_value / self.amount
        } else {
            0.0
        }
    }
}

// ── Provider wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPage<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub links: ApiLinks,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiLinks {
    pub next: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiQuantity {
    pub numeric: Option<String>,
}

impl ApiQuantity {
    pub fn as_f64(&self) -> f64 {
        self.numeric
            .as_deref()
            .and_then(|n| n.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiImplementation {
    pub chain_id: Option<String>,
    pub address: Option<String>,
    pub decimals: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiFungibleInfo {
    pub id: Option<String>,
    pub symbol: Option<String>,
    #[serde(default)]
    pub implementations: Vec<ApiImplementation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPosition {
    pub attributes: ApiPositionAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPositionAttributes {
    pub quantity: Option<ApiQuantity>,
    pub value: Option<f64>,
    #[serde(default)]
    pub fungible_info: ApiFungibleInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTransaction {
    pub id: Option<String>,
    pub attributes: ApiTransactionAttributes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTransactionAttributes {
    pub hash: Option<String>,
    pub mined_at: Option<String>,
    pub mined_at_block: Option<i64>,
    pub operation_type: Option<String>,
    #[serde(default)]
    pub transfers: Vec<ApiTransfer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTransfer {
    pub direction: Option<String>,
    pub value: Option<f64>,
    pub quantity: Option<ApiQuantity>,
    #[serde(default)]
    pub fungible_info: ApiFungibleInfo,
    pub sender: Option<String>,
    pub recipient: Option<String>,
}
