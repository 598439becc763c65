//! Supported blockchains and the built-in currency registry.

use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Blockchain networks the engine settles on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blockchain {
    Ethereum,
    Polygon,
    BinanceSmartChain,
    Tron,
}

impl Blockchain {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Blockchain::Ethereum => "ETH",
            Blockchain::Polygon => "MATIC",
            Blockchain::BinanceSmartChain => "BSC",
            Blockchain::Tron => "TRON",
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Blockchain::Ethereum => "Ethereum",
            Blockchain::Polygon => "Polygon",
            Blockchain::BinanceSmartChain => "BNB Smart Chain",
            Blockchain::Tron => "Tron",
        }
    }

    /// EVM chains share transaction composition and fee mechanics.
    #[must_use]
    pub fn is_evm(&self) -> bool {
        !matches!(self, Blockchain::Tron)
    }

    #[must_use]
    pub fn native_ticker(&self) -> &'static str {
        match self {
            Blockchain::Ethereum => "ETH",
            Blockchain::Polygon => "MATIC",
            Blockchain::BinanceSmartChain => "BNB",
            Blockchain::Tron => "TRX",
        }
    }

    /// Block confirmations required before a transaction is considered final.
    #[must_use]
    pub fn required_confirmations(&self) -> u64 {
        match self {
            Blockchain::Ethereum => 12,
            Blockchain::Polygon => 30,
            Blockchain::BinanceSmartChain => 15,
            Blockchain::Tron => 20,
        }
    }

    #[must_use]
    pub fn all() -> &'static [Blockchain] {
        &[
            Blockchain::Ethereum,
            Blockchain::Polygon,
            Blockchain::BinanceSmartChain,
            Blockchain::Tron,
        ]
    }
}

impl FromStr for Blockchain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ETH" => Ok(Blockchain::Ethereum),
            "MATIC" => Ok(Blockchain::Polygon),
            "BSC" => Ok(Blockchain::BinanceSmartChain),
            "TRON" => Ok(Blockchain::Tron),
            _ => Err(format!("Invalid blockchain: {s}")),
        }
    }
}

impl fmt::Display for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Native coin or token contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrencyType {
    Coin,
    Token,
}

impl CurrencyType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrencyType::Coin => "coin",
            CurrencyType::Token => "token",
        }
    }
}

impl FromStr for CurrencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coin" => Ok(CurrencyType::Coin),
            "token" => Ok(CurrencyType::Token),
            _ => Err(format!("Invalid currency type: {s}")),
        }
    }
}

impl fmt::Display for CurrencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A currency the engine can hold and move.
///
/// Each entry pins the precision and, for tokens, the contract address on
/// both the production and the test network of its blockchain.
#[derive(Debug, Clone, PartialEq)]
pub struct Currency {
    pub ticker: &'static str,
    pub name: &'static str,
    pub blockchain: Blockchain,
    pub currency_type: CurrencyType,
    pub decimals: u32,
    mainnet_network_id: i64,
    testnet_network_id: i64,
    mainnet_contract: Option<&'static str>,
    testnet_contract: Option<&'static str>,
    /// Minimum USD value worth moving off an inbound wallet.
    pub min_transfer_usd: Decimal,
}

impl Currency {
    #[must_use]
    pub fn is_token(&self) -> bool {
        self.currency_type == CurrencyType::Token
    }

    #[must_use]
    pub fn network_id(&self, is_test: bool) -> i64 {
        if is_test {
            self.testnet_network_id
        } else {
            self.mainnet_network_id
        }
    }

    #[must_use]
    pub fn contract(&self, is_test: bool) -> Option<&'static str> {
        if is_test {
            self.testnet_contract
        } else {
            self.mainnet_contract
        }
    }

    /// Maps a network id to mainnet (`false`) or testnet (`true`).
    #[must_use]
    pub fn match_network_id(&self, network_id: i64) -> Option<bool> {
        if network_id == self.mainnet_network_id {
            Some(false)
        } else if network_id == self.testnet_network_id {
            Some(true)
        } else {
            None
        }
    }

    /// Precision of the blockchain's native coin. Network fees are always
    /// denominated in it, even for token transfers.
    #[must_use]
    pub fn network_decimals(&self) -> u32 {
        native_coin(self.blockchain).decimals
    }
}

static REGISTRY: OnceLock<Vec<Currency>> = OnceLock::new();

fn registry() -> &'static [Currency] {
    REGISTRY.get_or_init(builtin_currencies)
}

fn builtin_currencies() -> Vec<Currency> {
    vec![
        Currency {
            ticker: "ETH",
            name: "Ethereum",
            blockchain: Blockchain::Ethereum,
            currency_type: CurrencyType::Coin,
            decimals: 18,
            mainnet_network_id: 1,
            testnet_network_id: 5,
            mainnet_contract: None,
            testnet_contract: None,
            min_transfer_usd: Decimal::new(50, 0),
        },
        Currency {
            ticker: "USDT",
            name: "Tether USD (ERC-20)",
            blockchain: Blockchain::Ethereum,
            currency_type: CurrencyType::Token,
            decimals: 6,
            mainnet_network_id: 1,
            testnet_network_id: 5,
            mainnet_contract: Some("0xdAC17F958D2ee523a2206206994597C13D831ec7"),
            testnet_contract: Some("0x509Ee0d083DdF8AC028f2a56731412edD63223B9"),
            min_transfer_usd: Decimal::new(30, 0),
        },
        Currency {
            ticker: "USDC",
            name: "USD Coin (ERC-20)",
            blockchain: Blockchain::Ethereum,
            currency_type: CurrencyType::Token,
            decimals: 6,
            mainnet_network_id: 1,
            testnet_network_id: 5,
            mainnet_contract: Some("0xA0b86991c6218b36c1d19D4a2e9eB0cE3606eB48"),
            testnet_contract: Some("0x07865c6E87B9F70255377e024ace6630C1Eaa37F"),
            min_transfer_usd: Decimal::new(30, 0),
        },
        Currency {
            ticker: "MATIC",
            name: "Polygon",
            blockchain: Blockchain::Polygon,
            currency_type: CurrencyType::Coin,
            decimals: 18,
            mainnet_network_id: 137,
            testnet_network_id: 80001,
            mainnet_contract: None,
            testnet_contract: None,
            min_transfer_usd: Decimal::new(20, 0),
        },
        Currency {
            ticker: "USDT",
            name: "Tether USD (Polygon)",
            blockchain: Blockchain::Polygon,
            currency_type: CurrencyType::Token,
            decimals: 6,
            mainnet_network_id: 137,
            testnet_network_id: 80001,
            mainnet_contract: Some("0xc2132D05D31c914a87C6611C10748AEb04B58e8F"),
            testnet_contract: Some("0xA02f6adc7926efeBBd59Fd43A84f4E0c0c91e832"),
            min_transfer_usd: Decimal::new(20, 0),
        },
        Currency {
            ticker: "BNB",
            name: "BNB",
            blockchain: Blockchain::BinanceSmartChain,
            currency_type: CurrencyType::Coin,
            decimals: 18,
            mainnet_network_id: 56,
            testnet_network_id: 97,
            mainnet_contract: None,
            testnet_contract: None,
            min_transfer_usd: Decimal::new(30, 0),
        },
        Currency {
            ticker: "USDT",
            name: "Tether USD (BEP-20)",
            blockchain: Blockchain::BinanceSmartChain,
            currency_type: CurrencyType::Token,
            decimals: 18,
            mainnet_network_id: 56,
            testnet_network_id: 97,
            mainnet_contract: Some("0x55d398326f99059fF775485246999027B3197955"),
            testnet_contract: Some("0x337610d27c682E347C9cD60BD4b3b107C9d34dDd"),
            min_transfer_usd: Decimal::new(20, 0),
        },
        Currency {
            ticker: "TRX",
            name: "Tron",
            blockchain: Blockchain::Tron,
            currency_type: CurrencyType::Coin,
            decimals: 6,
            mainnet_network_id: 728126428,
            testnet_network_id: 2494104990,
            mainnet_contract: None,
            testnet_contract: None,
            min_transfer_usd: Decimal::new(20, 0),
        },
        Currency {
            ticker: "USDT",
            name: "Tether USD (TRC-20)",
            blockchain: Blockchain::Tron,
            currency_type: CurrencyType::Token,
            decimals: 6,
            mainnet_network_id: 728126428,
            testnet_network_id: 2494104990,
            mainnet_contract: Some("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t"),
            testnet_contract: Some("TG3XXyExBkPp9nzdajDZsozEu4BkaSJozs"),
            min_transfer_usd: Decimal::new(20, 0),
        },
    ]
}

/// Looks up a currency by blockchain and ticker.
#[must_use]
pub fn find(blockchain: Blockchain, ticker: &str) -> Option<&'static Currency> {
    let ticker = ticker.to_uppercase();
    registry()
        .iter()
        .find(|c| c.blockchain == blockchain && c.ticker == ticker)
}

/// Looks up a token by its contract address.
///
/// EVM addresses are matched case-insensitively since senders mix
/// checksummed and lowercase forms. Tron addresses are case-sensitive
/// base58.
#[must_use]
pub fn find_by_contract(
    blockchain: Blockchain,
    contract: &str,
    is_test: bool,
) -> Option<&'static Currency> {
    registry().iter().find(|c| {
        c.blockchain == blockchain
            && c.contract(is_test).is_some_and(|known| {
                if blockchain.is_evm() {
                    known.eq_ignore_ascii_case(contract)
                } else {
                    known == contract
                }
            })
    })
}

/// The native coin of a blockchain. Every supported blockchain has one.
#[must_use]
pub fn native_coin(blockchain: Blockchain) -> &'static Currency {
    registry()
        .iter()
        .find(|c| c.blockchain == blockchain && c.currency_type == CurrencyType::Coin)
        .unwrap_or(&registry()[0])
}

/// All registered currencies.
#[must_use]
pub fn all_currencies() -> &'static [Currency] {
    registry()
}
