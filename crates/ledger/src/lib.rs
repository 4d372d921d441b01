pub mod developer;
pub mod pricing;
pub mod settlement;
pub mod wallet;

pub use developer::{DeveloperRewardService, DeveloperWallet, ListingEarningsStats};
pub use pricing::PricingTable;
pub use settlement::SettlementService;
pub use wallet::WalletLedger;
