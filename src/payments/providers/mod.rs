pub mod bank_transfer;
pub mod card_gateway;
pub mod manual;
pub mod mobile_wallet;

pub use bank_transfer::BankTransferProvider;
pub use card_gateway::CardGatewayProvider;
pub use manual::ManualProvider;
pub use mobile_wallet::MobileWalletProvider;
