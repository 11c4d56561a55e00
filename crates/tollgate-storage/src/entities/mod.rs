pub mod ledger_entries;
pub mod provider_costs;

pub use ledger_entries::Entity as LedgerEntries;
pub use provider_costs::Entity as ProviderCosts;
