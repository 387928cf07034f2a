mod account_list;
mod failed_list;
mod transaction_list;

pub use account_list::{visible_accounts, AccountListView};
pub use failed_list::FailedListView;
pub use transaction_list::TransactionListView;
