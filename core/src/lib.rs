pub mod ledger;
pub mod scanner;
