mod common;
mod reconciliation;
mod scenarios;
