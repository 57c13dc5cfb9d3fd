pub mod settlement_monitor;
