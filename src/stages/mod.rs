pub mod entity;
pub mod execution;
pub mod ingest;
pub mod llm_signal;
pub mod monitoring;
pub mod persistence;
pub mod portfolio;
pub mod position_pnl;
pub mod position_sync;
pub mod risk;
pub mod signal_fusion;
pub mod universe;
