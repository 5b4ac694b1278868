pub mod pnl_service;
pub mod recon_service;
