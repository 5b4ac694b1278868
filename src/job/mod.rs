pub mod bot_worker;
pub mod queue;
pub mod recon_job;
