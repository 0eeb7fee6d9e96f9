pub mod config;
pub mod csv_save;
pub mod monitor;
