#![allow(dead_code)]

pub mod app_config;
pub mod coordination;
pub mod error;
pub mod job;
pub mod time_util;
pub mod trading;
