pub mod app;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod formats;
pub mod fs_util;
pub mod lock;
pub mod manifest;
pub mod modality;
pub mod naming;
pub mod output;
pub mod separator;
pub mod store;
pub mod validator;
