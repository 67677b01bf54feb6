#![allow(clippy::new_without_default, clippy::type_complexity, clippy::needless_range_loop)]

pub mod qcommon;
pub mod q_shared;
pub mod common;
pub mod crc;
pub mod compression;
pub mod qfiles;
pub mod cvar;
pub mod cmd;
pub mod files;
