// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

pub mod command;
pub mod file_info;
pub mod greeting;
pub mod header;
pub mod numheader;

pub use command::CmdType;
pub use file_info::{FileInfo, FileKind};
pub use header::Msg;
