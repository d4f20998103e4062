// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

pub mod deserializer;
pub mod program;
pub mod serializer;

pub use deserializer::Deserializer;
pub use program::{Instruction, Program, ProgramBuilder, ProgramHeader, ProgramType, Width};
pub use serializer::Serializer;
