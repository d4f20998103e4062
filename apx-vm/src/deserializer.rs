// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Unpack execution: reads the port's wire layout and rebuilds the dynamic
//! value tree.

use crate::program::{Instruction, Program, ProgramType, Width};
use apx_core::{ApxError, DtlScalar, DtlValue};
use std::collections::HashMap;

#[derive(Clone, Copy)]
struct ArraySpec {
    len: u32,
    width: Width,
    dynamic: bool,
}

#[derive(Default)]
struct BuildFrame {
    record: HashMap<String, DtlValue>,
    pending_key: Option<String>,
    /// Implicit frames are opened by a RecordSelect with no enclosing
    /// RecordPush and closed automatically at end of program.
    implicit: bool,
}

pub struct Deserializer<'d> {
    data: &'d [u8],
    pos: usize,
    stack: Vec<BuildFrame>,
    root: Option<DtlValue>,
    pending_array: Option<ArraySpec>,
    seen_dynamic: bool,
}

impl<'d> Deserializer<'d> {
    pub fn new(data: &'d [u8]) -> Self {
        Deserializer {
            data,
            pos: 0,
            stack: Vec::new(),
            root: None,
            pending_array: None,
            seen_dynamic: false,
        }
    }

    /// Execute `program` and return the rebuilt value.
    pub fn run(&mut self, program: &Program) -> Result<DtlValue, ApxError> {
        if program.prog_type() != ProgramType::Unpack {
            return Err(ApxError::InvalidProgram);
        }
        let data_size = program.data_size() as usize;
        if self.data.len() > data_size {
            return Err(ApxError::LengthError);
        }
        for inst in program.instructions() {
            self.exec(inst?)?;
        }
        if let Some(frame) = self.stack.pop() {
            if !self.stack.is_empty() || !frame.implicit || frame.pending_key.is_some() {
                return Err(ApxError::InvalidProgram);
            }
            self.produce(DtlValue::Record(frame.record))?;
        }
        // Dynamic data may leave padding behind the actual elements when the
        // buffer is sized for the maximum length.
        if self.seen_dynamic {
            if self.pos > data_size {
                return Err(ApxError::LengthError);
            }
        } else if self.pos != data_size || self.pos != self.data.len() {
            return Err(ApxError::LengthError);
        }
        self.root.take().ok_or(ApxError::InvalidProgram)
    }

    fn exec(&mut self, inst: Instruction) -> Result<(), ApxError> {
        match inst {
            Instruction::Nop => Ok(()),
            Instruction::UnpackUint(width) => self.unpack_scalars(move |de| {
                let raw = de.read_le(width.size())?;
                Ok(DtlValue::Scalar(DtlScalar::U32(raw as u32)))
            }),
            Instruction::UnpackSint(width) => self.unpack_scalars(move |de| {
                let raw = de.read_le(width.size())?;
                let value = match width {
                    Width::One => i32::from(raw as u8 as i8),
                    Width::Two => i32::from(raw as u16 as i16),
                    Width::Four => raw as u32 as i32,
                };
                Ok(DtlValue::Scalar(DtlScalar::I32(value)))
            }),
            Instruction::UnpackBool => self.unpack_scalars(|de| {
                let raw = de.read_le(1)?;
                Ok(DtlValue::Scalar(DtlScalar::Bool(raw != 0)))
            }),
            Instruction::UnpackStr(len) => self.unpack_str(len as usize),
            Instruction::ArrayEnter { len, width, dynamic } => {
                if self.pending_array.is_some() {
                    return Err(ApxError::InvalidProgram);
                }
                self.pending_array = Some(ArraySpec { len, width, dynamic });
                Ok(())
            }
            Instruction::RecordPush => {
                self.stack.push(BuildFrame::default());
                Ok(())
            }
            Instruction::RecordPop => {
                let frame = self.stack.pop().ok_or(ApxError::StackUnderflow)?;
                if frame.pending_key.is_some() {
                    return Err(ApxError::InvalidProgram);
                }
                self.produce(DtlValue::Record(frame.record))
            }
            Instruction::RecordSelect(key) => {
                if self.stack.is_empty() {
                    self.stack.push(BuildFrame { implicit: true, ..Default::default() });
                }
                let frame = self.stack.last_mut().ok_or(ApxError::StackUnderflow)?;
                if frame.pending_key.replace(key).is_some() {
                    return Err(ApxError::InvalidProgram);
                }
                Ok(())
            }
            _ => Err(ApxError::InvalidProgram),
        }
    }

    fn unpack_scalars<F>(&mut self, read_one: F) -> Result<(), ApxError>
    where
        F: Fn(&mut Self) -> Result<DtlValue, ApxError>,
    {
        let spec = self.pending_array.take();
        let value = match spec {
            None => read_one(self)?,
            Some(spec) => {
                let count = if spec.dynamic {
                    self.seen_dynamic = true;
                    let actual = self.read_le(spec.width.size())? as u32;
                    if actual > spec.len {
                        return Err(ApxError::LengthError);
                    }
                    actual
                } else {
                    spec.len
                };
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(read_one(self)?);
                }
                DtlValue::Array(items)
            }
        };
        self.produce(value)
    }

    fn unpack_str(&mut self, len: usize) -> Result<(), ApxError> {
        if self.pending_array.is_some() {
            return Err(ApxError::InvalidProgram);
        }
        let bytes = self.read_bytes(len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(len);
        let text =
            std::str::from_utf8(&bytes[..end]).map_err(|_| ApxError::ValueError)?.to_string();
        self.produce(DtlValue::Scalar(DtlScalar::Str(text)))
    }

    /// Attach a finished value: under the pending key of the innermost
    /// record, or as the root.
    fn produce(&mut self, value: DtlValue) -> Result<(), ApxError> {
        if let Some(frame) = self.stack.last_mut() {
            let key = frame.pending_key.take().ok_or(ApxError::InvalidProgram)?;
            frame.record.insert(key, value);
            Ok(())
        } else if self.root.is_none() {
            self.root = Some(value);
            Ok(())
        } else {
            Err(ApxError::InvalidProgram)
        }
    }

    fn read_le(&mut self, n: usize) -> Result<u64, ApxError> {
        let bytes = self.read_bytes(n)?;
        let mut raw = [0u8; 8];
        raw[..n].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'d [u8], ApxError> {
        if self.pos + n > self.data.len() {
            return Err(ApxError::BufferBoundary);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}
