// SPDX-License-Identifier: MIT
// Copyright (c) 2025 the apx authors

//! Pack execution: walks a dynamic value by reference, driven by a pack
//! program, and writes the port's exact wire layout.

use crate::program::{Instruction, Program, ProgramType, Width};
use apx_core::{ApxError, DtlScalar, DtlValue};

struct Frame<'v> {
    value: &'v DtlValue,
    /// Frames entered through RecordSelect leave the stack as soon as one
    /// data instruction has consumed them.
    auto_pop: bool,
}

#[derive(Clone, Copy)]
struct ArraySpec {
    len: u32,
    width: Width,
    dynamic: bool,
}

pub struct Serializer<'v, 'b> {
    buf: &'b mut [u8],
    pos: usize,
    stack: Vec<Frame<'v>>,
    pending_array: Option<ArraySpec>,
    seen_dynamic: bool,
}

impl<'v, 'b> Serializer<'v, 'b> {
    pub fn new(buf: &'b mut [u8]) -> Self {
        Serializer { buf, pos: 0, stack: Vec::new(), pending_array: None, seen_dynamic: false }
    }

    /// Seed the root frame.
    pub fn set_value(&mut self, value: &'v DtlValue) {
        self.stack.clear();
        self.stack.push(Frame { value, auto_pop: false });
        self.pos = 0;
        self.pending_array = None;
        self.seen_dynamic = false;
    }

    /// Execute `program`; returns the number of bytes written.
    pub fn run(&mut self, program: &Program) -> Result<usize, ApxError> {
        if program.prog_type() != ProgramType::Pack {
            return Err(ApxError::InvalidProgram);
        }
        if self.stack.is_empty() {
            return Err(ApxError::MissingBuffer);
        }
        let data_size = program.data_size() as usize;
        if self.buf.len() < data_size {
            return Err(ApxError::BufferBoundary);
        }
        for inst in program.instructions() {
            self.exec(inst?)?;
        }
        if self.stack.len() != 1 {
            return Err(ApxError::InvalidProgram);
        }
        if self.pending_array.is_some() {
            return Err(ApxError::InvalidProgram);
        }
        let complete = if self.seen_dynamic { self.pos <= data_size } else { self.pos == data_size };
        if !complete {
            return Err(ApxError::LengthError);
        }
        Ok(self.pos)
    }

    fn exec(&mut self, inst: Instruction) -> Result<(), ApxError> {
        match inst {
            Instruction::Nop => Ok(()),
            Instruction::PackUint(width) => {
                self.pack_scalars(move |s, ser| {
                    let v = s.to_u32()?;
                    if v > width.max_value() {
                        return Err(ApxError::ValueError);
                    }
                    ser.write_le(u64::from(v), width.size())
                })
            }
            Instruction::PackSint(width) => {
                self.pack_scalars(move |s, ser| {
                    let v = s.to_i32()?;
                    let (min, max) = match width {
                        Width::One => (i8::MIN as i32, i8::MAX as i32),
                        Width::Two => (i16::MIN as i32, i16::MAX as i32),
                        Width::Four => (i32::MIN, i32::MAX),
                    };
                    if v < min || v > max {
                        return Err(ApxError::ValueError);
                    }
                    ser.write_le(v as u32 as u64, width.size())
                })
            }
            Instruction::PackBool => {
                self.pack_scalars(|s, ser| ser.write_le(u64::from(s.to_bool()?), 1))
            }
            Instruction::PackStr(len) => self.pack_str(len as usize),
            Instruction::ArrayEnter { len, width, dynamic } => {
                if self.pending_array.is_some() {
                    return Err(ApxError::InvalidProgram);
                }
                self.pending_array = Some(ArraySpec { len, width, dynamic });
                Ok(())
            }
            Instruction::RecordPush => {
                let current = self.current()?;
                current.value.as_record()?;
                Ok(())
            }
            Instruction::RecordPop => self.pop_explicit(),
            Instruction::RecordSelect(key) => {
                let parent = self.current()?.value;
                let child = parent.get(&key)?;
                self.stack.push(Frame { value: child, auto_pop: true });
                Ok(())
            }
            _ => Err(ApxError::InvalidProgram),
        }
    }

    /// Pack the current value — one scalar, or every element of the pending
    /// array — through `write_one`, then auto-pop a selected frame.
    fn pack_scalars<F>(&mut self, write_one: F) -> Result<(), ApxError>
    where
        F: Fn(&DtlScalar, &mut Self) -> Result<(), ApxError>,
    {
        let spec = self.pending_array.take();
        let value = self.current()?.value;
        match spec {
            None => {
                let scalar = value.as_scalar()?.clone();
                write_one(&scalar, self)?;
            }
            Some(spec) => {
                let items = value.as_array()?.to_vec();
                if spec.dynamic {
                    if items.len() > spec.len as usize {
                        return Err(ApxError::LengthError);
                    }
                    self.seen_dynamic = true;
                    self.write_le(items.len() as u64, spec.width.size())?;
                } else if items.len() != spec.len as usize {
                    return Err(ApxError::LengthError);
                }
                for item in &items {
                    let scalar = item.as_scalar()?.clone();
                    write_one(&scalar, self)?;
                }
            }
        }
        self.auto_pop();
        Ok(())
    }

    fn pack_str(&mut self, write_len: usize) -> Result<(), ApxError> {
        if self.pending_array.is_some() {
            return Err(ApxError::InvalidProgram);
        }
        let value = self.current()?.value;
        let text = value.as_scalar()?.as_str()?.to_string();
        let bytes = text.as_bytes();
        if bytes.len() > write_len {
            return Err(ApxError::LengthError);
        }
        self.write_bytes(bytes)?;
        for _ in bytes.len()..write_len {
            self.write_bytes(&[0])?;
        }
        self.auto_pop();
        Ok(())
    }

    fn current(&self) -> Result<&Frame<'v>, ApxError> {
        self.stack.last().ok_or(ApxError::StackUnderflow)
    }

    fn auto_pop(&mut self) {
        if self.stack.len() > 1 && self.stack.last().map(|f| f.auto_pop).unwrap_or(false) {
            self.stack.pop();
        }
    }

    fn pop_explicit(&mut self) -> Result<(), ApxError> {
        if self.stack.len() <= 1 {
            return Err(ApxError::StackUnderflow);
        }
        self.stack.pop();
        Ok(())
    }

    fn write_le(&mut self, value: u64, n: usize) -> Result<(), ApxError> {
        let bytes = value.to_le_bytes();
        self.write_bytes(&bytes[..n])
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), ApxError> {
        if self.pos + bytes.len() > self.buf.len() {
            return Err(ApxError::BufferBoundary);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ProgramBuilder;

    fn run(program_bytes: &[u8], value: &DtlValue, buf_len: usize) -> Result<Vec<u8>, ApxError> {
        let program = Program::parse(program_bytes).unwrap();
        let mut buf = vec![0u8; buf_len];
        let mut ser = Serializer::new(&mut buf);
        ser.set_value(value);
        let written = ser.run(&program)?;
        buf.truncate(written);
        Ok(buf)
    }

    #[test]
    fn test_pack_record_of_u8() {
        let program = ProgramBuilder::new(ProgramType::Pack, 3)
            .select("Red")
            .uint(Width::One)
            .select("Green")
            .uint(Width::One)
            .select("Blue")
            .uint(Width::One)
            .build();
        let value = DtlValue::record(vec![
            ("Red", DtlValue::u32(0xff)),
            ("Green", DtlValue::u32(0x12)),
            ("Blue", DtlValue::u32(0xaa)),
        ]);
        assert_eq!(run(&program, &value, 3).unwrap(), vec![0xff, 0x12, 0xaa]);
    }

    #[test]
    fn test_pack_fixed_str_and_u32() {
        let program = ProgramBuilder::new(ProgramType::Pack, 16)
            .select("Name")
            .string(12)
            .select("Id")
            .uint(Width::Four)
            .build();
        let value = DtlValue::record(vec![
            ("Name", DtlValue::str("George")),
            ("Id", DtlValue::u32(0x12345678)),
        ]);
        let mut expected = b"George\0\0\0\0\0\0".to_vec();
        expected.extend_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(run(&program, &value, 16).unwrap(), expected);
    }

    #[test]
    fn test_pack_fixed_array() {
        let program =
            ProgramBuilder::new(ProgramType::Pack, 6).array(3, Width::One).uint(Width::Two).build();
        let value = DtlValue::array(vec![
            DtlValue::u32(0x0102),
            DtlValue::u32(0x0304),
            DtlValue::u32(0x0506),
        ]);
        assert_eq!(run(&program, &value, 6).unwrap(), vec![0x02, 0x01, 0x04, 0x03, 0x06, 0x05]);
    }

    #[test]
    fn test_pack_dynamic_array_writes_length_prefix() {
        let program = ProgramBuilder::new(ProgramType::Pack, 9)
            .dyn_array(8, Width::One)
            .uint(Width::One)
            .build();
        let value = DtlValue::array(vec![DtlValue::u32(5), DtlValue::u32(6)]);
        assert_eq!(run(&program, &value, 9).unwrap(), vec![2, 5, 6]);
    }

    #[test]
    fn test_array_length_mismatch() {
        let program =
            ProgramBuilder::new(ProgramType::Pack, 3).array(3, Width::One).uint(Width::One).build();
        let value = DtlValue::array(vec![DtlValue::u32(1)]);
        assert!(matches!(run(&program, &value, 3), Err(ApxError::LengthError)));
    }

    #[test]
    fn test_string_too_long() {
        let program = ProgramBuilder::new(ProgramType::Pack, 4).string(4).build();
        let value = DtlValue::str("hello");
        assert!(matches!(run(&program, &value, 4), Err(ApxError::LengthError)));
    }

    #[test]
    fn test_missing_record_key() {
        let program =
            ProgramBuilder::new(ProgramType::Pack, 1).select("Gone").uint(Width::One).build();
        let value = DtlValue::record(vec![("Here", DtlValue::u32(1))]);
        assert!(matches!(run(&program, &value, 1), Err(ApxError::KeyNotFound(_))));
    }

    #[test]
    fn test_value_out_of_range_for_width() {
        let program = ProgramBuilder::new(ProgramType::Pack, 1).uint(Width::One).build();
        let value = DtlValue::u32(0x100);
        assert!(matches!(run(&program, &value, 1), Err(ApxError::ValueError)));
    }

    #[test]
    fn test_incomplete_write_is_length_error() {
        // Program claims 4 bytes but only packs one.
        let program = ProgramBuilder::new(ProgramType::Pack, 4).uint(Width::One).build();
        let value = DtlValue::u32(9);
        assert!(matches!(run(&program, &value, 4), Err(ApxError::LengthError)));
    }
}
