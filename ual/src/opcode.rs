use ual_derive::FromRepr;

use crate::errors::{ErrorSite, LoadError};
use crate::raw::reader::BinaryReader;

/// The byte that terminates a managed method body's opcode stream. Not a
/// real opcode: the verifier stops reading as soon as it sees this.
pub const END_OF_STREAM: u8 = 255;

/// One-byte opcode tag, per the largest consistent opcode set found across
/// the source's iterations (0-25).
#[derive(FromRepr, Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum OpCode {
	LdArg = 0,
	Call = 1,
	LdStr = 2,
	Ret = 3,
	LdcI4 = 4,
	StLoc = 5,
	Br = 6,
	LdLoc = 7,
	Add = 8,
	Ble = 9,
	Nop = 10,
	Beq = 11,
	Bne = 12,
	Bgt = 13,
	Bge = 14,
	Sub = 15,
	Mul = 16,
	Div = 17,
	Rem = 18,
	Shl = 19,
	Shr = 20,
	And = 21,
	Or = 22,
	Xor = 23,
	Not = 24,
	LdcR8 = 25,
}

/// A decoded instruction with its operands, borrowing string operands
/// straight out of the module's bytes.
#[derive(Clone, Debug)]
pub enum Instruction<'l> {
	LdArg(u32),
	Call(u32),
	LdStr(&'l str),
	Ret,
	LdcI4(u32),
	StLoc(u32),
	Br(u32),
	LdLoc(u32),
	Add,
	Ble(u32),
	Nop,
	Beq(u32),
	Bne(u32),
	Bgt(u32),
	Bge(u32),
	Sub,
	Mul,
	Div,
	Rem,
	Shl,
	Shr,
	And,
	Or,
	Xor,
	Not,
	LdcR8(f64),
}

/// Result of decoding one step of the opcode stream.
pub enum Decoded<'l> {
	Instruction { offset: u32, instruction: Instruction<'l> },
	End,
}

impl<'l> Instruction<'l> {
	/// Reads one opcode and its operands, or reports the end-of-stream
	/// sentinel. Errors carry no site context; callers attach it with
	/// [`LoadError::with_site`] once they know the enclosing class/method.
	pub fn decode(reader: &mut BinaryReader<'l>) -> Result<Decoded<'l>, LoadError> {
		let offset = reader.offset();
		let raw = reader.read_u8()?;
		if raw == END_OF_STREAM {
			return Ok(Decoded::End);
		}

		let opcode = OpCode::from_repr(raw).ok_or(LoadError::UnknownOpcode { opcode: raw, site: ErrorSite::none() })?;
		let instruction = match opcode {
			OpCode::LdArg => Instruction::LdArg(reader.read_u32()?),
			OpCode::Call => Instruction::Call(reader.read_u32()?),
			OpCode::LdStr => Instruction::LdStr(reader.read_cstr()?),
			OpCode::Ret => Instruction::Ret,
			OpCode::LdcI4 => Instruction::LdcI4(reader.read_u32()?),
			OpCode::StLoc => Instruction::StLoc(reader.read_u32()?),
			OpCode::Br => Instruction::Br(reader.read_u32()?),
			OpCode::LdLoc => Instruction::LdLoc(reader.read_u32()?),
			OpCode::Add => Instruction::Add,
			OpCode::Ble => Instruction::Ble(reader.read_u32()?),
			OpCode::Nop => Instruction::Nop,
			OpCode::Beq => Instruction::Beq(reader.read_u32()?),
			OpCode::Bne => Instruction::Bne(reader.read_u32()?),
			OpCode::Bgt => Instruction::Bgt(reader.read_u32()?),
			OpCode::Bge => Instruction::Bge(reader.read_u32()?),
			OpCode::Sub => Instruction::Sub,
			OpCode::Mul => Instruction::Mul,
			OpCode::Div => Instruction::Div,
			OpCode::Rem => Instruction::Rem,
			OpCode::Shl => Instruction::Shl,
			OpCode::Shr => Instruction::Shr,
			OpCode::And => Instruction::And,
			OpCode::Or => Instruction::Or,
			OpCode::Xor => Instruction::Xor,
			OpCode::Not => Instruction::Not,
			OpCode::LdcR8 => Instruction::LdcR8(reader.read_f64()?),
		};
		Ok(Decoded::Instruction { offset, instruction })
	}
}
