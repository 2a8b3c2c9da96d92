//! Pure 8-bit arithmetic with status flags.
//!
//! Every operation is computed at 16-bit precision and truncated to a byte.
//! Flags are always produced as a complete set; nothing here holds state.

use serde::{Deserialize, Serialize};

use crate::error::MachineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl AluOp {
    pub fn symbol(&self) -> char {
        match self {
            AluOp::Add => '+',
            AluOp::Sub => '-',
            AluOp::Mul => '*',
            AluOp::Div => '/',
        }
    }
}

/// Carry, Zero, Overflow and Sign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub carry: bool,
    pub zero: bool,
    pub overflow: bool,
    pub sign: bool,
}

impl Flags {
    fn from_result(result: u8, carry: bool, overflow: bool) -> Self {
        Flags {
            carry,
            zero: result == 0,
            overflow,
            sign: result & 0x80 != 0,
        }
    }

    /// Packs the flags into the low nibble as `SOZC`.
    pub fn bits(&self) -> u8 {
        (self.carry as u8) | (self.zero as u8) << 1 | (self.overflow as u8) << 2 | (self.sign as u8) << 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AluOutput {
    pub op: AluOp,
    pub a: u8,
    pub b: u8,
    pub result: u8,
    /// High byte of the product for MUL, remainder for DIV, zero otherwise.
    pub extended: u8,
    pub flags: Flags,
}

pub fn execute(op: AluOp, a: u8, b: u8) -> Result<AluOutput, MachineError> {
    match op {
        AluOp::Add => Ok(add(a, b)),
        AluOp::Sub => Ok(sub(a, b)),
        AluOp::Mul => Ok(mul(a, b)),
        AluOp::Div => div(a, b),
    }
}

pub fn add(a: u8, b: u8) -> AluOutput {
    let wide = a as u16 + b as u16;
    let result = wide as u8;
    let overflow = (a ^ result) & (b ^ result) & 0x80 != 0;

    AluOutput {
        op: AluOp::Add,
        a,
        b,
        result,
        extended: 0,
        flags: Flags::from_result(result, wide > 0xFF, overflow),
    }
}

pub fn sub(a: u8, b: u8) -> AluOutput {
    let wide = (a as i16) - (b as i16);
    let result = wide as u8;
    // a - b overflows when the operands differ in sign and the result's
    // sign differs from a.
    let overflow = (a ^ b) & (a ^ result) & 0x80 != 0;

    AluOutput {
        op: AluOp::Sub,
        a,
        b,
        result,
        extended: 0,
        flags: Flags::from_result(result, a < b, overflow),
    }
}

pub fn mul(a: u8, b: u8) -> AluOutput {
    let product = a as u16 * b as u16;
    let result = product as u8;

    AluOutput {
        op: AluOp::Mul,
        a,
        b,
        result,
        extended: (product >> 8) as u8,
        flags: Flags::from_result(result, false, false),
    }
}

pub fn div(a: u8, b: u8) -> Result<AluOutput, MachineError> {
    if b == 0 {
        return Err(MachineError::DivisionByZero);
    }
    let result = a / b;

    Ok(AluOutput {
        op: AluOp::Div,
        a,
        b,
        result,
        extended: a % b,
        flags: Flags::from_result(result, false, false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_basic() {
        let out = add(0x10, 0x20);
        assert_eq!(out.result, 0x30);
        assert!(!out.flags.carry);
        assert!(!out.flags.zero);
        assert!(!out.flags.overflow);
        assert!(!out.flags.sign);
    }

    #[test]
    fn test_add_carry_flag() {
        let out = add(0xFF, 0x02);
        assert_eq!(out.result, 0x01);
        assert!(out.flags.carry);
        assert!(!out.flags.zero);
    }

    #[test]
    fn test_add_overflow_flag() {
        let out = add(0x7F, 0x01);
        assert_eq!(out.result, 0x80);
        assert!(!out.flags.carry);
        assert!(out.flags.overflow);
        assert!(out.flags.sign);
    }

    #[test]
    fn test_add_wraps_to_zero() {
        let out = add(0x80, 0x80);
        assert_eq!(out.result, 0x00);
        assert!(out.flags.carry);
        assert!(out.flags.zero);
        assert!(out.flags.overflow);
    }

    #[test]
    fn test_sub_borrow() {
        let out = sub(5, 10);
        assert_eq!(out.result, 251);
        assert!(out.flags.carry);
        assert!(out.flags.sign);
        assert!(!out.flags.overflow);
    }

    #[test]
    fn test_sub_equal_operands_sets_zero() {
        let out = sub(42, 42);
        assert_eq!(out.result, 0);
        assert!(out.flags.zero);
        assert!(!out.flags.carry);
    }

    #[test]
    fn test_sub_signed_overflow() {
        // -128 - 1 does not fit in a signed byte
        let out = sub(0x80, 0x01);
        assert_eq!(out.result, 0x7F);
        assert!(out.flags.overflow);
        assert!(!out.flags.sign);
    }

    #[test]
    fn test_mul_keeps_high_byte_separately() {
        let out = mul(20, 20);
        assert_eq!(out.result, (400u16 % 256) as u8);
        assert_eq!(out.extended, 1);
        assert!(!out.flags.carry);
        assert!(!out.flags.overflow);
    }

    #[test]
    fn test_div_quotient_and_remainder() {
        let out = div(17, 5).unwrap();
        assert_eq!(out.result, 3);
        assert_eq!(out.extended, 2);
        assert!(!out.flags.carry);
    }

    #[test]
    fn test_div_by_zero_faults() {
        assert_eq!(div(9, 0), Err(MachineError::DivisionByZero));
        assert_eq!(execute(AluOp::Div, 0, 0), Err(MachineError::DivisionByZero));
    }

    #[test]
    fn test_flag_bits() {
        let flags = Flags {
            carry: true,
            zero: false,
            overflow: true,
            sign: true,
        };
        assert_eq!(flags.bits(), 0b1101);
    }
}
