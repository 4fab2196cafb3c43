//! ARMv7E-M (Thumb / Thumb-2) instruction set support: decoded instruction
//! model, the two-stage decoder, and the pure ALU helper library.
//!
//! Nothing in this crate touches machine state; the decoder is a pure
//! function from halfwords to [`Instruction`] and the ALU helpers are pure
//! functions over 32-bit words. Execution lives in `pocket-cpu`.

pub mod alu;
pub mod decode;
pub mod inst;

pub use decode::{decode, is_thumb32};
pub use inst::{Cond, Instruction, Op, Operand2, Operands, Shift};
