//! Two-pass assembler: turns the textual program format into a
//! `Vec<Instruction>`, resolving labels to instruction indices.
//!
//! Syntax: one instruction or label per line. A label is an identifier
//! followed by `:`. `;` and `#` start a line comment. Instructions are
//! `OPCODE operand[, operand...]`. Register operands are written `R<n>` or
//! `REG<n>` (case-insensitive); anything else is parsed as a decimal
//! immediate, or, for jump targets, as a label name resolved in the second
//! pass.

use std::collections::HashMap;

use crate::error::{SimError, SimResult};
use crate::instruction::{Instruction, OpCode};

fn strip_comment(line: &str) -> &str {
    let cut = line
        .find(';')
        .into_iter()
        .chain(line.find('#'))
        .min()
        .unwrap_or(line.len());
    &line[..cut]
}

/// Parse a register operand of the form `R<n>` / `REG<n>` (case
/// insensitive). Returns `None` if `token` isn't a register reference.
fn parse_register(token: &str) -> Option<i64> {
    let upper = token.to_ascii_uppercase();
    let digits = if let Some(rest) = upper.strip_prefix("REG") {
        rest
    } else if let Some(rest) = upper.strip_prefix('R') {
        rest
    } else {
        return None;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()
}

fn parse_opcode(token: &str) -> SimResult<OpCode> {
    match token.to_ascii_uppercase().as_str() {
        "NOP" => Ok(OpCode::Nop),
        "LOAD" => Ok(OpCode::Load),
        "STORE" => Ok(OpCode::Store),
        "FMUL" => Ok(OpCode::FMul),
        "FADD" => Ok(OpCode::FAdd),
        "INC" => Ok(OpCode::Inc),
        "DEC" => Ok(OpCode::Dec),
        "JNZ" => Ok(OpCode::Jnz),
        "DIV" => Ok(OpCode::Div),
        "MUL" => Ok(OpCode::Mul),
        "MOVE" => Ok(OpCode::Move),
        "ADD" => Ok(OpCode::Add),
        "CMP" => Ok(OpCode::Cmp),
        "JL" => Ok(OpCode::Jl),
        "JLE" => Ok(OpCode::Jle),
        other => Err(SimError::ProgramError(format!("unknown opcode {:?}", other))),
    }
}

/// An operand, before label resolution: either a register, an immediate
/// literal, or a bare identifier assumed to be a label (only valid for jump
/// targets).
enum RawOperand {
    Register(i64),
    Immediate(i64),
    Label(String),
}

fn parse_operand(token: &str) -> RawOperand {
    if let Some(r) = parse_register(token) {
        return RawOperand::Register(r);
    }
    if let Ok(v) = token.parse::<i64>() {
        return RawOperand::Immediate(v);
    }
    RawOperand::Label(token.to_string())
}

struct RawInstruction {
    op: OpCode,
    operands: Vec<RawOperand>,
    line_no: usize,
}

/// Assemble `source` into a flat instruction list, resolving label
/// references in jump targets to instruction indices.
pub fn assemble(source: &str) -> SimResult<Vec<Instruction>> {
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut raw: Vec<RawInstruction> = Vec::new();

    for (line_no, line) in source.lines().enumerate() {
        let stripped = strip_comment(line).trim();
        if stripped.is_empty() {
            continue;
        }

        if let Some(label) = stripped.strip_suffix(':') {
            let label = label.trim().to_string();
            if labels.insert(label.clone(), raw.len()).is_some() {
                return Err(SimError::ProgramError(format!(
                    "duplicate label {:?} at line {}",
                    label,
                    line_no + 1
                )));
            }
            continue;
        }

        let mut parts = stripped.splitn(2, char::is_whitespace);
        let op_token = parts.next().unwrap_or("");
        let op = parse_opcode(op_token)?;
        let rest = parts.next().unwrap_or("");
        let operands = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_operand)
            .collect();

        raw.push(RawInstruction {
            op,
            operands,
            line_no: line_no + 1,
        });
    }

    raw.into_iter().map(|r| resolve(r, &labels)).collect()
}

fn resolve(raw: RawInstruction, labels: &HashMap<String, usize>) -> SimResult<Instruction> {
    let mut rd: i64 = -1;
    let mut ra: i64 = -1;
    let mut rb: i64 = -1;
    let mut imm: i64 = 0;

    let slot_for = |op: OpCode| -> &'static [&'static str] {
        match op {
            OpCode::Nop => &[],
            OpCode::Load => &["rd", "ra_or_imm"],
            OpCode::Store => &["ra", "rb_or_imm"],
            OpCode::FMul | OpCode::FAdd => &["rd", "ra", "rb"],
            OpCode::Inc | OpCode::Dec => &["rd"],
            OpCode::Jnz | OpCode::Jl | OpCode::Jle => &["target"],
            OpCode::Div | OpCode::Mul | OpCode::Add => &["rd", "ra", "rb_or_imm"],
            OpCode::Move => &["rd", "ra_or_imm"],
            OpCode::Cmp => &["ra", "rb_or_imm"],
        }
    };

    let slots = slot_for(raw.op);
    if raw.operands.len() != slots.len() {
        return Err(SimError::ProgramError(format!(
            "line {}: {:?} expects {} operand(s), found {}",
            raw.line_no,
            raw.op,
            slots.len(),
            raw.operands.len()
        )));
    }

    let require_register = |name: &str, operand: RawOperand, line_no: usize| -> SimResult<i64> {
        match operand {
            RawOperand::Register(r) => Ok(r),
            other => Err(SimError::ProgramError(format!(
                "line {}: operand {} must be a register, found {}",
                line_no,
                name,
                match other {
                    RawOperand::Immediate(v) => v.to_string(),
                    RawOperand::Label(l) => l,
                    RawOperand::Register(_) => unreachable!(),
                }
            ))),
        }
    };

    for (slot, operand) in slots.iter().zip(raw.operands.into_iter()) {
        match *slot {
            "rd" => rd = require_register("rd", operand, raw.line_no)?,
            "ra" => ra = require_register("ra", operand, raw.line_no)?,
            "rb" => rb = require_register("rb", operand, raw.line_no)?,
            "ra_or_imm" => match operand {
                RawOperand::Register(r) => ra = r,
                RawOperand::Immediate(v) => imm = v,
                RawOperand::Label(l) => {
                    imm = *labels.get(&l).ok_or_else(|| {
                        SimError::ProgramError(format!(
                            "line {}: unresolved label {:?}",
                            raw.line_no, l
                        ))
                    })? as i64;
                }
            },
            "rb_or_imm" => match operand {
                RawOperand::Register(r) => rb = r,
                RawOperand::Immediate(v) => imm = v,
                RawOperand::Label(l) => {
                    imm = *labels.get(&l).ok_or_else(|| {
                        SimError::ProgramError(format!(
                            "line {}: unresolved label {:?}",
                            raw.line_no, l
                        ))
                    })? as i64;
                }
            },
            "target" => match operand {
                RawOperand::Immediate(v) => imm = v,
                RawOperand::Label(l) => {
                    imm = *labels.get(&l).ok_or_else(|| {
                        SimError::ProgramError(format!(
                            "line {}: unresolved label {:?}",
                            raw.line_no, l
                        ))
                    })? as i64;
                }
                RawOperand::Register(_) => {
                    return Err(SimError::ProgramError(format!(
                        "line {}: jump target must be a label or immediate",
                        raw.line_no
                    )))
                }
            },
            _ => unreachable!(),
        }
    }

    Ok(Instruction::new(raw.op, rd, ra, rb, imm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_simple_program() {
        let src = "MOVE R1, 5\nINC R1\nJNZ done\ndone:\nNOP\n";
        let program = assemble(src).unwrap();
        assert_eq!(program.len(), 4);
        assert_eq!(program[0].op, OpCode::Move);
        assert_eq!(program[2].op, OpCode::Jnz);
        assert_eq!(program[2].imm, 3);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let src = "; a comment\n\n# another\nNOP\n";
        let program = assemble(src).unwrap();
        assert_eq!(program.len(), 1);
    }

    #[test]
    fn register_parsing_is_case_insensitive_and_accepts_reg_prefix() {
        assert_eq!(parse_register("r3"), Some(3));
        assert_eq!(parse_register("REG12"), Some(12));
        assert_eq!(parse_register("reg0"), Some(0));
        assert_eq!(parse_register("ROTTEN"), None);
    }

    #[test]
    fn unknown_opcode_errors() {
        let src = "FROB R1, R2\n";
        assert!(assemble(src).is_err());
    }

    #[test]
    fn unresolved_label_errors() {
        let src = "JNZ nowhere\n";
        assert!(assemble(src).is_err());
    }
}
