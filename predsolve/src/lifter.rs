//! A lifter from the textual listing format.
//!
//! ```text
//! ; comments run to the end of the line
//! function 0x1000 check x86_64
//!   0x1000 a = input
//!   0x1004 x = 7
//!   0x1008 if x == 7 goto 0x1010
//!   0x100c a = a + 1
//!   0x1010 ret
//! end
//! ```
//!
//! The function header takes an entry address, a name and an optional architecture; `-` stands
//! for an unknown name or architecture. A function without an architecture is listed but never
//! patched. Statements are `nop`, `ret`, `goto <addr>`, `if <expr> goto <addr>`,
//! `<var> = input` and `<var> = <expr>`,
//! where an expression is an operand or two operands joined by one of [`BinOp::SPELLINGS`].
//! Addresses are hexadecimal with or without `0x`; constants are hexadecimal with `0x`, decimal
//! otherwise. [`Listing`]'s `Display` output lifts back to the same listing.

use crate::error::malformed_error;
use crate::listing::{BinOp, Expr, Function, Instruction, Listing, Op, Operand};
use crate::log::*;
use crate::Result;

use std::collections::BTreeMap;

use itertools::Itertools;

/// Lift a textual listing into a [`Listing`], reachability already computed.
pub fn lift_from(text: &str) -> Result<Listing> {
    let mut functions = vec![];
    let mut current: Option<PartialFunction> = None;
    let mut seen_addresses: BTreeMap<u64, usize> = BTreeMap::new();

    for (n, raw) in text.lines().enumerate() {
        let line = n + 1;
        let l = match raw.split_once(';') {
            Some((code, _comment)) => code,
            None => raw,
        }
        .trim();
        if l.is_empty() {
            continue;
        }

        if let Some(header) = l.strip_prefix("function ") {
            if let Some(open) = &current {
                return Err(malformed_error!(
                    line,
                    "function started before function at line {} ended",
                    open.line
                ));
            }
            current = Some(parse_header(line, header)?);
        } else if l == "end" {
            let f = current
                .take()
                .ok_or_else(|| malformed_error!(line, "`end` outside of a function"))?;
            functions.push(f.finish(line)?);
        } else {
            let f = current
                .as_mut()
                .ok_or_else(|| malformed_error!(line, "instruction outside of a function"))?;
            let (addr, stmt) = l
                .split_once(char::is_whitespace)
                .ok_or_else(|| malformed_error!(line, "expected `<address> <statement>`"))?;
            let address = parse_address(line, addr)?;
            if let Some(prev) = seen_addresses.insert(address, line) {
                return Err(malformed_error!(
                    line,
                    "address {:#x} already used at line {}",
                    address,
                    prev
                ));
            }
            let op = parse_statement(line, stmt.trim())?;
            f.instructions.push(Instruction { address, op });
        }
    }

    if let Some(open) = current {
        return Err(malformed_error!(
            open.line,
            "function {:#x} is missing its `end`",
            open.entry
        ));
    }

    debug!("Lifted listing";
           "functions" => functions.len(),
           "instructions" => functions.iter().map(|f| f.instructions.len()).sum::<usize>());
    Ok(Listing::new(functions))
}

struct PartialFunction {
    line: usize,
    entry: u64,
    name: Option<String>,
    architecture: Option<String>,
    instructions: Vec<Instruction>,
}

impl PartialFunction {
    fn finish(self, end_line: usize) -> Result<Function> {
        if !self.instructions.is_empty()
            && !self.instructions.iter().any(|i| i.address == self.entry)
        {
            return Err(malformed_error!(
                end_line,
                "entry {:#x} of the function at line {} is not one of its instructions",
                self.entry,
                self.line
            ));
        }
        Ok(Function::new(
            self.name,
            self.entry,
            self.architecture,
            self.instructions,
        ))
    }
}

fn parse_header(line: usize, header: &str) -> Result<PartialFunction> {
    let tokens = header.split_whitespace().collect_vec();
    let (entry, name, architecture) = match tokens.as_slice() {
        [entry, name] => (entry, name, None),
        [entry, name, arch] => (entry, name, (*arch != "-").then(|| arch.to_string())),
        _ => {
            return Err(malformed_error!(
                line,
                "expected `function <address> <name> [architecture]`"
            ))
        }
    };
    Ok(PartialFunction {
        line,
        entry: parse_address(line, entry)?,
        name: (*name != "-").then(|| name.to_string()),
        architecture,
        instructions: vec![],
    })
}

fn parse_address(line: usize, s: &str) -> Result<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| malformed_error!(line, "bad address `{}`", s))
}

fn parse_statement(line: usize, s: &str) -> Result<Op> {
    if s == "nop" {
        return Ok(Op::Nop);
    }
    if s == "ret" {
        return Ok(Op::Return);
    }
    if let Some(target) = s.strip_prefix("goto ") {
        return Ok(Op::Branch {
            target: parse_address(line, target.trim())?,
        });
    }
    if let Some(rest) = s.strip_prefix("if ") {
        let (cond, target) = rest
            .rsplit_once(" goto ")
            .ok_or_else(|| malformed_error!(line, "expected `if <expr> goto <address>`"))?;
        return Ok(Op::CondBranch {
            cond: parse_expr(line, cond.trim())?,
            target: parse_address(line, target.trim())?,
        });
    }
    if let Some((dst, rhs)) = s.split_once('=') {
        let dst = parse_identifier(line, dst.trim())?;
        let rhs = rhs.trim();
        return Ok(if rhs == "input" {
            Op::Input { dst }
        } else {
            Op::Assign {
                dst,
                expr: parse_expr(line, rhs)?,
            }
        });
    }
    Err(malformed_error!(line, "unknown statement `{}`", s))
}

fn parse_expr(line: usize, s: &str) -> Result<Expr> {
    for (spelling, op) in BinOp::SPELLINGS {
        if let Some((a, b)) = s.split_once(spelling) {
            return Ok(Expr::Binary(
                op,
                parse_operand(line, a.trim())?,
                parse_operand(line, b.trim())?,
            ));
        }
    }
    Ok(Expr::Operand(parse_operand(line, s)?))
}

fn parse_operand(line: usize, s: &str) -> Result<Operand> {
    if s.starts_with(|c: char| c.is_ascii_digit()) {
        let value = match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        };
        value
            .map(Operand::Const)
            .map_err(|_| malformed_error!(line, "bad constant `{}`", s))
    } else {
        parse_identifier(line, s).map(Operand::Var)
    }
}

fn parse_identifier(line: usize, s: &str) -> Result<String> {
    let valid = s.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid && s != "input" {
        Ok(s.to_owned())
    } else {
        Err(malformed_error!(line, "bad variable name `{}`", s))
    }
}
