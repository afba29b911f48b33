//! Two-pass assembler for the supported subset
//!
//! Syntax, one statement per line:
//!
//! ```text
//! label:  LDA #$10        ; comment
//!         STA counter
//!         BNE label
//!         .byte $01, 2, %11
//!         .word label
//! ```
//!
//! Numbers are decimal, `$hex` or `%binary`. `<expr` and `>expr` take the
//! low and high byte.

use std::collections::HashMap;

use super::{AddrMode, Mos6502, OPCODES};
use crate::cpu::{AssembleError, Assembler};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Expr {
    Number(u32),
    Label(String),
    Low(Box<Expr>),
    High(Box<Expr>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Operand {
    None,
    Accumulator,
    Immediate(Expr),
    Address(Expr),
}

#[derive(Debug)]
enum Statement {
    Instruction { opcode: u8, mode: AddrMode, operand: Operand },
    Bytes(Vec<Expr>),
    Words(Vec<Expr>),
}

impl Statement {
    fn len(&self) -> u32 {
        match self {
            Statement::Instruction { mode, .. } => mode.len(),
            Statement::Bytes(v) => v.len() as u32,
            Statement::Words(v) => 2 * v.len() as u32,
        }
    }
}

fn error(line: usize, message: impl Into<String>) -> AssembleError {
    AssembleError { line, message: message.into() }
}

fn parse_number(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix('$') {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = text.strip_prefix('%') {
        u32::from_str_radix(bin, 2).ok()
    } else {
        text.parse().ok()
    }
}

fn is_label(text: &str) -> bool {
    let mut chars = text.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_expr(text: &str, line: usize) -> Result<Expr, AssembleError> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('<') {
        return Ok(Expr::Low(Box::new(parse_expr(rest, line)?)));
    }
    if let Some(rest) = text.strip_prefix('>') {
        return Ok(Expr::High(Box::new(parse_expr(rest, line)?)));
    }
    if let Some(n) = parse_number(text) {
        return Ok(Expr::Number(n));
    }
    if is_label(text) {
        return Ok(Expr::Label(text.to_string()));
    }
    Err(error(line, format!("cannot parse `{text}`")))
}

fn parse_operand(text: &str, line: usize) -> Result<Operand, AssembleError> {
    let text = text.trim();
    if text.is_empty() {
        Ok(Operand::None)
    } else if text.eq_ignore_ascii_case("A") {
        Ok(Operand::Accumulator)
    } else if let Some(rest) = text.strip_prefix('#') {
        Ok(Operand::Immediate(parse_expr(rest, line)?))
    } else {
        Ok(Operand::Address(parse_expr(text, line)?))
    }
}

fn select_opcode(mnemonic: &str, operand: &Operand, line: usize) -> Result<(u8, AddrMode), AssembleError> {
    let candidates: Vec<(u8, AddrMode)> = OPCODES
        .iter()
        .filter(|(_, name, _)| name.eq_ignore_ascii_case(mnemonic))
        .map(|&(op, _, mode)| (op, mode))
        .collect();
    if candidates.is_empty() {
        return Err(error(line, format!("unknown mnemonic `{mnemonic}`")));
    }
    let fits = |mode: AddrMode| match operand {
        Operand::None => matches!(mode, AddrMode::Implied | AddrMode::Accumulator),
        Operand::Accumulator => mode == AddrMode::Accumulator,
        Operand::Immediate(_) => mode == AddrMode::Immediate,
        Operand::Address(_) => matches!(mode, AddrMode::Absolute | AddrMode::Relative),
    };
    candidates
        .into_iter()
        .find(|&(_, mode)| fits(mode))
        .ok_or_else(|| error(line, format!("addressing mode not available for {mnemonic}")))
}

fn split_list(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty())
}

struct Program {
    statements: Vec<(usize, u32, Statement)>,
    labels: HashMap<String, u32>,
}

/// Pass one: parse and assign addresses
fn layout(source: &str, origin: u32) -> Result<Program, AssembleError> {
    let mut pc = origin;
    let mut statements = Vec::new();
    let mut labels = HashMap::new();
    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let mut text = raw.split(';').next().unwrap_or("").trim();
        if let Some((label, rest)) = text.split_once(':') {
            let label = label.trim();
            if !is_label(label) {
                return Err(error(line, format!("bad label `{label}`")));
            }
            if labels.insert(label.to_string(), pc).is_some() {
                return Err(error(line, format!("label `{label}` defined twice")));
            }
            text = rest.trim();
        }
        if text.is_empty() {
            continue;
        }
        let (word, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
        let statement = match word.to_ascii_lowercase().as_str() {
            ".byte" => Statement::Bytes(split_list(rest).map(|e| parse_expr(e, line)).collect::<Result<_, _>>()?),
            ".word" => Statement::Words(split_list(rest).map(|e| parse_expr(e, line)).collect::<Result<_, _>>()?),
            _ => {
                let operand = parse_operand(rest, line)?;
                let (opcode, mode) = select_opcode(word, &operand, line)?;
                Statement::Instruction { opcode, mode, operand }
            }
        };
        let len = statement.len();
        statements.push((line, pc, statement));
        pc = pc.wrapping_add(len);
    }
    Ok(Program { statements, labels })
}

impl Program {
    fn eval(&self, expr: &Expr, line: usize) -> Result<u32, AssembleError> {
        match expr {
            Expr::Number(n) => Ok(*n),
            Expr::Label(name) => self
                .labels
                .get(name)
                .copied()
                .ok_or_else(|| error(line, format!("undefined label `{name}`"))),
            Expr::Low(e) => Ok(self.eval(e, line)? & 0xFF),
            Expr::High(e) => Ok((self.eval(e, line)? >> 8) & 0xFF),
        }
    }

    fn byte(&self, expr: &Expr, line: usize) -> Result<u8, AssembleError> {
        let v = self.eval(expr, line)?;
        u8::try_from(v).map_err(|_| error(line, format!("{v:#x} does not fit in a byte")))
    }

    fn word(&self, expr: &Expr, line: usize) -> Result<u16, AssembleError> {
        let v = self.eval(expr, line)?;
        u16::try_from(v).map_err(|_| error(line, format!("{v:#x} does not fit in a word")))
    }

    /// Pass two: resolve labels and emit
    fn emit(&self) -> Result<Vec<u8>, AssembleError> {
        let mut out = Vec::new();
        for (line, pc, statement) in &self.statements {
            let line = *line;
            match statement {
                Statement::Bytes(exprs) => {
                    for e in exprs {
                        out.push(self.byte(e, line)?);
                    }
                }
                Statement::Words(exprs) => {
                    for e in exprs {
                        out.extend_from_slice(&self.word(e, line)?.to_le_bytes());
                    }
                }
                Statement::Instruction { opcode, mode, operand } => {
                    out.push(*opcode);
                    match (mode, operand) {
                        (AddrMode::Immediate, Operand::Immediate(e)) => out.push(self.byte(e, line)?),
                        (AddrMode::Absolute, Operand::Address(e)) => {
                            out.extend_from_slice(&self.word(e, line)?.to_le_bytes())
                        }
                        (AddrMode::Relative, Operand::Address(e)) => {
                            let target = self.eval(e, line)? as i64;
                            let offset = target - (*pc as i64 + 2);
                            let offset = i8::try_from(offset)
                                .map_err(|_| error(line, format!("branch target {offset} bytes away")))?;
                            out.push(offset as u8);
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Assembler for Mos6502 {
    fn assemble(&self, source: &str, origin: u32) -> Result<Vec<u8>, AssembleError> {
        layout(source, origin)?.emit()
    }
}
