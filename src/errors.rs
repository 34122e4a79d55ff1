//! Diagnostic classification. The VM recognizes exactly two severities: a
//! `VmError` is fatal and halts the dispatcher; a warning is a `String`
//! pushed onto `Vm::warnings` and never stops execution.
//!
//! Both severities render through `report_error`/`report_warning` so the
//! CLI and any future embedder get identical coloring without duplicating
//! the ANSI-code choices the original made in `avm_error`/`avm_warning`.

use colored::Colorize;
use thiserror::Error;

/// Every condition the dispatcher treats as fatal. Each variant's
/// `Display` is the message reported before halting.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("Stack Overflow!")]
    StackOverflow,
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Modulo by zero")]
    ModuloByZero,
    #[error("not a number in arithmetic")]
    NotANumber,
    #[error("cannot compare incompatible types '{0}' and '{1}'")]
    IncompatibleComparison(&'static str, &'static str),
    #[error("illegal key of type '{0}' used in table access")]
    IllegalKey(&'static str),
    #[error("cannot bind '{0}' to function")]
    NotCallable(String),
    #[error("Libfunc '{0}' not found!")]
    UnknownLibFunc(String),
    #[error("operand decoder fallthrough on operand kind {0:?}")]
    BadOperand(crate::instr::OperandKind),
    #[error("{0}")]
    Other(String),
}

/// Prints a red `AVM:ERROR:` line, matching `avm_error`'s format exactly
/// apart from Rust's automatic newline discipline.
pub fn report_error(err: &VmError) {
    println!("{}", format!("AVM:ERROR: {}", err).red());
}

/// A load failure never reaches a `Vm`, so it can't go through
/// `report_error`, but it gets the same red, to-stdout treatment.
pub fn report_load_error(err: &LoadError) {
    println!("{}", format!("AVM:ERROR: {}", err).red());
}

/// Prints a yellow `AVM:WARNING:` line, matching `avm_warning`.
pub fn report_warning(message: &str) {
    println!("{}", format!("AVM:WARNING: {}", message).yellow());
}

/// The summary banner printed once execution (or loading) finishes.
pub fn report_success(path: &str, warnings: usize) {
    let msg = if warnings > 0 {
        format!("Executable '{}' returned with {} warning(s)!", path, warnings)
    } else {
        format!("Executable '{}' returned succesfully!", path)
    };
    println!("\n{}\n", msg.green());
}

/// Errors that can occur before a `Vm` even exists: a malformed image, or
/// one that makes an internal reference (operand, jump target, function
/// id) that doesn't resolve. Never a `VmError` — those are only raised
/// once a VM is mid-execution.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse image: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("image is inconsistent: {0}")]
    Inconsistent(String),
}
