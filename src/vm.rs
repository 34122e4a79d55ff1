//! The register file, call stack, operand decoder and instruction
//! dispatcher — the heart of the AVM. Everything here is owned by one
//! `Vm` value; there is no process-wide mutable state, so an embedder
//! can run several VMs (or the same image twice) in one process.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::{report_error, report_warning, VmError};
use crate::image::Image;
use crate::instr::{Instruction, Opcode, Operand, OperandKind};
use crate::libfuncs::{self, LibFn};
use crate::table::{Key, Table};
use crate::value::{UserFuncRef, Value};

/// Fixed stack size; binary-compatible with images that address globals
/// from the high end of the stack (`GLOBAL(v) = stack[STACKSIZE-1-v]`).
pub const STACKSIZE: usize = 4096;
/// Number of environment cells a `call` pushes before transferring
/// control: totalActuals, return pc, saved top, saved topsp.
pub const STACKENV_SIZE: usize = 4;
pub const SAVEDTOPSP_OFFSET: usize = 1;
pub const SAVEDTOP_OFFSET: usize = 2;
pub const SAVEDPC_OFFSET: usize = 3;
pub const NUMACTUALS_OFFSET: usize = 4;

/// A resolved, writable location: either a stack slot or the dedicated
/// return cell. Constant operands never produce one of these — they're
/// read-only and are materialized straight into a `Value`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CellRef {
    Stack(usize),
    Retval,
}

/// `avm_translate_operand`'s result before any copy is taken: either a
/// live cell or a freshly materialized constant.
enum Source {
    Cell(CellRef),
    Constant(Value),
}

pub struct Vm<'img> {
    image: &'img Image,
    stack: Vec<Value>,
    top: usize,
    topsp: usize,
    pc: usize,
    total_actuals: usize,
    retval: Value,
    halted: bool,
    curr_line: u32,
    warnings: Vec<String>,
    last_error: Option<VmError>,
    /// Parallel to `image.named_lib_funcs`; `None` where the image
    /// references a name this build doesn't implement.
    lib_registry: Vec<Option<LibFn>>,
}

impl<'img> Vm<'img> {
    pub fn new(image: &'img Image) -> Vm<'img> {
        let mut stack = Vec::with_capacity(STACKSIZE);
        stack.resize_with(STACKSIZE, || Value::Undef);
        let lib_registry = image
            .named_lib_funcs
            .iter()
            .map(|name| libfuncs::lookup(name))
            .collect();
        Vm {
            image,
            stack,
            top: image.n - image.global_offset,
            topsp: 0,
            pc: 0,
            total_actuals: 0,
            retval: Value::Undef,
            halted: false,
            curr_line: 0,
            warnings: Vec::new(),
            last_error: None,
            lib_registry,
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    pub fn current_line(&self) -> u32 {
        self.curr_line
    }

    pub fn retval(&self) -> &Value {
        &self.retval
    }

    /// Reads a GLOBAL-addressed cell (`stack[STACKSIZE-1-v]`) without
    /// going through an operand — lets an embedder pull a result out of
    /// the VM after `run()` the same way a compiled program's own `assign`
    /// instructions would address it.
    pub fn global(&self, v: usize) -> &Value {
        &self.stack[STACKSIZE - 1 - v]
    }

    /// Drives the fetch/decode/execute loop to completion.
    pub fn run(&mut self) {
        while !self.halted {
            self.execution_cycle();
        }
    }

    /// One fetch/decode/execute cycle. Exposed separately from `run` so a
    /// caller can single-step (used by the test suite to assert mid-run
    /// invariants).
    pub fn execution_cycle(&mut self) {
        if self.halted {
            return;
        }
        if self.pc >= self.image.code.len() {
            self.halted = true;
            return;
        }
        let instr = self.image.code[self.pc].clone();
        if instr.src_line > 0 {
            self.curr_line = instr.src_line;
        }
        let old_pc = self.pc;
        if let Err(err) = self.execute(&instr) {
            report_error(&err);
            self.last_error = Some(err);
            self.halted = true;
            return;
        }
        if self.pc == old_pc {
            self.pc += 1;
        }
    }

    fn execute(&mut self, instr: &Instruction) -> Result<(), VmError> {
        match instr.opcode {
            Opcode::Assign => self.exec_assign(instr),
            Opcode::Add => self.exec_arith(instr, |a, b| Ok(a + b)),
            Opcode::Sub => self.exec_arith(instr, |a, b| Ok(a - b)),
            Opcode::Mul => self.exec_arith(instr, |a, b| Ok(a * b)),
            Opcode::Div => self.exec_arith(instr, |a, b| {
                if b == 0.0 {
                    Err(VmError::DivisionByZero)
                } else {
                    Ok(a / b)
                }
            }),
            Opcode::Mod => self.exec_arith(instr, |a, b| {
                let bi = b as i64;
                if bi == 0 {
                    Err(VmError::ModuloByZero)
                } else {
                    Ok((a as i64 % bi) as f64)
                }
            }),
            Opcode::Uminus => self.exec_uminus(instr),
            Opcode::And => self.exec_logical(instr, |a, b| a && b),
            Opcode::Or => self.exec_logical(instr, |a, b| a || b),
            Opcode::Not => self.exec_not(instr),
            Opcode::Jeq => self.exec_jcmp(instr, |eq| eq),
            Opcode::Jne => self.exec_jcmp(instr, |eq| !eq),
            Opcode::Jle => self.exec_jord(instr, |a, b| a <= b),
            Opcode::Jge => self.exec_jord(instr, |a, b| a >= b),
            Opcode::Jlt => self.exec_jord(instr, |a, b| a < b),
            Opcode::Jgt => self.exec_jord(instr, |a, b| a > b),
            Opcode::Jump => {
                self.pc = instr.result.value;
                Ok(())
            }
            Opcode::Call => self.exec_call(instr),
            Opcode::Pusharg => self.exec_pusharg(instr),
            Opcode::Funcenter => self.exec_funcenter(instr),
            Opcode::Funcexit => self.do_funcexit(),
            Opcode::Newtable => self.exec_newtable(instr),
            Opcode::Tablegetelem => self.exec_tablegetelem(instr),
            Opcode::Tablesetelem => self.exec_tablesetelem(instr),
            Opcode::Nop => Ok(()),
        }
    }

    // --- operand access -----------------------------------------------

    fn resolve_dest(&self, op: &Operand) -> Result<CellRef, VmError> {
        match op.kind {
            OperandKind::Global => Ok(CellRef::Stack(STACKSIZE - 1 - op.value)),
            OperandKind::Local => Ok(CellRef::Stack(self.topsp - op.value)),
            OperandKind::Formal => {
                Ok(CellRef::Stack(self.topsp + STACKENV_SIZE + 1 + op.value))
            }
            OperandKind::Retval => Ok(CellRef::Retval),
            other => Err(VmError::BadOperand(other)),
        }
    }

    fn cell(&self, r: CellRef) -> &Value {
        match r {
            CellRef::Stack(i) => &self.stack[i],
            CellRef::Retval => &self.retval,
        }
    }

    fn cell_mut(&mut self, r: CellRef) -> &mut Value {
        match r {
            CellRef::Stack(i) => &mut self.stack[i],
            CellRef::Retval => &mut self.retval,
        }
    }

    /// `avm_translate_operand`'s return value, kept un-cloned: a variable
    /// operand resolves to a live cell, a constant operand is materialized
    /// once into an owned `Value` standing in for the scratch `ax` cell.
    /// Kept separate from `read_operand` because `assign`/`pusharg` need to
    /// compare identity *before* anything is cloned — cloning first would
    /// bump a table's refcount the short-circuit was supposed to avoid.
    fn operand_source(&self, op: &Operand) -> Result<Source, VmError> {
        match op.kind {
            OperandKind::Global | OperandKind::Local | OperandKind::Formal | OperandKind::Retval => {
                Ok(Source::Cell(self.resolve_dest(op)?))
            }
            _ => Ok(Source::Constant(self.materialize_constant(op)?)),
        }
    }

    fn materialize_constant(&self, op: &Operand) -> Result<Value, VmError> {
        match op.kind {
            OperandKind::Number => Ok(Value::Number(self.image.number_const(op.value))),
            OperandKind::Str => Ok(Value::Str(self.image.string_const(op.value).to_string())),
            OperandKind::Bool => Ok(Value::Bool(op.value != 0)),
            OperandKind::Nil => Ok(Value::Nil),
            OperandKind::Userfunc => {
                let uf = &self.image.user_funcs[op.value];
                Ok(Value::UserFunc(UserFuncRef {
                    address: uf.address,
                    id: Rc::from(uf.id.as_str()),
                }))
            }
            OperandKind::Libfunc => Ok(Value::LibFunc(self.image.lib_func_name(op.value).to_string())),
            other => Err(VmError::BadOperand(other)),
        }
    }

    fn source_value<'a>(&'a self, src: &'a Source) -> &'a Value {
        match src {
            Source::Cell(r) => self.cell(*r),
            Source::Constant(v) => v,
        }
    }

    /// `avm_translate_operand` followed by an immediate read. Fine for
    /// every instruction except `assign`/`pusharg`, which need
    /// `operand_source` instead so they can check identity before cloning.
    fn read_operand(&self, op: &Operand) -> Result<Value, VmError> {
        let src = self.operand_source(op)?;
        Ok(self.source_value(&src).clone())
    }

    // --- stack / frame plumbing -----------------------------------------

    fn dec_top(&mut self) -> Result<(), VmError> {
        if self.top == 0 {
            return Err(VmError::StackOverflow);
        }
        self.top -= 1;
        Ok(())
    }

    fn push_envvalue(&mut self, val: usize) -> Result<(), VmError> {
        self.stack[self.top] = Value::Number(val as f64);
        self.dec_top()
    }

    fn get_envvalue(&self, i: usize) -> Result<usize, VmError> {
        match self.stack.get(i) {
            Some(Value::Number(n)) if n.fract() == 0.0 && *n >= 0.0 => Ok(*n as usize),
            _ => Err(VmError::Other(
                "get_envvalue: expected an integral NUMBER cell".into(),
            )),
        }
    }

    /// `avm_callsaveenvironment`.
    fn save_environment(&mut self) -> Result<(), VmError> {
        let total_actuals = self.total_actuals;
        let return_addr = self.pc + 1;
        self.push_envvalue(total_actuals)?;
        self.push_envvalue(return_addr)?;
        let saved_top = self.top + total_actuals + 2;
        self.push_envvalue(saved_top)?;
        self.push_envvalue(self.topsp)?;
        Ok(())
    }

    /// Shared epilogue of `funcexit` and a library call's return path.
    fn do_funcexit(&mut self) -> Result<(), VmError> {
        let old_top = self.top;
        let new_top = self.get_envvalue(self.topsp + SAVEDTOP_OFFSET)?;
        let new_pc = self.get_envvalue(self.topsp + SAVEDPC_OFFSET)?;
        let new_topsp = self.get_envvalue(self.topsp + SAVEDTOPSP_OFFSET)?;
        self.top = new_top;
        self.pc = new_pc;
        self.topsp = new_topsp;
        let mut i = old_top;
        while i < self.top {
            i += 1;
            self.stack[i] = Value::Undef;
        }
        Ok(())
    }

    /// `avm_assign`, shared by the `assign` instruction and `pusharg`.
    /// Takes the source as an un-cloned `Source` so the `lv == rv` and
    /// same-table short-circuits run before any refcount bump happens.
    fn do_assign(&mut self, dest: CellRef, src: Source) {
        if let Source::Cell(src_ref) = src {
            if src_ref == dest {
                return;
            }
        }
        if let (Value::Table(lt), Value::Table(rt)) = (self.cell(dest), self.source_value(&src)) {
            if Rc::ptr_eq(lt, rt) {
                return;
            }
        }
        let value = match src {
            Source::Cell(r) => self.cell(r).clone(),
            Source::Constant(v) => v,
        };
        if value.is_undef() {
            self.warn("Assigning from 'undef' content!");
        }
        *self.cell_mut(dest) = value;
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        report_warning(&message);
        self.warnings.push(message);
    }

    // --- instructions -----------------------------------------------------

    fn exec_assign(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let lv = self.resolve_dest(&instr.result)?;
        let rv = self.operand_source(&instr.arg1)?;
        self.do_assign(lv, rv);
        Ok(())
    }

    fn exec_arith(
        &mut self,
        instr: &Instruction,
        op: impl Fn(f64, f64) -> Result<f64, VmError>,
    ) -> Result<(), VmError> {
        let dest = self.resolve_dest(&instr.result)?;
        let a = self.read_operand(&instr.arg1)?;
        let b = self.read_operand(&instr.arg2)?;
        let (a, b) = match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                *self.cell_mut(dest) = Value::Undef;
                return Err(VmError::NotANumber);
            }
        };
        let result = op(a, b)?;
        *self.cell_mut(dest) = Value::Number(result);
        Ok(())
    }

    fn exec_uminus(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let dest = self.resolve_dest(&instr.result)?;
        let a = self.read_operand(&instr.arg1)?;
        match a.as_number() {
            Some(n) => {
                *self.cell_mut(dest) = Value::Number(-n);
                Ok(())
            }
            None => {
                *self.cell_mut(dest) = Value::Undef;
                Err(VmError::NotANumber)
            }
        }
    }

    fn exec_logical(
        &mut self,
        instr: &Instruction,
        op: impl Fn(bool, bool) -> bool,
    ) -> Result<(), VmError> {
        let dest = self.resolve_dest(&instr.result)?;
        let a = to_bool_checked(&self.read_operand(&instr.arg1)?)?;
        let b = to_bool_checked(&self.read_operand(&instr.arg2)?)?;
        *self.cell_mut(dest) = Value::Bool(op(a, b));
        Ok(())
    }

    fn exec_not(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let dest = self.resolve_dest(&instr.result)?;
        let a = to_bool_checked(&self.read_operand(&instr.arg1)?)?;
        *self.cell_mut(dest) = Value::Bool(!a);
        Ok(())
    }

    fn exec_jcmp(&mut self, instr: &Instruction, want: impl Fn(bool) -> bool) -> Result<(), VmError> {
        let a = self.read_operand(&instr.arg1)?;
        let b = self.read_operand(&instr.arg2)?;
        if want(values_equal(&a, &b)?) {
            self.pc = instr.result.value;
        }
        Ok(())
    }

    fn exec_jord(&mut self, instr: &Instruction, cmp: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let a = self.read_operand(&instr.arg1)?;
        let b = self.read_operand(&instr.arg2)?;
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                if cmp(a, b) {
                    self.pc = instr.result.value;
                }
                Ok(())
            }
            _ => Err(VmError::IncompatibleComparison(a.tag_name(), b.tag_name())),
        }
    }

    fn exec_pusharg(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let src = self.operand_source(&instr.arg1)?;
        self.do_assign(CellRef::Stack(self.top), src);
        self.total_actuals += 1;
        self.dec_top()
    }

    fn exec_call(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let func = self.read_operand(&instr.arg1)?;
        self.save_environment()?;
        match func {
            Value::UserFunc(ref f) => {
                self.pc = f.address;
                if self.image.code[self.pc].opcode != Opcode::Funcenter {
                    return Err(VmError::Other(format!(
                        "call target at {} is not a funcenter",
                        self.pc
                    )));
                }
                Ok(())
            }
            Value::Str(ref name) => self.call_lib_func(name),
            Value::LibFunc(ref name) => self.call_lib_func(name),
            other => Err(VmError::NotCallable(other.to_display_string())),
        }
    }

    fn call_lib_func(&mut self, name: &str) -> Result<(), VmError> {
        let idx = self
            .image
            .named_lib_funcs
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| VmError::UnknownLibFunc(name.to_string()))?;
        let f = self.lib_registry[idx]
            .ok_or_else(|| VmError::Other(format!("Unsupported lib func '{}' called!", name)))?;
        self.topsp = self.top;
        self.total_actuals = 0;
        f(self)?;
        self.do_funcexit()
    }

    fn exec_funcenter(&mut self, _instr: &Instruction) -> Result<(), VmError> {
        let info = self.image.func_info_at(self.pc);
        let local_size = info.local_size;
        self.total_actuals = 0;
        self.topsp = self.top;
        self.top = self
            .top
            .checked_sub(local_size)
            .ok_or(VmError::StackOverflow)?;
        Ok(())
    }

    fn exec_newtable(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let dest = self.resolve_dest(&instr.result)?;
        *self.cell_mut(dest) = Value::Table(Rc::new(RefCell::new(Table::new())));
        Ok(())
    }

    fn exec_tablegetelem(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let dest = self.resolve_dest(&instr.result)?;
        let t = self.read_operand(&instr.arg1)?;
        let k = self.read_operand(&instr.arg2)?;
        let table = match t.as_table() {
            Some(t) => Rc::clone(t),
            None => {
                self.warn(format!(
                    "'tablegetelem()': table expected, not '{}'",
                    t.tag_name()
                ));
                *self.cell_mut(dest) = Value::Nil;
                return Ok(());
            }
        };
        let found = Key::from_value(&k).and_then(|key| table.borrow().get(&key).cloned());
        match found {
            Some(v) => *self.cell_mut(dest) = v,
            None => {
                self.warn(format!("table has no member named '{}'", k.to_display_string()));
                *self.cell_mut(dest) = Value::Nil;
            }
        }
        Ok(())
    }

    fn exec_tablesetelem(&mut self, instr: &Instruction) -> Result<(), VmError> {
        let t = self.read_operand(&instr.result)?;
        let k = self.read_operand(&instr.arg1)?;
        let v = self.read_operand(&instr.arg2)?;
        let table = match t.as_table() {
            Some(t) => Rc::clone(t),
            None => {
                self.warn(format!(
                    "'tablesetelem()': table expected, not '{}'",
                    t.tag_name()
                ));
                return Ok(());
            }
        };
        let key = Key::from_value(&k).ok_or_else(|| VmError::IllegalKey(k.tag_name()))?;
        table.borrow_mut().set(key, v);
        Ok(())
    }

    // --- library-function API, exposed to `libfuncs` ----------------------

    pub(crate) fn total_actuals(&self) -> Result<usize, VmError> {
        self.get_envvalue(self.topsp + NUMACTUALS_OFFSET)
    }

    pub(crate) fn get_actual(&self, i: usize) -> Result<&Value, VmError> {
        let n = self.total_actuals()?;
        if i >= n {
            return Err(VmError::Other(format!(
                "getActual: index {} out of range (0..{})",
                i, n
            )));
        }
        Ok(&self.stack[self.topsp + STACKENV_SIZE + 1 + i])
    }

    pub(crate) fn caller_topsp(&self) -> Result<usize, VmError> {
        self.get_envvalue(self.topsp + SAVEDTOPSP_OFFSET)
    }

    pub(crate) fn caller_total_actuals(&self, caller_topsp: usize) -> Result<usize, VmError> {
        self.get_envvalue(caller_topsp + NUMACTUALS_OFFSET)
    }

    pub(crate) fn caller_formal(&self, caller_topsp: usize, i: usize) -> &Value {
        &self.stack[caller_topsp + STACKENV_SIZE + 1 + i]
    }

    pub(crate) fn set_retval(&mut self, v: Value) {
        self.retval = v;
    }

    pub(crate) fn image(&self) -> &Image {
        self.image
    }
}

/// `avm_tobool`, but callable from contexts that must report a fatal
/// error instead of panicking when handed an `Undef` cell.
fn to_bool_checked(v: &Value) -> Result<bool, VmError> {
    if v.is_undef() {
        return Err(VmError::Other("to_bool() called on an undef value".into()));
    }
    Ok(v.to_bool())
}

/// `jeq`/`jne` equality: same-type comparisons by value or identity, NIL
/// only equal to NIL, and a BOOL operand coerces its non-BOOL partner via
/// to-bool rather than failing type comparison.
fn values_equal(a: &Value, b: &Value) -> Result<bool, VmError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(x == y),
        (Value::Str(x), Value::Str(y)) => Ok(x == y),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::Table(x), Value::Table(y)) => Ok(Rc::ptr_eq(x, y)),
        (Value::UserFunc(x), Value::UserFunc(y)) => Ok(x.address == y.address),
        (Value::LibFunc(x), Value::LibFunc(y)) => Ok(x == y),
        (Value::Nil, Value::Nil) => Ok(true),
        (Value::Nil, _) | (_, Value::Nil) => Ok(false),
        (Value::Bool(b), other) | (other, Value::Bool(b)) => Ok(*b == to_bool_checked(other)?),
        _ => Err(VmError::IncompatibleComparison(a.tag_name(), b.tag_name())),
    }
}
