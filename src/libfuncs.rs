//! Built-in library functions. Each one runs with `Vm::topsp`
//! already pointing at its own call frame, exactly where a user function's
//! `funcenter` would leave it, so `total_actuals`/`get_actual` read the
//! caller-supplied arguments off the stack the same way a FORMAL operand
//! would.
//!
//! None of these ever produce a `VmError` for ordinary misuse (wrong
//! arity, wrong type): that's a warning and a NIL `retval`, matching the
//! reference implementation's `libfunc_*` family. The `Result` here only
//! carries a corrupted-frame condition up to the dispatcher.

use std::io::{self, BufRead};

use crate::errors::VmError;
use crate::table::{Key, Table};
use crate::value::Value;
use crate::vm::Vm;

pub type LibFn = fn(&mut Vm) -> Result<(), VmError>;

const BUILTINS: &[(&str, LibFn)] = &[
    ("print", print),
    ("input", input),
    ("objectmemberkeys", objectmemberkeys),
    ("objecttotalmembers", objecttotalmembers),
    ("objectcopy", objectcopy),
    ("totalarguments", totalarguments),
    ("argument", argument),
    ("typeof", type_of),
    ("strtonum", strtonum),
    ("sqrt", sqrt),
    ("cos", cos),
    ("sin", sin),
    ("tan", tan),
    ("abs", abs),
    ("pow", pow),
    ("round", round),
    ("floor", floor),
    ("ceil", ceil),
];

pub fn lookup(name: &str) -> Option<LibFn> {
    BUILTINS.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

fn one_number_arg(vm: &mut Vm, label: &str) -> Result<Option<f64>, VmError> {
    let n = vm.total_actuals()?;
    if n != 1 {
        vm.warn(format!("'{}()': one argument (not {}) expected!", label, n));
        vm.set_retval(Value::Nil);
        return Ok(None);
    }
    let actual = vm.get_actual(0)?;
    match actual.as_number() {
        Some(v) => Ok(Some(v)),
        None => {
            let tag = actual.tag_name();
            vm.warn(format!(
                "'{}()': number argument (not {}) expected!",
                label, tag
            ));
            vm.set_retval(Value::Nil);
            Ok(None)
        }
    }
}

fn one_table_arg<'a>(vm: &'a mut Vm, label: &str) -> Result<Option<std::rc::Rc<std::cell::RefCell<Table>>>, VmError> {
    let n = vm.total_actuals()?;
    if n != 1 {
        vm.warn(format!("'{}()': one argument (not {}) expected!", label, n));
        vm.set_retval(Value::Nil);
        return Ok(None);
    }
    let actual = vm.get_actual(0)?;
    match actual.as_table() {
        Some(t) => Ok(Some(std::rc::Rc::clone(t))),
        None => {
            let tag = actual.tag_name();
            vm.warn(format!(
                "'{}()': table argument (not {}) expected!",
                label, tag
            ));
            vm.set_retval(Value::Nil);
            Ok(None)
        }
    }
}

fn print(vm: &mut Vm) -> Result<(), VmError> {
    let n = vm.total_actuals()?;
    for i in 0..n {
        let s = vm.get_actual(i)?.to_display_string();
        print!("{}", s);
    }
    Ok(())
}

/// `libfunc_input`. Reads one line from stdin and classifies it, per the
/// same priority order as the reference implementation: quoted string,
/// number, `false`/`true`, `nil`, a known lib- or user-function name, then
/// a plain string. The quote check uses the buffer's actual last byte
/// rather than one past it.
fn input(vm: &mut Vm) -> Result<(), VmError> {
    let n = vm.total_actuals()?;
    if n != 0 {
        vm.warn(format!("'input()': no argument (not {}) expected!", n));
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let mut buf = String::new();
    io::stdin().lock().read_line(&mut buf).ok();
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }

    if buf.len() >= 2 && buf.starts_with('"') && buf.ends_with('"') {
        vm.set_retval(Value::Str(buf));
        return Ok(());
    }
    let number = parse_leading_number(&buf);
    if number != 0.0 {
        vm.set_retval(Value::Number(number));
        return Ok(());
    }
    if buf.contains("false") {
        vm.set_retval(Value::Bool(false));
        return Ok(());
    }
    if buf.contains("true") {
        vm.set_retval(Value::Bool(true));
        return Ok(());
    }
    if buf.contains("nil") {
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let image = vm.image();
    if let Some(name) = image.named_lib_funcs.iter().find(|n| n.as_str() == buf) {
        vm.set_retval(Value::LibFunc(name.clone()));
        return Ok(());
    }
    if let Some(f) = image.user_funcs.iter().find(|f| f.id == buf) {
        let address = f.address;
        let id: std::rc::Rc<str> = std::rc::Rc::from(f.id.as_str());
        vm.set_retval(Value::UserFunc(crate::value::UserFuncRef { address, id }));
        return Ok(());
    }
    vm.set_retval(Value::Str(buf));
    Ok(())
}

fn objectmemberkeys(vm: &mut Vm) -> Result<(), VmError> {
    let table = match one_table_arg(vm, "objectmemberkeys")? {
        Some(t) => t,
        None => return Ok(()),
    };
    let out = Table::new();
    let out = std::rc::Rc::new(std::cell::RefCell::new(out));
    for (i, (key, _)) in table.borrow().iter_ordered().enumerate() {
        out.borrow_mut().set(Key::Number(i as f64), key.to_value());
    }
    vm.set_retval(Value::Table(out));
    Ok(())
}

fn objecttotalmembers(vm: &mut Vm) -> Result<(), VmError> {
    let table = match one_table_arg(vm, "objecttotalmembers")? {
        Some(t) => t,
        None => return Ok(()),
    };
    let total = table.borrow().total();
    vm.set_retval(Value::Number(total as f64));
    Ok(())
}

fn objectcopy(vm: &mut Vm) -> Result<(), VmError> {
    let table = match one_table_arg(vm, "objectcopy")? {
        Some(t) => t,
        None => return Ok(()),
    };
    let out = std::rc::Rc::new(std::cell::RefCell::new(Table::new()));
    for (key, value) in table.borrow().iter_ordered() {
        out.borrow_mut().set(key.clone(), value.clone());
    }
    vm.set_retval(Value::Table(out));
    Ok(())
}

fn totalarguments(vm: &mut Vm) -> Result<(), VmError> {
    let p_topsp = vm.caller_topsp()?;
    if p_topsp == 0 {
        vm.warn("'totalarguments()': call outside a function!");
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let n = vm.total_actuals()?;
    if n != 0 {
        vm.warn(format!(
            "'totalarguments()': no argument (not {}) expected!",
            n
        ));
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let actuals = vm.caller_total_actuals(p_topsp)?;
    vm.set_retval(Value::Number(actuals as f64));
    Ok(())
}

fn argument(vm: &mut Vm) -> Result<(), VmError> {
    let p_topsp = vm.caller_topsp()?;
    if p_topsp == 0 {
        vm.warn("'argument()': call outside of function!");
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let idx = match one_number_arg(vm, "argument")? {
        Some(v) => v,
        None => return Ok(()),
    };
    let idx = idx as usize;
    let actuals = vm.caller_total_actuals(p_topsp)?;
    if actuals <= idx {
        vm.warn(format!(
            "'argument()': surrounding function has only {} arguments, not {}!",
            actuals,
            idx + 1
        ));
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let value = vm.caller_formal(p_topsp, idx).clone();
    vm.set_retval(value);
    Ok(())
}

fn type_of(vm: &mut Vm) -> Result<(), VmError> {
    let n = vm.total_actuals()?;
    if n != 1 {
        vm.warn(format!("'typeof()': one argument (not {}) expected!", n));
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let tag = vm.get_actual(0)?.tag_name();
    vm.set_retval(Value::Str(tag.to_string()));
    Ok(())
}

fn strtonum(vm: &mut Vm) -> Result<(), VmError> {
    let n = vm.total_actuals()?;
    if n != 1 {
        vm.warn(format!("'strtonum()': one argument (not {}) expected!", n));
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let actual = vm.get_actual(0)?;
    let s = match actual {
        Value::Str(s) => s.clone(),
        other => {
            let tag = other.tag_name();
            vm.warn(format!(
                "'strtonum()': string argument (not {}) expected!",
                tag
            ));
            vm.set_retval(Value::Nil);
            return Ok(());
        }
    };
    let number = parse_leading_number(&s);
    vm.set_retval(Value::Number(number));
    Ok(())
}

/// `atof` semantics: parse the longest leading prefix that is a valid
/// float literal, defaulting to 0 rather than failing outright.
fn parse_leading_number(s: &str) -> f64 {
    let trimmed = s.trim_start();
    let mut end = trimmed.len();
    while end > 0 {
        if let Ok(n) = trimmed[..end].parse::<f64>() {
            return n;
        }
        end -= 1;
        while end > 0 && !trimmed.is_char_boundary(end) {
            end -= 1;
        }
    }
    0.0
}

macro_rules! unary_math_builtin {
    ($name:ident, $label:literal, $f:expr) => {
        fn $name(vm: &mut Vm) -> Result<(), VmError> {
            if let Some(x) = one_number_arg(vm, $label)? {
                let f: fn(f64) -> f64 = $f;
                vm.set_retval(Value::Number(f(x)));
            }
            Ok(())
        }
    };
}

unary_math_builtin!(sqrt, "sqrt", f64::sqrt);
unary_math_builtin!(cos, "cos", f64::cos);
unary_math_builtin!(sin, "sin", f64::sin);
unary_math_builtin!(tan, "tan", f64::tan);
unary_math_builtin!(abs, "abs", f64::abs);
unary_math_builtin!(round, "round", f64::round);
unary_math_builtin!(floor, "floor", f64::floor);
unary_math_builtin!(ceil, "ceil", f64::ceil);

fn pow(vm: &mut Vm) -> Result<(), VmError> {
    let n = vm.total_actuals()?;
    if n != 2 {
        vm.warn(format!("'pow()': two arguments (not {}) expected!", n));
        vm.set_retval(Value::Nil);
        return Ok(());
    }
    let base = vm.get_actual(0)?.clone();
    let exp = vm.get_actual(1)?.clone();
    match (base.as_number(), exp.as_number()) {
        (Some(b), Some(e)) => vm.set_retval(Value::Number(b.powf(e))),
        _ => {
            vm.warn("'pow()': two number arguments expected!");
            vm.set_retval(Value::Nil);
        }
    }
    Ok(())
}
