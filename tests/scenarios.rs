//! End-to-end scenarios driven through hand-built images — there is no
//! compiler in front of this core, so each test plays that role itself.
//! Assertions read `Vm`'s observable state (`retval`, `warnings`,
//! `last_error`, a `global` cell) rather than captured stdout, but every
//! scenario still runs through the real dispatcher: `call`, `pusharg` and
//! library dispatch all execute for real.

use std::rc::Rc;

use avm::image::{Image, UserFunc};
use avm::instr::{Instruction, Opcode, Operand, OperandKind};
use avm::value::Value;
use avm::{LoadError, Vm, VmError};

fn op(kind: OperandKind, value: usize) -> Operand {
    Operand { kind, value }
}

fn ins(opcode: Opcode, result: Operand, arg1: Operand, arg2: Operand) -> Instruction {
    Instruction {
        opcode,
        result,
        arg1,
        arg2,
        src_line: 0,
    }
}

/// `Value` has no `PartialEq` (a `Table` cell can't cheaply compare equal
/// to another), so scenario assertions match on the variants they expect
/// instead of using `assert_eq!` directly against a `Value`.
fn assert_number(v: &Value, expected: f64) {
    match v {
        Value::Number(n) => assert_eq!(*n, expected),
        other => panic!("expected Number({}), got {:?}", expected, other),
    }
}

fn assert_nil(v: &Value) {
    assert!(matches!(v, Value::Nil), "expected Nil, got {:?}", v);
}

fn base_image(code: Vec<Instruction>) -> Image {
    Image {
        num_consts: Vec::new(),
        string_consts: Vec::new(),
        user_funcs: Vec::new(),
        named_lib_funcs: Vec::new(),
        code,
        n: 100,
        global_offset: 0,
    }
}

/// S1: `print(1 + 2)`. No compiler runs `print`'s actual stdout write, but
/// the add lands in a GLOBAL cell we can read back after `run()`.
#[test]
fn s1_add_then_print() {
    let mut image = base_image(vec![
        ins(
            Opcode::Add,
            op(OperandKind::Global, 0),
            op(OperandKind::Number, 0),
            op(OperandKind::Number, 1),
        ),
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Global, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Libfunc, 0),
            Operand::EMPTY,
        ),
    ]);
    image.num_consts = vec![1.0, 2.0];
    image.named_lib_funcs = vec!["print".to_string()];

    let mut vm = Vm::new(&image);
    vm.run();

    assert!(vm.halted());
    assert!(vm.last_error().is_none());
    assert!(vm.warnings().is_empty());
    assert_number(vm.global(0), 3.0);
}

/// S2 (part 1): `totalarguments()` called outside any user function warns
/// and returns NIL, it never halts the dispatcher.
#[test]
fn s2_totalarguments_outside_function_warns() {
    let mut image = base_image(vec![ins(
        Opcode::Call,
        Operand::EMPTY,
        op(OperandKind::Libfunc, 0),
        Operand::EMPTY,
    )]);
    image.named_lib_funcs = vec!["totalarguments".to_string()];

    let mut vm = Vm::new(&image);
    vm.run();

    assert!(vm.halted());
    assert!(vm.last_error().is_none());
    assert_eq!(vm.warnings().len(), 1);
    assert!(vm.warnings()[0].contains("call outside a function"));
    assert_nil(vm.retval());
}

/// S2 (part 2): a one-argument user function `square(x) = x * x`, called
/// with a real actual through `pusharg`/`call`/`funcenter`/`funcexit`.
#[test]
fn s2_user_function_call_roundtrip() {
    // 0: pusharg 5.0
    // 1: call square
    // 2: pusharg retval
    // 3: call print
    // 4: jump 8          (halt)
    // 5: funcenter square
    // 6: mul retval = formal(0) * formal(0)
    // 7: funcexit
    let mut image = base_image(vec![
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Number, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Userfunc, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Retval, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Libfunc, 0),
            Operand::EMPTY,
        ),
        ins(Opcode::Jump, op(OperandKind::Label, 8), Operand::EMPTY, Operand::EMPTY),
        ins(Opcode::Funcenter, op(OperandKind::Userfunc, 0), Operand::EMPTY, Operand::EMPTY),
        ins(
            Opcode::Mul,
            op(OperandKind::Retval, 0),
            op(OperandKind::Formal, 0),
            op(OperandKind::Formal, 0),
        ),
        ins(Opcode::Funcexit, Operand::EMPTY, Operand::EMPTY, Operand::EMPTY),
    ]);
    image.num_consts = vec![5.0];
    image.named_lib_funcs = vec!["print".to_string()];
    image.user_funcs = vec![UserFunc {
        address: 5,
        local_size: 0,
        id: "square".to_string(),
    }];

    let mut vm = Vm::new(&image);
    vm.run();

    assert!(vm.halted());
    assert!(vm.last_error().is_none());
    assert!(vm.warnings().is_empty());
    // print() never touches retval, so it still holds square(5)'s result.
    assert_number(vm.retval(), 25.0);
}

/// S3: a table with two numeric keys and one string key has three members.
#[test]
fn s3_table_total_members() {
    // t = []; t[0] = 10; t[1] = 20; t["a"] = "A"; objecttotalmembers(t)
    let mut image = base_image(vec![
        ins(Opcode::Newtable, op(OperandKind::Global, 0), Operand::EMPTY, Operand::EMPTY),
        ins(
            Opcode::Tablesetelem,
            op(OperandKind::Global, 0),
            op(OperandKind::Number, 0),
            op(OperandKind::Number, 1),
        ),
        ins(
            Opcode::Tablesetelem,
            op(OperandKind::Global, 0),
            op(OperandKind::Number, 2),
            op(OperandKind::Number, 3),
        ),
        ins(
            Opcode::Tablesetelem,
            op(OperandKind::Global, 0),
            op(OperandKind::Str, 0),
            op(OperandKind::Str, 1),
        ),
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Global, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Libfunc, 0),
            Operand::EMPTY,
        ),
    ]);
    image.num_consts = vec![0.0, 10.0, 1.0, 20.0];
    image.string_consts = vec!["a".to_string(), "A".to_string()];
    image.named_lib_funcs = vec!["objecttotalmembers".to_string()];

    let mut vm = Vm::new(&image);
    vm.run();

    assert!(vm.halted());
    assert!(vm.last_error().is_none());
    assert_number(vm.retval(), 3.0);
}

/// S4: assigning NIL to an existing key deletes it; total drops back to 0.
#[test]
fn s4_table_nil_assignment_deletes_key() {
    let mut image = base_image(vec![
        ins(Opcode::Newtable, op(OperandKind::Global, 0), Operand::EMPTY, Operand::EMPTY),
        ins(
            Opcode::Tablesetelem,
            op(OperandKind::Global, 0),
            op(OperandKind::Number, 0),
            op(OperandKind::Str, 0),
        ),
        ins(
            Opcode::Tablesetelem,
            op(OperandKind::Global, 0),
            op(OperandKind::Number, 0),
            op(OperandKind::Nil, 0),
        ),
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Global, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Libfunc, 0),
            Operand::EMPTY,
        ),
    ]);
    image.num_consts = vec![0.0];
    image.string_consts = vec!["zero".to_string()];
    image.named_lib_funcs = vec!["objecttotalmembers".to_string()];

    let mut vm = Vm::new(&image);
    vm.run();

    assert!(vm.last_error().is_none());
    assert_number(vm.retval(), 0.0);
}

/// S5: division by zero halts the dispatcher with a fatal `VmError`, but
/// never raises a warning — the two severities stay distinct.
#[test]
fn s5_division_by_zero_is_fatal() {
    let mut image = base_image(vec![ins(
        Opcode::Div,
        op(OperandKind::Global, 0),
        op(OperandKind::Number, 0),
        op(OperandKind::Number, 1),
    )]);
    image.num_consts = vec![1.0, 0.0];

    let mut vm = Vm::new(&image);
    vm.run();

    assert!(vm.halted());
    assert_eq!(vm.last_error(), Some(&VmError::DivisionByZero));
    assert!(vm.warnings().is_empty());
}

/// S6: recursive factorial of 5, via a user function that calls itself.
#[test]
fn s6_recursive_factorial() {
    // 0: pusharg 5.0
    // 1: call fact
    // 2: pusharg retval
    // 3: call print
    // 4: jump 14         (halt)
    // 5: funcenter fact
    // 6: jle 12, formal(0), 1.0      -- if n <= 1 goto base case
    // 7: sub local(1) = formal(0) - 1.0
    // 8: pusharg local(1)
    // 9: call fact
    // 10: mul retval = formal(0) * retval
    // 11: jump 13                    -- skip base case
    // 12: assign retval = 1.0        -- base case
    // 13: funcexit
    let mut image = base_image(vec![
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Number, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Userfunc, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Retval, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Libfunc, 0),
            Operand::EMPTY,
        ),
        ins(Opcode::Jump, op(OperandKind::Label, 14), Operand::EMPTY, Operand::EMPTY),
        ins(Opcode::Funcenter, op(OperandKind::Userfunc, 0), Operand::EMPTY, Operand::EMPTY),
        ins(
            Opcode::Jle,
            op(OperandKind::Label, 12),
            op(OperandKind::Formal, 0),
            op(OperandKind::Number, 1),
        ),
        ins(
            Opcode::Sub,
            op(OperandKind::Local, 1),
            op(OperandKind::Formal, 0),
            op(OperandKind::Number, 1),
        ),
        ins(
            Opcode::Pusharg,
            Operand::EMPTY,
            op(OperandKind::Local, 1),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Call,
            Operand::EMPTY,
            op(OperandKind::Userfunc, 0),
            Operand::EMPTY,
        ),
        ins(
            Opcode::Mul,
            op(OperandKind::Retval, 0),
            op(OperandKind::Formal, 0),
            op(OperandKind::Retval, 0),
        ),
        ins(Opcode::Jump, op(OperandKind::Label, 13), Operand::EMPTY, Operand::EMPTY),
        ins(
            Opcode::Assign,
            op(OperandKind::Retval, 0),
            op(OperandKind::Number, 1),
            Operand::EMPTY,
        ),
        ins(Opcode::Funcexit, Operand::EMPTY, Operand::EMPTY, Operand::EMPTY),
    ]);
    image.num_consts = vec![5.0, 1.0];
    image.named_lib_funcs = vec!["print".to_string()];
    image.user_funcs = vec![UserFunc {
        address: 5,
        local_size: 1,
        id: "fact".to_string(),
    }];

    let mut vm = Vm::new(&image);
    vm.run();

    assert!(vm.halted());
    assert!(vm.last_error().is_none());
    assert!(vm.warnings().is_empty());
    assert_number(vm.retval(), 120.0);
}

/// A malformed image (an operand indexing past the constant pool) is
/// rejected before a `Vm` ever runs — `LoadError`, not a panic.
#[test]
fn load_rejects_out_of_range_constant() {
    let image = base_image(vec![ins(
        Opcode::Assign,
        op(OperandKind::Global, 0),
        op(OperandKind::Number, 3),
        Operand::EMPTY,
    )]);
    let json = serde_json::to_string(&image).unwrap();
    let result = avm::loader::load_from_str(&json);
    assert!(matches!(result, Err(LoadError::Inconsistent(_))));
}

/// A table that stores itself under one of its own keys forms a reference
/// cycle this core never breaks: dropping the only *external* handle to
/// the table (`Global(0)`) still leaves it alive, reachable solely through
/// its own bucket. This is a documented leak, not a bug — there is no
/// cycle collector here, same as the reference implementation's bare
/// refcounting.
#[test]
fn self_referential_table_leaks_past_its_last_external_reference() {
    // 0: newtable global(0)
    // 1: tablesetelem global(0)[0.0] = global(0)   -- t stores itself
    // 2: assign global(0) = nil                    -- drop the external handle
    let image = {
        let mut image = base_image(vec![
            ins(Opcode::Newtable, op(OperandKind::Global, 0), Operand::EMPTY, Operand::EMPTY),
            ins(
                Opcode::Tablesetelem,
                op(OperandKind::Global, 0),
                op(OperandKind::Number, 0),
                op(OperandKind::Global, 0),
            ),
            ins(
                Opcode::Assign,
                op(OperandKind::Global, 0),
                op(OperandKind::Nil, 0),
                Operand::EMPTY,
            ),
        ]);
        image.num_consts = vec![0.0];
        image
    };

    let mut vm = Vm::new(&image);
    vm.execution_cycle(); // newtable
    vm.execution_cycle(); // tablesetelem: table now holds a Value::Table of itself

    let weak = match vm.global(0).as_table() {
        Some(t) => Rc::downgrade(t),
        None => panic!("expected Global(0) to hold a table"),
    };

    vm.execution_cycle(); // assign: the only external reference is dropped

    assert!(matches!(vm.global(0), Value::Nil));
    assert!(
        weak.upgrade().is_some(),
        "table should still be alive via its own self-reference"
    );
    let table = weak.upgrade().unwrap();
    assert!(table.borrow().refcount() >= 1);
}
