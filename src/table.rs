//! The associative container ("table") scripts see as their only
//! composite type. Keys are partitioned by tag into five independent
//! hashed-chain buckets, mirroring the C original's `numIndexed`,
//! `strIndexed`, `boolIndexed`, `ufncIndexed`, `lfncIndexed` arrays —
//! a NUMBER key and a STRING key that happen to render the same way
//! never collide because they never share a bucket array.

use std::fmt::Write as _;

use crate::value::Value;

/// Matches the reference implementation's `AVM_TABLE_HASHSIZE`. Kept as a
/// named constant rather than inlined so the hash functions below read the
/// same way the spec states them ("modulo HASHSIZE").
pub const HASHSIZE: usize = 211;

/// One partition's key, carrying enough of the original `Value` to
/// reconstruct it for `objectmemberkeys`/`objectcopy` and for rendering,
/// without re-borrowing the table that owns it.
#[derive(Clone)]
pub enum Key {
    Number(f64),
    Str(String),
    Bool(bool),
    UserFunc(crate::value::UserFuncRef),
    LibFunc(String),
}

impl Key {
    pub fn from_value(v: &Value) -> Option<Key> {
        match v {
            Value::Number(n) => Some(Key::Number(*n)),
            Value::Str(s) => Some(Key::Str(s.clone())),
            Value::Bool(b) => Some(Key::Bool(*b)),
            Value::UserFunc(f) => Some(Key::UserFunc(f.clone())),
            Value::LibFunc(l) => Some(Key::LibFunc(l.clone())),
            Value::Table(_) | Value::Nil | Value::Undef => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => Value::Number(*n),
            Key::Str(s) => Value::Str(s.clone()),
            Key::Bool(b) => Value::Bool(*b),
            Key::UserFunc(f) => Value::UserFunc(f.clone()),
            Key::LibFunc(l) => Value::LibFunc(l.clone()),
        }
    }

    fn partition(&self) -> Partition {
        match self {
            Key::Number(_) => Partition::Number,
            Key::Str(_) => Partition::Str,
            Key::Bool(_) => Partition::Bool,
            Key::UserFunc(_) => Partition::UserFunc,
            Key::LibFunc(_) => Partition::LibFunc,
        }
    }

    /// Bucket index within its partition's chain array.
    fn hash(&self) -> usize {
        match self {
            Key::Number(n) => (n.to_bits() as usize) % HASHSIZE,
            Key::Bool(b) => (*b as usize) % HASHSIZE,
            Key::UserFunc(f) => f.address % HASHSIZE,
            // Polynomial rolling hash, as the spec prescribes for string keys.
            Key::Str(s) | Key::LibFunc(s) => {
                let mut h: u64 = 0;
                for b in s.as_bytes() {
                    h = h.wrapping_mul(31).wrapping_add(*b as u64);
                }
                (h as usize) % HASHSIZE
            }
        }
    }

    fn matches(&self, other: &Key) -> bool {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a == b,
            (Key::Str(a), Key::Str(b)) => a == b,
            (Key::Bool(a), Key::Bool(b)) => a == b,
            (Key::UserFunc(a), Key::UserFunc(b)) => a.address == b.address,
            (Key::LibFunc(a), Key::LibFunc(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Partition {
    Number,
    Str,
    Bool,
    UserFunc,
    LibFunc,
}

const PARTITIONS: [Partition; 5] = [
    Partition::Number,
    Partition::Str,
    Partition::Bool,
    Partition::UserFunc,
    Partition::LibFunc,
];

struct Bucket {
    key: Key,
    value: Value,
}

/// Five chained-bucket hash maps plus the bookkeeping the spec calls out:
/// a monotone-per-operation `total` live-entry count (invariant: equals
/// the sum of chain lengths across all five arrays) and a `refcount` that
/// the VM bumps on every `Value::Table` clone it performs explicitly.
///
/// `refcount` is tracked for parity with the spec's vocabulary
/// (`tableincref`/`tabledecref`) even though the table's actual lifetime
/// is governed by `Rc`'s own strong count; see `incref`/`decref`.
pub struct Table {
    buckets: [Vec<Vec<Bucket>>; 5],
    total: usize,
    refcount: usize,
}

impl Table {
    pub fn new() -> Table {
        Table {
            buckets: [
                (0..HASHSIZE).map(|_| Vec::new()).collect(),
                (0..HASHSIZE).map(|_| Vec::new()).collect(),
                (0..HASHSIZE).map(|_| Vec::new()).collect(),
                (0..HASHSIZE).map(|_| Vec::new()).collect(),
                (0..HASHSIZE).map(|_| Vec::new()).collect(),
            ],
            total: 0,
            refcount: 1,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn incref(&mut self) {
        self.refcount += 1;
    }

    /// Returns the refcount after decrementing. A caller observing 0 here
    /// would, in the C original, free the table; in Rust the `Rc` drop
    /// glue does that part, so this is purely an assertion aid for tests.
    pub fn decref(&mut self) -> usize {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount
    }

    fn chain(&self, part: Partition, idx: usize) -> &Vec<Bucket> {
        &self.buckets[part as usize][idx]
    }

    fn chain_mut(&mut self, part: Partition, idx: usize) -> &mut Vec<Bucket> {
        &mut self.buckets[part as usize][idx]
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        let idx = key.hash();
        self.chain(key.partition(), idx)
            .iter()
            .find(|b| b.key.matches(key))
            .map(|b| &b.value)
    }

    /// `tablesetelem`. `value == Value::Nil` deletes the key; anything
    /// else inserts or overwrites it. Returns whether `total` changed.
    pub fn set(&mut self, key: Key, value: Value) {
        let idx = key.hash();
        let part = key.partition();
        let chain = self.chain_mut(part, idx);
        if let Some(pos) = chain.iter().position(|b| b.key.matches(&key)) {
            if value.is_nil() {
                chain.remove(pos);
                self.total -= 1;
            } else {
                chain[pos].value = value;
            }
            return;
        }
        // NIL assignment to an absent key is a no-op; nothing to delete.
        if value.is_nil() {
            return;
        }
        chain.push(Bucket { key, value });
        self.total += 1;
    }

    /// Iterates every (key, value) pair in the canonical partition order
    /// NUMBER, STRING, BOOL, USERFUNC, LIBFUNC that `objectmemberkeys`,
    /// `objectcopy` and table-to-string all rely on.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (&Key, &Value)> {
        PARTITIONS.iter().flat_map(move |part| {
            self.buckets[*part as usize]
                .iter()
                .flat_map(|chain| chain.iter().map(|b| (&b.key, &b.value)))
        })
    }

    pub fn to_display_string(&self) -> String {
        if self.total == 0 {
            return String::new();
        }
        let mut out = String::new();
        for (key, value) in self.iter_ordered() {
            let key_str = key.to_value().to_display_string();
            let value_str = value.to_display_string();
            if matches!(key, Key::Str(_)) {
                let _ = write!(out, "{{'{}':{}}}, ", key_str, value_str);
            } else {
                let _ = write!(out, "{{{}:{}}}, ", key_str, value_str);
            }
        }
        out.truncate(out.len() - 2);
        out
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}
