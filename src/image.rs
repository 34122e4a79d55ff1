//! The in-memory binary image the core consumes. Everything here is
//! produced by `loader::load`; the core never reads a file or parses bytes
//! itself, only this struct.

use serde::{Deserialize, Serialize};

use crate::instr::Instruction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFunc {
    pub address: usize,
    pub local_size: usize,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub num_consts: Vec<f64>,
    pub string_consts: Vec<String>,
    pub user_funcs: Vec<UserFunc>,
    pub named_lib_funcs: Vec<String>,
    pub code: Vec<Instruction>,
    /// Stack size hint; `top` is initialized to `n - global_offset`.
    pub n: usize,
    pub global_offset: usize,
}

impl Image {
    pub fn number_const(&self, idx: usize) -> f64 {
        self.num_consts[idx]
    }

    pub fn string_const(&self, idx: usize) -> &str {
        &self.string_consts[idx]
    }

    pub fn lib_func_name(&self, idx: usize) -> &str {
        &self.named_lib_funcs[idx]
    }

    /// `avm_getfuncinfo`: looks up the descriptor for the user function
    /// whose `funcenter` lives at `address`, via that instruction's
    /// `result` operand (the loader points it at the function's entry
    /// in `user_funcs`).
    pub fn func_info_at(&self, address: usize) -> &UserFunc {
        let idx = self.code[address].result.value;
        &self.user_funcs[idx]
    }
}
