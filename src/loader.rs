//! Binary loader: the boundary between untrusted bytes and a trusted
//! `Image`, made concrete here as a thin JSON deserializer so the
//! repository is runnable end to end without a compiler. Swapping in a
//! real packed-byte loader later only means replacing this module: the
//! core downstream only ever sees an `Image`.

use std::fs;
use std::path::Path;

use crate::errors::LoadError;
use crate::image::Image;
use crate::instr::OperandKind;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Image, LoadError> {
    let text = fs::read_to_string(path)?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Image, LoadError> {
    let image: Image = serde_json::from_str(text)?;
    validate(&image)?;
    Ok(image)
}

/// Sanity-checks cross-references a malformed or hand-edited image could
/// get wrong, so the core can assume they hold rather than re-checking
/// them on every operand decode. This is the loader's job precisely
/// because the core treats the image as a trusted, already-validated
/// contract.
fn validate(image: &Image) -> Result<(), LoadError> {
    if image.global_offset > image.n {
        return Err(LoadError::Inconsistent(format!(
            "global_offset {} exceeds n {}",
            image.global_offset, image.n
        )));
    }
    for (addr, instr) in image.code.iter().enumerate() {
        for operand in [&instr.result, &instr.arg1, &instr.arg2] {
            match operand.kind {
                OperandKind::Number if operand.value >= image.num_consts.len() => {
                    return Err(LoadError::Inconsistent(format!(
                        "instruction {} references out-of-range number const {}",
                        addr, operand.value
                    )));
                }
                OperandKind::Str if operand.value >= image.string_consts.len() => {
                    return Err(LoadError::Inconsistent(format!(
                        "instruction {} references out-of-range string const {}",
                        addr, operand.value
                    )));
                }
                OperandKind::Userfunc if operand.value >= image.user_funcs.len() => {
                    return Err(LoadError::Inconsistent(format!(
                        "instruction {} references out-of-range user function {}",
                        addr, operand.value
                    )));
                }
                OperandKind::Libfunc if operand.value >= image.named_lib_funcs.len() => {
                    return Err(LoadError::Inconsistent(format!(
                        "instruction {} references out-of-range lib function {}",
                        addr, operand.value
                    )));
                }
                _ => {}
            }
        }
    }
    for func in &image.user_funcs {
        if func.address >= image.code.len() {
            return Err(LoadError::Inconsistent(format!(
                "user function '{}' entry address {} is out of range",
                func.id, func.address
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_number_const() {
        let json = r#"{
            "num_consts": [],
            "string_consts": [],
            "user_funcs": [],
            "named_lib_funcs": [],
            "code": [{"opcode":"assign","result":{"kind":"global","value":0},
                      "arg1":{"kind":"number","value":0},
                      "arg2":{"kind":"empty","value":0},"src_line":1}],
            "n": 16,
            "global_offset": 0
        }"#;
        assert!(load_from_str(json).is_err());
    }

    #[test]
    fn accepts_well_formed_image() {
        let json = r#"{
            "num_consts": [3.0],
            "string_consts": [],
            "user_funcs": [],
            "named_lib_funcs": ["print"],
            "code": [{"opcode":"nop","result":{"kind":"empty","value":0},
                      "arg1":{"kind":"empty","value":0},
                      "arg2":{"kind":"empty","value":0},"src_line":0}],
            "n": 16,
            "global_offset": 0
        }"#;
        assert!(load_from_str(json).is_ok());
    }
}
