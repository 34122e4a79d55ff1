use std::process::ExitCode;

use avm::errors::{report_load_error, report_success};
use avm::instr::Instruction;
use avm::loader;
use avm::Vm;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "avm", about = "AVM execution core")]
struct Options {
    /// Path to a binary image (JSON, see the loader format).
    #[structopt(parse(from_os_str))]
    image: std::path::PathBuf,

    /// Print the decoded instruction stream instead of running it.
    #[structopt(long)]
    dump: bool,
}

fn main() -> ExitCode {
    let opts = Options::from_args();
    let image = match loader::load_from_path(&opts.image) {
        Ok(image) => image,
        Err(err) => {
            report_load_error(&err);
            return ExitCode::FAILURE;
        }
    };

    if opts.dump {
        for (addr, instr) in image.code.iter().enumerate() {
            println!("{:>5}: {}", addr, format_instruction(instr));
        }
        return ExitCode::SUCCESS;
    }

    let mut vm = Vm::new(&image);
    vm.run();

    if vm.last_error().is_none() {
        report_success(&opts.image.display().to_string(), vm.warnings().len());
    }
    ExitCode::SUCCESS
}

fn format_instruction(instr: &Instruction) -> String {
    format!(
        "{:?} result={:?} arg1={:?} arg2={:?}",
        instr.opcode, instr.result, instr.arg1, instr.arg2
    )
}
