//! The `tohost`-polling compliance harness (component E10).
//!
//! Grounded directly on `red-planet-test/src/main.rs`: load an ELF's `PT_LOAD`
//! segments, free-run until done, then optionally dump a `begin_signature
//! ..end_signature` memory range. Re-targeted to additionally support polling the
//! `tohost` word (the `riscv-tests`/`riscv-arch-test` pass/fail convention per §6),
//! since the official compliance suites communicate completion that way rather than
//! via the board-level `is_powered_down` the teacher's own test binaries used.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use clap::Parser;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use rvsim_core::{Config, Engine, StepResult};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// ELF file to run.
    elf: PathBuf,

    /// Signature file to write the `begin_signature..end_signature` range to.
    #[arg(long, short)]
    signature: Option<PathBuf>,

    /// Guest RAM size, in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    ram_size: u32,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let mut buf = Vec::new();
    File::open(&args.elf)?.read_to_end(&mut buf)?;
    let elf = Elf::parse(&buf).expect("failed to parse ELF file");

    let mut engine = Engine::new(Config {
        reset_vector: 0x8000_0000,
        ram_size: args.ram_size,
        misa_c: true,
    });

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        engine
            .memory_mut()
            .store_bytes(header.p_paddr as u32, &buf[header.file_range()])
            .expect("ELF segment does not fit in guest RAM");
    }
    engine.set_pc(elf.entry as u32);

    let symbol = |name: &str| {
        elf.syms
            .iter()
            .find(|sym| elf.strtab.get_at(sym.st_name) == Some(name))
            .map(|sym| sym.st_value as u32)
    };
    let tohost = symbol("tohost");

    let exit_code = run(&mut engine, tohost);

    if let Some(path) = args.signature {
        let Some(start) = symbol("begin_signature") else {
            eprintln!("image is missing required symbol `begin_signature`");
            std::process::exit(1);
        };
        let Some(end) = symbol("end_signature") else {
            eprintln!("image is missing required symbol `end_signature`");
            std::process::exit(1);
        };
        assert!(start % 16 == 0);
        assert!(end % 4 == 0);
        assert!(start <= end);

        let mut file = File::create(path)?;
        for address in (start..end).step_by(4) {
            let word = engine
                .mem_load_u32(address)
                .expect("guest memory error while reading signature");
            writeln!(file, "{word:08x}")?;
        }
    }

    std::process::exit(exit_code);
}

/// Runs until the target halts (`ecall`-based exit) or, if present, the `tohost`
/// word is written: bit 0 set means the test finished, with `tohost >> 1` giving the
/// failing test number (0 means pass), per the `riscv-tests` convention.
fn run(engine: &mut Engine, tohost: Option<u32>) -> i32 {
    loop {
        match engine.step() {
            StepResult::Continue => {}
            StepResult::Terminated(code) => return code,
            StepResult::HostError(err) => {
                eprintln!(
                    "host error: unhandled synchronous trap (cause {}) at pc {:#010x}",
                    err.cause, err.pc
                );
                return 1;
            }
        }

        if let Some(address) = tohost {
            if let Ok(value) = engine.mem_load_u32(address) {
                if value & 1 != 0 {
                    let test = value >> 1;
                    return if test == 0 { 0 } else { test as i32 };
                }
            }
        }
    }
}
