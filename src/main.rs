#![forbid(unsafe_code)]
#![allow(unused_parens)]

use std::time::SystemTime;

use structopt::StructOpt;

use crate::cli::Opt;
use crate::env::{ new_shared_env, eval_source_block };
use crate::source::{ read_source_blocks, Output };

pub mod errors;
pub mod name;
pub mod expr;
pub mod embed;
pub mod simplify;
pub mod autodiff;
pub mod algebra;
pub mod interp;
pub mod imp;
pub mod lower;
pub mod env;
pub mod source;
pub mod cli;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL : mimallocator::Mimalloc = mimallocator::Mimalloc;

fn main() {
    let opt = Opt::from_args();

    if opt.debug {
        println!("CLI returned these arguments : {:#?}", opt);
    }

    let sources = match opt.try_read_files() {
        Ok(strings) => strings,
        Err(e) => {
            eprintln!("failed to read an input file : {}", e);
            std::process::exit(1);
        }
    };

    let start_instant = SystemTime::now();
    let env = new_shared_env();
    let mut num_blocks = 0usize;
    let mut num_errs = 0usize;

    for src in sources {
        for block in read_source_blocks(&src) {
            num_blocks += 1;
            let outcome = eval_source_block(&env, opt.backend, opt.show_passes, &block);
            for out in &outcome.outputs {
                match out {
                    Output::TextOut(s) => println!("{}", s),
                    Output::PassInfo(pass, s) => println!("=== {} ===\n{}", pass, s),
                    Output::MiscLog(s) => {
                        if opt.debug {
                            eprintln!("[log] {}", s);
                        }
                    },
                    Output::HeatmapOut(w, h, _) =>
                        println!("<heatmap {}x{}>", w, h),
                    Output::ScatterOut(xs, _) =>
                        println!("<scatter, {} points>", xs.len()),
                }
            }
            if let Err(e) = outcome.result {
                num_errs += 1;
                eprintln!("{}", e);
            }
        }
    }

    match start_instant.elapsed() {
        Ok(dur) => eprintln!("processed {} block(s) in {:?}, {} error(s)",
                             num_blocks, dur, num_errs),
        Err(_) => eprintln!("processed {} block(s), {} error(s)", num_blocks, num_errs),
    }

    if num_errs > 0 {
        std::process::exit(1);
    }
}
