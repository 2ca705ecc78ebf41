use std::fs::read_to_string;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::source::Backend;

#[derive(StructOpt, Debug)]
#[structopt(name = "tabula",
            about = "compiler core for a typed array language with effects and autodiff",
            version = "0.1.0")]
pub struct Opt {
    #[structopt(short = "d", long = "debug")]
    pub debug : bool,

    /// Code generation backend. The core only uses the tag (it decides
    /// whether and how kernels are emitted); `interp` evaluates with
    /// the reference interpreter instead of lowering.
    #[structopt(short = "b", long = "backend", default_value = "llvm")]
    pub backend : Backend,

    /// Print each pass's output alongside the results.
    #[structopt(short = "p", long = "show-passes")]
    pub show_passes : bool,

    /// Source files. Bare names are looked up in the working directory.
    #[structopt(name = "FILE", parse(from_os_str))]
    pub files : Vec<PathBuf>,
}

impl Opt {
    pub fn try_read_files(&self) -> Result<Vec<String>, std::io::Error> {
        self.files.iter().map(|x| try_read_cwd(x)).collect()
    }
}

fn try_read_cwd(suggestion : &PathBuf) -> Result<String, std::io::Error> {
    match std::env::current_dir() {
        Err(_) => read_to_string(suggestion),
        Ok(mut path) => {
            path.push(suggestion.clone());
            match read_to_string(&path) {
                Ok(s) => Ok(s),
                Err(_) => read_to_string(suggestion),
            }
        }
    }
}
