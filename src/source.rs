use crate::name::Name;
use crate::expr::{ Block, Binder };
use crate::errors::Err;
use crate::imp::Device;

/// The interfaces the core shares with its collaborators: the parser
/// upstream (which produces `SourceBlock`s), the driver (which consumes
/// `Outcome`s), and the code generator downstream (which consumes Imp
/// modules). The concrete-syntax parser itself lives outside this
/// crate; the reader here only classifies raw blocks so the driver has
/// something sensible to do with files in the meantime.

/// A top-level input unit: position, raw text, and classified contents.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBlock {
    pub line : usize,
    pub offset : usize,
    pub raw_text : String,
    pub contents : SourceContents,
}

/// An elaborated module: a block of top-level declarations whose result
/// is a positional record of the exported atoms, in `exports` order.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub block : Block,
    pub exports : Vec<Binder>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceContents {
    RunModule(Module),
    Command(EvalCmd, Module),
    GetNameType(Name),
    IncludeSourceFile(String),
    LoadData(String, String),
    ProseBlock(String),
    CommentLine,
    EmptyLines,
    UnParseable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalCmd {
    EvalExpr,
    ShowSimp,
    ShowImp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassName {
    SimpPass,
    LinPass,
    ImpPass,
}

impl std::fmt::Display for PassName {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PassName::SimpPass => write!(f, "simp"),
            PassName::LinPass => write!(f, "lin"),
            PassName::ImpPass => write!(f, "imp"),
        }
    }
}

/// One unit of driver-visible output.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    TextOut(String),
    PassInfo(PassName, String),
    HeatmapOut(usize, usize, Vec<f64>),
    ScatterOut(Vec<f64>, Vec<f64>),
    MiscLog(String),
}

/// What evaluating one source block produced: the outputs in order,
/// and either success or the error that aborted the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub outputs : Vec<Output>,
    pub result : Result<(), Err>,
}

impl Outcome {
    pub fn ok(outputs : Vec<Output>) -> Self {
        Outcome { outputs, result : Ok(()) }
    }

    pub fn fail(outputs : Vec<Output>, err : Err) -> Self {
        Outcome { outputs, result : Err(err) }
    }
}

/// Recognized backends. Only tags at this level; the code generator
/// behind them is out of scope. Kernel emission is the one decision the
/// core takes from the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    LLVM,
    LLVMMC,
    LLVMCUDA,
    Interp,
}

impl Backend {
    pub fn main_device(self) -> Device {
        Device::Cpu
    }
}

impl std::str::FromStr for Backend {
    type Err = String;
    fn from_str(s : &str) -> Result<Backend, String> {
        match s {
            "llvm" => Ok(Backend::LLVM),
            "llvm-mc" => Ok(Backend::LLVMMC),
            "llvm-cuda" => Ok(Backend::LLVMCUDA),
            "interp" => Ok(Backend::Interp),
            owise => Err(format!("unrecognized backend {:?} \
                                  (expected llvm, llvm-mc, llvm-cuda, or interp)", owise)),
        }
    }
}

/// Split raw input into source blocks on blank lines and classify the
/// easy cases. Code blocks stay `UnParseable` until the external parser
/// supplies elaborated modules.
pub fn read_source_blocks(src : &str) -> Vec<SourceBlock> {
    let mut blocks = Vec::new();
    let mut cur : Vec<&str> = Vec::new();
    let mut cur_line = 1usize;
    let mut offset = 0usize;
    let mut cur_offset = 0usize;
    let mut line_no = 1usize;

    let mut flush = |cur : &mut Vec<&str>, cur_line : usize, cur_offset : usize,
                     blocks : &mut Vec<SourceBlock>| {
        if cur.is_empty() {
            return
        }
        let raw = cur.join("\n");
        let contents = classify_block(&raw);
        blocks.push(SourceBlock {
            line : cur_line,
            offset : cur_offset,
            raw_text : raw,
            contents,
        });
        cur.clear();
    };

    for line in src.lines() {
        if line.trim().is_empty() {
            flush(&mut cur, cur_line, cur_offset, &mut blocks);
        } else {
            if cur.is_empty() {
                cur_line = line_no;
                cur_offset = offset;
            }
            cur.push(line);
        }
        offset += line.len() + 1;
        line_no += 1;
    }
    flush(&mut cur, cur_line, cur_offset, &mut blocks);
    blocks
}

fn classify_block(raw : &str) -> SourceContents {
    let trimmed = raw.trim_start();
    if trimmed.starts_with("--") {
        if raw.lines().count() == 1 {
            SourceContents::CommentLine
        } else {
            SourceContents::ProseBlock(raw.to_string())
        }
    } else if let Some(rest) = trimmed.strip_prefix("include ") {
        SourceContents::IncludeSourceFile(rest.trim().trim_matches('"').to_string())
    } else {
        SourceContents::UnParseable(raw.to_string())
    }
}

#[cfg(test)]
mod source_tests {
    use super::*;

    #[test]
    fn reader_splits_on_blank_lines() {
        let src = "-- a comment\n\nx = 1\ny = 2\n\n\ninclude \"prelude\"\n";
        let blocks = read_source_blocks(src);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].contents, SourceContents::CommentLine);
        assert!(matches!(blocks[1].contents, SourceContents::UnParseable(..)));
        assert_eq!(blocks[1].line, 3);
        assert_eq!(blocks[2].contents,
                   SourceContents::IncludeSourceFile("prelude".to_string()));
    }

    #[test]
    fn backend_tags_parse() {
        assert_eq!("llvm".parse::<Backend>(), Ok(Backend::LLVM));
        assert_eq!("llvm-cuda".parse::<Backend>(), Ok(Backend::LLVMCUDA));
        assert!("cranelift".parse::<Backend>().is_err());
    }
}
