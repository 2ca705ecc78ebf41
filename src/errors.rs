use std::fmt::Debug;

/// The single error currency of the compiler. Every pass returns
/// `TabResult<T>`; nothing is thrown past the driver. `Compiler` and
/// `NotImplemented` kinds are bugs or missing features in us, the rest
/// are user errors surfaced from earlier frontend stages or from the
/// small number of places the core itself can reject input (linearity,
/// unbound names).
pub type TabResult<T> = Result<T, Err>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrKind {
    Parse,
    Ty,
    Kind,
    Lin,
    UnboundVar,
    RepeatedVar,
    Compiler,
    NotImplemented,
    DataIO,
    Misc,
}

/// An optional source position, `(line, offset)` as reported by the
/// upstream parser. The core itself never invents one; it only carries
/// positions through from the `SourceBlock` being evaluated.
pub type SrcPos = (usize, usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Err {
    pub kind : ErrKind,
    pub pos : Option<SrcPos>,
    pub msg : String,
}

impl Err {
    pub fn new(kind : ErrKind, msg : impl Into<String>) -> Self {
        Err { kind, pos : None, msg : msg.into() }
    }

    pub fn at(self, pos : SrcPos) -> Self {
        Err { pos : Some(pos), ..self }
    }

    /// An internal invariant breach. The elaborator upstream is supposed
    /// to make these unreachable; the file/line pair is for us.
    pub fn compiler(file : &'static str, line : u32, msg : impl Into<String>) -> Self {
        Err::new(ErrKind::Compiler, format!("{} line {}; {}", file, line, msg.into()))
    }

    pub fn not_implemented(what : impl Into<String>) -> Self {
        Err::new(ErrKind::NotImplemented, what)
    }

    pub fn linearity(msg : impl Into<String>) -> Self {
        Err::new(ErrKind::Lin, msg)
    }

    pub fn unbound(name : impl Debug) -> Self {
        Err::new(ErrKind::UnboundVar, format!("variable not in scope : {:?}", name))
    }
}

impl std::fmt::Display for ErrKind {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ErrKind::Parse => "Parse error",
            ErrKind::Ty => "Type error",
            ErrKind::Kind => "Kind error",
            ErrKind::Lin => "Linearity error",
            ErrKind::UnboundVar => "Error: variable not in scope",
            ErrKind::RepeatedVar => "Error: variable redefined",
            ErrKind::Compiler => "Compiler bug!",
            ErrKind::NotImplemented => "Not implemented",
            ErrKind::DataIO => "IO error",
            ErrKind::Misc => "Error",
        };
        write!(f, "{}", s)
    }
}

impl std::fmt::Display for Err {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.pos {
            Some((line, offset)) => write!(f, "{} (line {}, col {}): {}", self.kind, line, offset, self.msg),
            None => write!(f, "{}: {}", self.kind, self.msg),
        }
    }
}

impl std::error::Error for Err {}

/// Shorthand for the very common "this pattern match cannot fail if the
/// elaborator did its job" case.
#[macro_export]
macro_rules! compiler_err {
    ($($arg:tt)*) => {
        return Err($crate::errors::Err::compiler(file!(), line!(), format!($($arg)*)))
    };
}

#[cfg(test)]
mod errors_tests {
    use super::*;

    #[test]
    fn display_carries_position() {
        let e = Err::new(ErrKind::Lin, "variable used twice").at((3, 14));
        let rendered = format!("{}", e);
        assert!(rendered.contains("line 3"));
        assert!(rendered.contains("Linearity"));
    }
}
