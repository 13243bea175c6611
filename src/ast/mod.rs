use std::rc::Rc;

use serde::Serialize;

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Wraps a node with its source span. Transparent to serde (serializes as inner node only).
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

impl<T: Serialize> Serialize for Spanned<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.node.serialize(serializer)
    }
}

// ---- Chunk ----

/// Where a function body came from; used to turn spans into `chunk:line` positions.
#[derive(Debug)]
pub struct ChunkInfo {
    pub name: String,
    /// Byte offset at which each line after the first begins.
    newlines: Vec<usize>,
}

impl ChunkInfo {
    pub fn new(name: impl Into<String>, source: &str) -> Self {
        let newlines = source.match_indices('\n').map(|(i, _)| i + 1).collect();
        ChunkInfo { name: name.into(), newlines }
    }

    /// 1-based line holding the start of `span`.
    pub fn line_of(&self, span: Span) -> usize {
        self.newlines.partition_point(|&start| start <= span.start) + 1
    }
}

/// 1-based line of a byte offset, for callers without a [`ChunkInfo`].
pub fn line_at(source: &str, offset: usize) -> usize {
    source.as_bytes()[..offset.min(source.len())].iter().filter(|&&b| b == b'\n').count() + 1
}

/// Text of the 1-based `line`, without its terminator. Empty when out of range.
pub fn line_text(source: &str, line: usize) -> &str {
    line.checked_sub(1)
        .and_then(|i| source.split('\n').nth(i))
        .map_or("", |text| text.trim_end_matches('\r'))
}

/// A parsed chunk: the main function body, always vararg.
#[derive(Debug, Serialize)]
pub struct Chunk {
    pub name: String,
    pub body: Rc<FuncBody>,
}

#[derive(Debug, Serialize)]
pub struct FuncBody {
    pub params: Vec<String>,
    pub is_vararg: bool,
    pub block: Block,
    #[serde(skip)]
    pub source: Rc<ChunkInfo>,
}

pub type Block = Vec<Spanned<Stmt>>;

// ---- Statements ----

#[derive(Debug, Serialize)]
pub enum Stmt {
    /// `local a, b = x, y`
    Local { names: Vec<String>, values: Vec<Expr> },

    /// `a, t.k, t[i] = x, y, z`
    Assign { targets: Vec<Expr>, values: Vec<Expr> },

    /// Call used as a statement; results are discarded
    Call(Expr),

    Do(Block),

    While { condition: Expr, body: Block },

    /// `repeat body until condition`; the condition sees the body's locals
    Repeat { body: Block, condition: Expr },

    If {
        branches: Vec<(Expr, Block)>,
        otherwise: Option<Block>,
    },

    NumericFor {
        var: String,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },

    GenericFor {
        names: Vec<String>,
        exprs: Vec<Expr>,
        body: Block,
    },

    /// `function a.b:c() end`; `target` is the assignable path
    Function { target: Expr, body: Rc<FuncBody> },

    LocalFunction { name: String, body: Rc<FuncBody> },

    Return(Vec<Expr>),

    Break,
}

// ---- Expressions ----

#[derive(Debug, Serialize)]
pub enum Expr {
    Nil,
    True,
    False,
    Integer(i64),
    Number(f64),
    String(String),

    /// `...`
    Vararg,

    /// `...[n]`: n-th vararg, nil when absent
    VarargIndex(Box<Expr>),

    Function(Rc<FuncBody>),

    Table(Vec<Field>),

    Name(String),

    /// `t.k` and `t[k]`
    Index { object: Box<Expr>, key: Box<Expr> },

    Call { function: Box<Expr>, args: Vec<Expr> },

    /// `obj:name(args)`
    Method {
        object: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },

    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    UnOp { op: UnOp, operand: Box<Expr> },

    /// Parenthesized expression; truncates multiple results to one
    Paren(Box<Expr>),
}

impl Expr {
    /// Calls and `...` expand to all their values at the end of a list.
    pub fn is_multi(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::Method { .. } | Expr::Vararg)
    }
}

#[derive(Debug, Serialize)]
pub enum Field {
    /// `{v}`: next array slot
    Positional(Expr),
    /// `{k = v}` and `{[k] = v}`
    Keyed { key: Expr, value: Expr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// (left, right) binding power; right < left makes the operator right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Concat => "..",
            BinOp::Eq => "==",
            BinOp::Ne => "~=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

/// Binding power of unary operators.
pub const UNARY_PRIORITY: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}
