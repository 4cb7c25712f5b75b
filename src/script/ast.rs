use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
        line: usize,
    },
    Assign {
        name: String,
        value: Expr,
        line: usize,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
        line: usize,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    Loop {
        body: Vec<Stmt>,
        line: usize,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
        line: usize,
    },
    Break {
        line: usize,
    },
    Continue {
        line: usize,
    },
    Return {
        value: Option<Expr>,
        line: usize,
    },
    Expr {
        expr: Expr,
        line: usize,
    },
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Let { line, .. }
            | Stmt::Assign { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::Loop { line, .. }
            | Stmt::For { line, .. }
            | Stmt::Break { line }
            | Stmt::Continue { line }
            | Stmt::Return { line, .. }
            | Stmt::Expr { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Where a tool call goes.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// `crm.read.getLead({...})` or `call("crm.read.getLead", {...})`.
    Static(String),
    /// `call(name_expr, {...})` with a non-literal name; resolved at run time.
    Dynamic(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var {
        name: String,
        line: usize,
    },
    /// `$name`; only produced when parsing policy predicates.
    Context {
        name: String,
        line: usize,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Field {
        target: Box<Expr>,
        field: String,
        line: usize,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
        line: usize,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        line: usize,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: usize,
    },
    Builtin {
        name: String,
        args: Vec<Expr>,
        line: usize,
    },
    ToolCall {
        target: CallTarget,
        args: Option<Box<Expr>>,
        line: usize,
    },
    /// `parallel [a, b, ...]`: elements are evaluated concurrently.
    Parallel {
        items: Vec<Expr>,
        line: usize,
    },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Expr::Literal(_) | Expr::Array(_) | Expr::Object(_) => 0,
            Expr::Var { line, .. }
            | Expr::Context { line, .. }
            | Expr::Field { line, .. }
            | Expr::Index { line, .. }
            | Expr::Unary { line, .. }
            | Expr::Binary { line, .. }
            | Expr::Builtin { line, .. }
            | Expr::ToolCall { line, .. }
            | Expr::Parallel { line, .. } => *line,
        }
    }
}
