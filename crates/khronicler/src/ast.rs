//! Abstract syntax tree for KBasic programs.
//!
//! The tree is fully owned: statements own their bodies and expressions own
//! their operands. Instead of parent pointers, `break`, `continue` and loop
//! bookkeeping are resolved while parsing — every statement that jumps
//! records the control id of the construct it targets, and the compiler
//! indexes its per-construct label bundle with that id.

use strum::{FromRepr, IntoStaticStr};

/// Identifier of a control-flow construct, assigned by the parser in
/// visitation order starting at 1. The program root records the total count.
pub type ControlId = u32;

/// Expression and comparison operators with their binding strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u32)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Neg = 1,
    Not,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    IntDiv,
    Mod,
    And,
    Or,
    Equal,
    ApproxEq,
    Neq,
    Gt,
    Lt,
    Gteq,
    Lteq,
}

impl Operator {
    /// Binding strength; a higher value binds tighter.
    pub fn precedence(self) -> u32 {
        match self {
            Self::Neg => 500,
            Self::Mul | Self::Div | Self::Pow | Self::Mod => 200,
            Self::IntDiv => 150,
            Self::Add | Self::Sub => 100,
            Self::Concat => 90,
            Self::Gt | Self::Lt | Self::Gteq | Self::Lteq => 60,
            Self::Not | Self::Equal | Self::ApproxEq | Self::Neq => 50,
            Self::And => 40,
            Self::Or => 30,
        }
    }

    /// Resolves an operator token used in binary position.
    ///
    /// `!` only ever appears in operand position and `-` maps to `Sub` here;
    /// the unary readings are produced directly by the expression builder.
    pub fn binary_from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "&" => Self::Concat,
            "+" => Self::Add,
            "-" => Self::Sub,
            "*" => Self::Mul,
            "/" => Self::Div,
            "^" => Self::Pow,
            "\\" => Self::IntDiv,
            "%" => Self::Mod,
            "&&" => Self::And,
            "||" => Self::Or,
            "=" => Self::Equal,
            "~=" => Self::ApproxEq,
            "<>" => Self::Neq,
            ">" => Self::Gt,
            "<" => Self::Lt,
            ">=" => Self::Gteq,
            "<=" => Self::Lteq,
            _ => return None,
        })
    }
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    LiteralNumeric(f64),
    LiteralString(String),
    Variable(String),
    Paren(Box<Expr>),
    Unary {
        op: Operator,
        operand: Box<Expr>,
    },
    Binary {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    ArrayAccess {
        name: String,
        subscript: Box<Expr>,
    },
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
}

/// One `elseif` arm of an `if` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ElseIfArm {
    pub condition: Expr,
    pub body: Vec<Stmt>,
}

/// A declared function parameter. `name[]` marks the parameter as an array,
/// letting the body use subscript syntax on it.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncParam {
    pub name: String,
    pub is_array: bool,
}

/// A statement with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

/// Statement payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    FunctionDeclare {
        control_id: ControlId,
        name: String,
        params: Vec<FuncParam>,
        body: Vec<Stmt>,
    },
    IfGoto {
        condition: Expr,
        label: String,
    },
    If {
        control_id: ControlId,
        condition: Expr,
        then_body: Vec<Stmt>,
        elseifs: Vec<ElseIfArm>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        control_id: ControlId,
        condition: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        control_id: ControlId,
        condition: Expr,
        body: Vec<Stmt>,
    },
    For {
        control_id: ControlId,
        variable: String,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    /// Jump to the end of the enclosing loop, identified at parse time.
    Break {
        loop_id: ControlId,
    },
    /// Jump to the next iteration of the enclosing loop.
    Continue {
        loop_id: ControlId,
    },
    Exit {
        value: Option<Expr>,
    },
    Return {
        value: Option<Expr>,
    },
    Goto {
        label: String,
    },
    Dim {
        name: String,
        initializer: Option<Expr>,
    },
    DimArray {
        name: String,
        dimension: Expr,
    },
    Redim {
        name: String,
        dimension: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    AssignArray {
        name: String,
        subscript: Expr,
        value: Expr,
    },
    LabelDeclare {
        name: String,
    },
    /// A bare expression evaluated for its side effects.
    Expr(Expr),
}

/// Root of a parsed program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
    /// Total number of control-flow constructs; control ids are `1..=count`.
    pub num_controls: u32,
}
