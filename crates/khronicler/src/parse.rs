//! Source parser: line-oriented statement rules plus the shunting-yard
//! expression builder.
//!
//! Each line picks a statement rule from its first token. Rules match a
//! fixed token sequence, *validate* embedded expressions with a predictive
//! scan over the remembered byte offset, and only then rewind and build the
//! expression tree — a failed statement never leaves a partial AST behind.
//! Nesting is tracked with a stack of open blocks; `break`, `continue` and
//! `return` resolve their targets against that stack while parsing.

use std::mem;

use strum::IntoStaticStr;

use crate::{
    ast::{ControlId, ElseIfArm, Expr, FuncParam, Operator, Program, Stmt, StmtKind},
    lexer::{Keyword, LineAnalyzer, Token, TokenKind},
    num,
};

/// Syntax error categories, raised at the first offending token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyntaxError {
    ExpectLineEnd,
    FuncMissingName,
    FuncMissingLeftParen,
    FuncInvalidParameters,
    FuncNested,
    IfGotoMissingLabel,
    ElseIfNotMatch,
    ElseNotMatch,
    ForMissingVariable,
    ForMissingEqual,
    ForMissingTo,
    ForVarMismatch,
    NextNotMatch,
    BreakOutsideLoop,
    ContinueOutsideLoop,
    EndKeywordNotMatch,
    EndKeywordInvalid,
    ReturnOutsideFunc,
    GotoMissingLabel,
    DimMissingVariable,
    DimInvalid,
    DimArrayMissingBracketR,
    RedimMissingVariable,
    RedimMissingBracketL,
    RedimMissingBracketR,
    ExprInvalid,
    UnterminatedFuncOrCtrl,
    Unrecognized,
}

impl SyntaxError {
    pub fn message(self) -> &'static str {
        match self {
            Self::ExpectLineEnd => "Expected end of line but found extra tokens.",
            Self::FuncMissingName => "Function definition missing function name.",
            Self::FuncMissingLeftParen => "Function definition missing left parenthesis.",
            Self::FuncInvalidParameters => "Invalid function parameter list.",
            Self::FuncNested => "Nested function definitions are not allowed.",
            Self::IfGotoMissingLabel => "'if ... goto' statement missing target label.",
            Self::ElseIfNotMatch => "'elseif' without matching 'if'.",
            Self::ElseNotMatch => "'else' without matching 'if'.",
            Self::ForMissingVariable => "'for' statement missing loop variable.",
            Self::ForMissingEqual => "'for' statement missing '=' after variable.",
            Self::ForMissingTo => "'for' statement missing 'to' keyword.",
            Self::ForVarMismatch => "'for' loop variable mismatch",
            Self::NextNotMatch => "'next' without matching 'for'.",
            Self::BreakOutsideLoop => "'break' used outside of loop.",
            Self::ContinueOutsideLoop => "'continue' used outside of loop.",
            Self::EndKeywordNotMatch => "'end' does not match the nearest block.",
            Self::EndKeywordInvalid => "'end' must be followed by 'if', 'while', or 'func'.",
            Self::ReturnOutsideFunc => "'return' used outside of function.",
            Self::GotoMissingLabel => "'goto' statement missing target label.",
            Self::DimMissingVariable => "'dim' statement missing variable name.",
            Self::DimInvalid => "Invalid 'dim' syntax.",
            Self::DimArrayMissingBracketR => "'dim' array missing right bracket.",
            Self::RedimMissingVariable => "'redim' statement missing variable name.",
            Self::RedimMissingBracketL => "'redim' statement missing left bracket.",
            Self::RedimMissingBracketR => "'redim' statement missing right bracket.",
            Self::ExprInvalid => "Invalid expression syntax.",
            Self::UnterminatedFuncOrCtrl => {
                "Program ended but a function or control structure was not closed."
            }
            Self::Unrecognized => "Unrecognized statement.",
        }
    }
}

impl std::fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// The statement rule that was active when a syntax error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    None,
    Func,
    If,
    IfGoto,
    ElseIf,
    Else,
    While,
    DoWhile,
    For,
    Next,
    Break,
    Continue,
    End,
    Exit,
    Return,
    Goto,
    Dim,
    DimArray,
    Redim,
    Label,
    Assign,
    AssignArray,
    Expr,
}

impl StatementKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Func => "function declare",
            Self::If => "if",
            Self::IfGoto => "if...goto",
            Self::ElseIf => "elseif",
            Self::Else => "else",
            Self::While => "while",
            Self::DoWhile => "do...while",
            Self::For => "for",
            Self::Next => "next",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::End => "end",
            Self::Exit => "exit",
            Self::Return => "return",
            Self::Goto => "goto",
            Self::Dim => "dim",
            Self::DimArray => "dim array",
            Self::Redim => "redim",
            Self::Label => "label declare",
            Self::Assign => "assign",
            Self::AssignArray => "assign array",
            Self::Expr => "expression",
        }
    }
}

/// A syntax error together with the statement rule and line it stopped on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxErrorReport {
    pub error: SyntaxError,
    pub statement: StatementKind,
    pub line: u32,
}

impl std::fmt::Display for SyntaxErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (while parsing {} statement)",
            self.error.message(),
            self.statement.name()
        )
    }
}

impl std::error::Error for SyntaxErrorReport {}

type LineResult = Result<(), (SyntaxError, StatementKind)>;

// ---------------------------------------------------------------------------
// Expression validation (predictive scan, no tree building)
// ---------------------------------------------------------------------------

fn match_try_binary_operator(analyzer: &mut LineAnalyzer) -> bool {
    let token = analyzer.next_token();
    if token.kind == TokenKind::Operator {
        // `!` is never a binary operator
        if token.content == "!" {
            return false;
        }
        return match_expr(analyzer);
    }
    analyzer.rewind_token();
    true
}

/// Validates one expression starting at the cursor, consuming it.
fn match_expr(analyzer: &mut LineAnalyzer) -> bool {
    let token = analyzer.next_token();
    match token.kind {
        TokenKind::Numeric | TokenKind::String => match_try_binary_operator(analyzer),
        TokenKind::Operator if token.content == "!" || token.content == "-" => {
            match_expr(analyzer) && match_try_binary_operator(analyzer)
        }
        TokenKind::Identifier => {
            let token = analyzer.next_token();
            match token.kind {
                TokenKind::ParenL => {
                    let token = analyzer.next_token();
                    if token.kind != TokenKind::ParenR {
                        analyzer.rewind_token();
                        loop {
                            if !match_expr(analyzer) {
                                return false;
                            }
                            let token = analyzer.next_token();
                            match token.kind {
                                TokenKind::Comma => {}
                                TokenKind::ParenR => break,
                                _ => return false,
                            }
                        }
                    }
                }
                TokenKind::BracketL => {
                    if !match_expr(analyzer) {
                        return false;
                    }
                    if analyzer.next_token().kind != TokenKind::BracketR {
                        return false;
                    }
                }
                _ => analyzer.rewind_token(),
            }
            match_try_binary_operator(analyzer)
        }
        TokenKind::ParenL => {
            if !match_expr(analyzer) {
                return false;
            }
            if analyzer.next_token().kind != TokenKind::ParenR {
                return false;
            }
            match_try_binary_operator(analyzer)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Expression building (shunting-yard over two stacks)
// ---------------------------------------------------------------------------

/// Operator-stack entries. Call, array-access and paren entries act as
/// sentinels: collapsing stops when one is on top.
enum StackOp {
    Paren,
    ArrayAccess(String),
    Call { name: String, args: Vec<Expr> },
    Binary(Operator),
}

fn collapse_binary(operands: &mut Vec<Expr>, operators: &mut Vec<StackOp>) {
    let Some(StackOp::Binary(op)) = operators.pop() else {
        return;
    };
    let right = operands.pop().expect("validated expression has right operand");
    let left = operands.pop().expect("validated expression has left operand");
    operands.push(Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    });
}

fn build_try_operator(
    analyzer: &mut LineAnalyzer,
    operands: &mut Vec<Expr>,
    operators: &mut Vec<StackOp>,
) {
    let token = analyzer.next_token();
    if token.kind == TokenKind::Operator {
        if let Some(op) = Operator::binary_from_symbol(&token.content) {
            // collapse stronger-or-equal operators before pushing this one
            while let Some(&StackOp::Binary(top)) = operators.last() {
                if top.precedence() >= op.precedence() {
                    collapse_binary(operands, operators);
                } else {
                    break;
                }
            }
            operators.push(StackOp::Binary(op));
            build_try_operand(analyzer, operands, operators);
            return;
        }
    }
    analyzer.rewind_token();
}

fn build_unary(
    analyzer: &mut LineAnalyzer,
    operands: &mut Vec<Expr>,
    operators: &mut Vec<StackOp>,
    op: Operator,
) {
    build_try_operand(analyzer, operands, operators);
    let operand = operands.pop().expect("validated unary operand");
    operands.push(Expr::Unary {
        op,
        operand: Box::new(operand),
    });
    build_try_operator(analyzer, operands, operators);
}

fn build_try_operand(
    analyzer: &mut LineAnalyzer,
    operands: &mut Vec<Expr>,
    operators: &mut Vec<StackOp>,
) {
    let token = analyzer.next_token();
    match token.kind {
        TokenKind::Numeric => {
            operands.push(Expr::LiteralNumeric(num::parse_number(&token.content)));
            build_try_operator(analyzer, operands, operators);
        }
        TokenKind::String => {
            operands.push(Expr::LiteralString(token.content));
            build_try_operator(analyzer, operands, operators);
        }
        TokenKind::Operator if token.content == "-" => {
            build_unary(analyzer, operands, operators, Operator::Neg);
        }
        TokenKind::Operator if token.content == "!" => {
            build_unary(analyzer, operands, operators, Operator::Not);
        }
        TokenKind::Identifier => {
            let name = token.content;
            let token = analyzer.next_token();
            match token.kind {
                TokenKind::ParenL => {
                    operators.push(StackOp::Call {
                        name,
                        args: Vec::new(),
                    });
                    let token = analyzer.next_token();
                    if token.kind != TokenKind::ParenR {
                        analyzer.rewind_token();
                        loop {
                            build_try_operand(analyzer, operands, operators);
                            // fold operators emitted by the argument back
                            // down to this call's sentinel
                            while matches!(operators.last(), Some(StackOp::Binary(_))) {
                                collapse_binary(operands, operators);
                            }
                            let arg = operands.pop().expect("validated call argument");
                            if let Some(StackOp::Call { args, .. }) = operators.last_mut() {
                                args.push(arg);
                            }
                            let token = analyzer.next_token();
                            match token.kind {
                                TokenKind::Comma => {}
                                _ => break,
                            }
                        }
                    }
                    let Some(StackOp::Call { name, args }) = operators.pop() else {
                        unreachable!("call sentinel on top after arguments");
                    };
                    operands.push(Expr::FunctionCall { name, args });
                }
                TokenKind::BracketL => {
                    operators.push(StackOp::ArrayAccess(name));
                    build_try_operand(analyzer, operands, operators);
                    // closing bracket
                    let _ = analyzer.next_token();
                    while matches!(operators.last(), Some(StackOp::Binary(_))) {
                        collapse_binary(operands, operators);
                    }
                    let Some(StackOp::ArrayAccess(name)) = operators.pop() else {
                        unreachable!("array sentinel on top after subscript");
                    };
                    let subscript = operands.pop().expect("validated subscript");
                    operands.push(Expr::ArrayAccess {
                        name,
                        subscript: Box::new(subscript),
                    });
                }
                _ => {
                    analyzer.rewind_token();
                    operands.push(Expr::Variable(name));
                }
            }
            build_try_operator(analyzer, operands, operators);
        }
        TokenKind::ParenL => {
            operators.push(StackOp::Paren);
            build_try_operand(analyzer, operands, operators);
            // closing paren
            let _ = analyzer.next_token();
            while matches!(operators.last(), Some(StackOp::Binary(_))) {
                collapse_binary(operands, operators);
            }
            let popped = operators.pop();
            debug_assert!(matches!(popped, Some(StackOp::Paren)));
            let inner = operands.pop().expect("validated paren body");
            operands.push(Expr::Paren(Box::new(inner)));
            build_try_operator(analyzer, operands, operators);
        }
        _ => analyzer.rewind_token(),
    }
}

/// Builds the expression tree at the cursor. Must only be called on spans
/// already accepted by [`match_expr`].
fn build_expr(analyzer: &mut LineAnalyzer) -> Expr {
    let mut operands = Vec::new();
    let mut operators = Vec::new();
    build_try_operand(analyzer, &mut operands, &mut operators);
    while !operators.is_empty() {
        collapse_binary(&mut operands, &mut operators);
    }
    operands.pop().expect("validated expression has a root")
}

// ---------------------------------------------------------------------------
// Statement parsing
// ---------------------------------------------------------------------------

/// Which branch of an `if` block is currently collecting statements.
enum IfBranch {
    Then,
    ElseIf(Expr),
    Else,
}

/// An open block on the parser's nesting stack.
enum Frame {
    Program {
        stmts: Vec<Stmt>,
    },
    Func {
        line: u32,
        control_id: ControlId,
        name: String,
        params: Vec<FuncParam>,
        stmts: Vec<Stmt>,
    },
    If {
        line: u32,
        control_id: ControlId,
        condition: Expr,
        then_body: Option<Vec<Stmt>>,
        elseifs: Vec<ElseIfArm>,
        else_body: Option<Vec<Stmt>>,
        branch: IfBranch,
        stmts: Vec<Stmt>,
    },
    While {
        line: u32,
        control_id: ControlId,
        condition: Expr,
        stmts: Vec<Stmt>,
    },
    DoWhile {
        line: u32,
        control_id: ControlId,
        stmts: Vec<Stmt>,
    },
    For {
        line: u32,
        control_id: ControlId,
        variable: String,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
        stmts: Vec<Stmt>,
    },
}

impl Frame {
    fn stmts_mut(&mut self) -> &mut Vec<Stmt> {
        match self {
            Self::Program { stmts }
            | Self::Func { stmts, .. }
            | Self::If { stmts, .. }
            | Self::While { stmts, .. }
            | Self::DoWhile { stmts, .. }
            | Self::For { stmts, .. } => stmts,
        }
    }
}

struct SourceParser {
    frames: Vec<Frame>,
    control_counter: ControlId,
    line_number: u32,
}

fn expect_kind(
    analyzer: &mut LineAnalyzer,
    kind: TokenKind,
    error: SyntaxError,
    statement: StatementKind,
) -> Result<Token, (SyntaxError, StatementKind)> {
    let token = analyzer.next_token();
    if token.kind == kind {
        Ok(token)
    } else {
        Err((error, statement))
    }
}

fn expect_line_end(analyzer: &mut LineAnalyzer, statement: StatementKind) -> LineResult {
    expect_kind(analyzer, TokenKind::LineEnd, SyntaxError::ExpectLineEnd, statement).map(|_| ())
}

fn match_valid_expr(analyzer: &mut LineAnalyzer, statement: StatementKind) -> LineResult {
    if match_expr(analyzer) {
        Ok(())
    } else {
        Err((SyntaxError::ExprInvalid, statement))
    }
}

impl SourceParser {
    fn new() -> Self {
        Self {
            frames: vec![Frame::Program { stmts: Vec::new() }],
            control_counter: 0,
            line_number: 0,
        }
    }

    fn next_control_id(&mut self) -> ControlId {
        self.control_counter += 1;
        self.control_counter
    }

    fn push_stmt(&mut self, kind: StmtKind) {
        let stmt = Stmt {
            line: self.line_number,
            kind,
        };
        self.frames
            .last_mut()
            .expect("frame stack never empty")
            .stmts_mut()
            .push(stmt);
    }

    /// Control id of the nearest enclosing loop, if any.
    fn enclosing_loop(&self) -> Option<ControlId> {
        self.frames.iter().rev().find_map(|frame| match frame {
            Frame::While { control_id, .. }
            | Frame::DoWhile { control_id, .. }
            | Frame::For { control_id, .. } => Some(*control_id),
            _ => None,
        })
    }

    fn inside_function(&self) -> bool {
        self.frames
            .iter()
            .any(|frame| matches!(frame, Frame::Func { .. }))
    }

    /// Moves the statements collected for the current `if` branch into the
    /// branch's slot.
    fn close_if_branch(frame: &mut Frame) {
        let Frame::If {
            then_body,
            elseifs,
            else_body,
            branch,
            stmts,
            ..
        } = frame
        else {
            unreachable!("close_if_branch on a non-if frame");
        };
        let body = mem::take(stmts);
        match mem::replace(branch, IfBranch::Then) {
            IfBranch::Then => *then_body = Some(body),
            IfBranch::ElseIf(condition) => elseifs.push(ElseIfArm { condition, body }),
            IfBranch::Else => *else_body = Some(body),
        }
    }

    fn parse_statement(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        let token = analyzer.next_token();

        match token.keyword() {
            Some(Keyword::Func) => self.parse_func(analyzer),
            Some(Keyword::If) => self.parse_if(analyzer),
            Some(Keyword::ElseIf) => self.parse_elseif(analyzer),
            Some(Keyword::Else) => self.parse_else(analyzer),
            Some(Keyword::While) => self.parse_while(analyzer),
            Some(Keyword::Do) => self.parse_do(analyzer),
            Some(Keyword::For) => self.parse_for(analyzer),
            Some(Keyword::Next) => self.parse_next(analyzer),
            Some(Keyword::Break) => self.parse_break(analyzer),
            Some(Keyword::Continue) => self.parse_continue(analyzer),
            Some(Keyword::End) => self.parse_end(analyzer),
            Some(Keyword::Exit) => self.parse_exit(analyzer),
            Some(Keyword::Return) => self.parse_return(analyzer),
            Some(Keyword::Goto) => self.parse_goto(analyzer),
            Some(Keyword::Dim) => self.parse_dim(analyzer),
            Some(Keyword::Redim) => self.parse_redim(analyzer),
            _ => match token.kind {
                TokenKind::Identifier => self.parse_identifier_led(analyzer, token.content),
                TokenKind::LineEnd => Ok(()),
                _ => self.parse_bare_expression(analyzer),
            },
        }
    }

    fn parse_func(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Func;
        // function declarations only at module level
        if self.frames.len() != 1 {
            return Err((SyntaxError::FuncNested, STMT));
        }
        let control_id = self.next_control_id();
        let name =
            expect_kind(analyzer, TokenKind::Identifier, SyntaxError::FuncMissingName, STMT)?
                .content;
        expect_kind(analyzer, TokenKind::ParenL, SyntaxError::FuncMissingLeftParen, STMT)?;

        let mut params = Vec::new();
        let token = analyzer.next_token();
        if token.kind != TokenKind::ParenR {
            analyzer.rewind_token();
            loop {
                let param = expect_kind(
                    analyzer,
                    TokenKind::Identifier,
                    SyntaxError::FuncInvalidParameters,
                    STMT,
                )?;
                let mut is_array = false;
                let mut token = analyzer.next_token();
                if token.kind == TokenKind::BracketL {
                    is_array = true;
                    expect_kind(
                        analyzer,
                        TokenKind::BracketR,
                        SyntaxError::FuncInvalidParameters,
                        STMT,
                    )?;
                    token = analyzer.next_token();
                }
                params.push(FuncParam {
                    name: param.content,
                    is_array,
                });
                match token.kind {
                    TokenKind::ParenR => break,
                    TokenKind::Comma => {}
                    _ => return Err((SyntaxError::FuncInvalidParameters, STMT)),
                }
            }
        }
        expect_line_end(analyzer, STMT)?;

        self.frames.push(Frame::Func {
            line: self.line_number,
            control_id,
            name,
            params,
            stmts: Vec::new(),
        });
        Ok(())
    }

    fn parse_if(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        let cond_start = analyzer.cursor();
        match_valid_expr(analyzer, StatementKind::If)?;
        let token = analyzer.next_token();
        if token.is_keyword(Keyword::Goto) {
            const STMT: StatementKind = StatementKind::IfGoto;
            let label = expect_kind(
                analyzer,
                TokenKind::Identifier,
                SyntaxError::IfGotoMissingLabel,
                STMT,
            )?
            .content;
            expect_line_end(analyzer, STMT)?;
            analyzer.set_cursor(cond_start);
            let condition = build_expr(analyzer);
            self.push_stmt(StmtKind::IfGoto { condition, label });
            Ok(())
        } else if token.kind == TokenKind::LineEnd {
            let control_id = self.next_control_id();
            analyzer.set_cursor(cond_start);
            let condition = build_expr(analyzer);
            self.frames.push(Frame::If {
                line: self.line_number,
                control_id,
                condition,
                then_body: None,
                elseifs: Vec::new(),
                else_body: None,
                branch: IfBranch::Then,
                stmts: Vec::new(),
            });
            Ok(())
        } else {
            Err((SyntaxError::ExpectLineEnd, StatementKind::If))
        }
    }

    fn parse_elseif(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::ElseIf;
        let cond_start = analyzer.cursor();
        let matches_if = matches!(
            self.frames.last(),
            Some(Frame::If {
                branch: IfBranch::Then | IfBranch::ElseIf(_),
                ..
            })
        );
        if !matches_if {
            return Err((SyntaxError::ElseIfNotMatch, STMT));
        }
        match_valid_expr(analyzer, STMT)?;
        expect_line_end(analyzer, STMT)?;
        analyzer.set_cursor(cond_start);
        let condition = build_expr(analyzer);

        let frame = self.frames.last_mut().expect("frame stack never empty");
        Self::close_if_branch(frame);
        let Frame::If { branch, .. } = frame else {
            unreachable!("checked above");
        };
        *branch = IfBranch::ElseIf(condition);
        Ok(())
    }

    fn parse_else(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Else;
        let matches_if = matches!(
            self.frames.last(),
            Some(Frame::If {
                branch: IfBranch::Then | IfBranch::ElseIf(_),
                ..
            })
        );
        if !matches_if {
            return Err((SyntaxError::ElseNotMatch, STMT));
        }
        expect_line_end(analyzer, STMT)?;
        let frame = self.frames.last_mut().expect("frame stack never empty");
        Self::close_if_branch(frame);
        let Frame::If { branch, .. } = frame else {
            unreachable!("checked above");
        };
        *branch = IfBranch::Else;
        Ok(())
    }

    fn parse_while(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        let cond_start = analyzer.cursor();
        // `while <cond>` both opens a while loop and closes a do...while
        if matches!(self.frames.last(), Some(Frame::DoWhile { .. })) {
            const STMT: StatementKind = StatementKind::DoWhile;
            match_valid_expr(analyzer, STMT)?;
            expect_line_end(analyzer, STMT)?;
            analyzer.set_cursor(cond_start);
            let condition = build_expr(analyzer);
            let Some(Frame::DoWhile {
                line,
                control_id,
                stmts,
            }) = self.frames.pop()
            else {
                unreachable!("checked above");
            };
            let stmt = Stmt {
                line,
                kind: StmtKind::DoWhile {
                    control_id,
                    condition,
                    body: stmts,
                },
            };
            self.frames
                .last_mut()
                .expect("frame stack never empty")
                .stmts_mut()
                .push(stmt);
            Ok(())
        } else {
            const STMT: StatementKind = StatementKind::While;
            match_valid_expr(analyzer, STMT)?;
            expect_line_end(analyzer, STMT)?;
            let control_id = self.next_control_id();
            analyzer.set_cursor(cond_start);
            let condition = build_expr(analyzer);
            self.frames.push(Frame::While {
                line: self.line_number,
                control_id,
                condition,
                stmts: Vec::new(),
            });
            Ok(())
        }
    }

    fn parse_do(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        expect_line_end(analyzer, StatementKind::DoWhile)?;
        let control_id = self.next_control_id();
        self.frames.push(Frame::DoWhile {
            line: self.line_number,
            control_id,
            stmts: Vec::new(),
        });
        Ok(())
    }

    fn parse_for(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::For;
        let control_id = self.next_control_id();
        let variable = expect_kind(
            analyzer,
            TokenKind::Identifier,
            SyntaxError::ForMissingVariable,
            STMT,
        )?
        .content;
        let token = analyzer.next_token();
        if !token.is_operator("=") {
            return Err((SyntaxError::ForMissingEqual, STMT));
        }
        let from_start = analyzer.cursor();
        match_valid_expr(analyzer, STMT)?;
        let token = analyzer.next_token();
        if !token.is_keyword(Keyword::To) {
            return Err((SyntaxError::ForMissingTo, STMT));
        }
        let to_start = analyzer.cursor();
        match_valid_expr(analyzer, STMT)?;
        let token = analyzer.next_token();
        let step_start = if token.is_keyword(Keyword::Step) {
            let step_start = analyzer.cursor();
            match_valid_expr(analyzer, STMT)?;
            Some(step_start)
        } else {
            analyzer.rewind_token();
            None
        };
        expect_line_end(analyzer, STMT)?;

        analyzer.set_cursor(from_start);
        let from = build_expr(analyzer);
        analyzer.set_cursor(to_start);
        let to = build_expr(analyzer);
        let step = step_start.map(|start| {
            analyzer.set_cursor(start);
            build_expr(analyzer)
        });

        self.frames.push(Frame::For {
            line: self.line_number,
            control_id,
            variable,
            from,
            to,
            step,
            stmts: Vec::new(),
        });
        Ok(())
    }

    fn parse_next(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Next;
        if !matches!(self.frames.last(), Some(Frame::For { .. })) {
            return Err((SyntaxError::NextNotMatch, STMT));
        }
        let token = analyzer.next_token();
        match token.kind {
            TokenKind::Identifier => {
                let Some(Frame::For { variable, .. }) = self.frames.last() else {
                    unreachable!("checked above");
                };
                if *variable != token.content {
                    return Err((SyntaxError::ForVarMismatch, STMT));
                }
                expect_line_end(analyzer, STMT)?;
            }
            TokenKind::LineEnd => {}
            _ => return Err((SyntaxError::ExpectLineEnd, STMT)),
        }
        let Some(Frame::For {
            line,
            control_id,
            variable,
            from,
            to,
            step,
            stmts,
        }) = self.frames.pop()
        else {
            unreachable!("checked above");
        };
        let stmt = Stmt {
            line,
            kind: StmtKind::For {
                control_id,
                variable,
                from,
                to,
                step,
                body: stmts,
            },
        };
        self.frames
            .last_mut()
            .expect("frame stack never empty")
            .stmts_mut()
            .push(stmt);
        Ok(())
    }

    fn parse_break(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Break;
        let Some(loop_id) = self.enclosing_loop() else {
            return Err((SyntaxError::BreakOutsideLoop, STMT));
        };
        expect_line_end(analyzer, STMT)?;
        self.push_stmt(StmtKind::Break { loop_id });
        Ok(())
    }

    fn parse_continue(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Continue;
        let Some(loop_id) = self.enclosing_loop() else {
            return Err((SyntaxError::ContinueOutsideLoop, STMT));
        };
        expect_line_end(analyzer, STMT)?;
        self.push_stmt(StmtKind::Continue { loop_id });
        Ok(())
    }

    fn parse_end(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::End;
        let token = analyzer.next_token();
        match token.keyword() {
            Some(Keyword::If) => {
                if !matches!(self.frames.last(), Some(Frame::If { .. })) {
                    return Err((SyntaxError::EndKeywordNotMatch, STMT));
                }
                expect_line_end(analyzer, STMT)?;
                let frame = self.frames.last_mut().expect("frame stack never empty");
                Self::close_if_branch(frame);
                let Some(Frame::If {
                    line,
                    control_id,
                    condition,
                    then_body,
                    elseifs,
                    else_body,
                    ..
                }) = self.frames.pop()
                else {
                    unreachable!("checked above");
                };
                let stmt = Stmt {
                    line,
                    kind: StmtKind::If {
                        control_id,
                        condition,
                        then_body: then_body.unwrap_or_default(),
                        elseifs,
                        else_body,
                    },
                };
                self.frames
                    .last_mut()
                    .expect("frame stack never empty")
                    .stmts_mut()
                    .push(stmt);
                Ok(())
            }
            Some(Keyword::While) => {
                if !matches!(self.frames.last(), Some(Frame::While { .. })) {
                    return Err((SyntaxError::EndKeywordNotMatch, STMT));
                }
                expect_line_end(analyzer, STMT)?;
                let Some(Frame::While {
                    line,
                    control_id,
                    condition,
                    stmts,
                }) = self.frames.pop()
                else {
                    unreachable!("checked above");
                };
                let stmt = Stmt {
                    line,
                    kind: StmtKind::While {
                        control_id,
                        condition,
                        body: stmts,
                    },
                };
                self.frames
                    .last_mut()
                    .expect("frame stack never empty")
                    .stmts_mut()
                    .push(stmt);
                Ok(())
            }
            Some(Keyword::Func) => {
                if !matches!(self.frames.last(), Some(Frame::Func { .. })) {
                    return Err((SyntaxError::EndKeywordNotMatch, STMT));
                }
                expect_line_end(analyzer, STMT)?;
                let Some(Frame::Func {
                    line,
                    control_id,
                    name,
                    params,
                    stmts,
                }) = self.frames.pop()
                else {
                    unreachable!("checked above");
                };
                let stmt = Stmt {
                    line,
                    kind: StmtKind::FunctionDeclare {
                        control_id,
                        name,
                        params,
                        body: stmts,
                    },
                };
                self.frames
                    .last_mut()
                    .expect("frame stack never empty")
                    .stmts_mut()
                    .push(stmt);
                Ok(())
            }
            _ => Err((SyntaxError::EndKeywordInvalid, STMT)),
        }
    }

    fn parse_exit(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Exit;
        let token = analyzer.next_token();
        let value = if token.kind == TokenKind::LineEnd {
            None
        } else {
            analyzer.rewind_token();
            let expr_start = analyzer.cursor();
            match_valid_expr(analyzer, STMT)?;
            expect_line_end(analyzer, STMT)?;
            analyzer.set_cursor(expr_start);
            Some(build_expr(analyzer))
        };
        self.push_stmt(StmtKind::Exit { value });
        Ok(())
    }

    fn parse_return(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Return;
        if !self.inside_function() {
            return Err((SyntaxError::ReturnOutsideFunc, STMT));
        }
        let token = analyzer.next_token();
        let value = if token.kind == TokenKind::LineEnd {
            None
        } else {
            analyzer.rewind_token();
            let expr_start = analyzer.cursor();
            match_valid_expr(analyzer, STMT)?;
            expect_line_end(analyzer, STMT)?;
            analyzer.set_cursor(expr_start);
            Some(build_expr(analyzer))
        };
        self.push_stmt(StmtKind::Return { value });
        Ok(())
    }

    fn parse_goto(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Goto;
        let label = expect_kind(
            analyzer,
            TokenKind::Identifier,
            SyntaxError::GotoMissingLabel,
            STMT,
        )?
        .content;
        expect_line_end(analyzer, STMT)?;
        self.push_stmt(StmtKind::Goto { label });
        Ok(())
    }

    fn parse_dim(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        let name = expect_kind(
            analyzer,
            TokenKind::Identifier,
            SyntaxError::DimMissingVariable,
            StatementKind::Dim,
        )?
        .content;

        let token = analyzer.next_token();
        if token.kind == TokenKind::LineEnd {
            self.push_stmt(StmtKind::Dim {
                name,
                initializer: None,
            });
            Ok(())
        } else if token.is_operator("=") {
            const STMT: StatementKind = StatementKind::Dim;
            let expr_start = analyzer.cursor();
            match_valid_expr(analyzer, STMT)?;
            expect_line_end(analyzer, STMT)?;
            analyzer.set_cursor(expr_start);
            let initializer = build_expr(analyzer);
            self.push_stmt(StmtKind::Dim {
                name,
                initializer: Some(initializer),
            });
            Ok(())
        } else if token.kind == TokenKind::BracketL {
            const STMT: StatementKind = StatementKind::DimArray;
            let expr_start = analyzer.cursor();
            match_valid_expr(analyzer, STMT)?;
            expect_kind(
                analyzer,
                TokenKind::BracketR,
                SyntaxError::DimArrayMissingBracketR,
                STMT,
            )?;
            expect_line_end(analyzer, STMT)?;
            analyzer.set_cursor(expr_start);
            let dimension = build_expr(analyzer);
            self.push_stmt(StmtKind::DimArray { name, dimension });
            Ok(())
        } else {
            Err((SyntaxError::DimInvalid, StatementKind::Dim))
        }
    }

    fn parse_redim(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Redim;
        let name = expect_kind(
            analyzer,
            TokenKind::Identifier,
            SyntaxError::RedimMissingVariable,
            STMT,
        )?
        .content;
        expect_kind(
            analyzer,
            TokenKind::BracketL,
            SyntaxError::RedimMissingBracketL,
            STMT,
        )?;
        let expr_start = analyzer.cursor();
        match_valid_expr(analyzer, STMT)?;
        expect_kind(
            analyzer,
            TokenKind::BracketR,
            SyntaxError::RedimMissingBracketR,
            STMT,
        )?;
        expect_line_end(analyzer, STMT)?;
        analyzer.set_cursor(expr_start);
        let dimension = build_expr(analyzer);
        self.push_stmt(StmtKind::Redim { name, dimension });
        Ok(())
    }

    /// A line that starts with a plain identifier: label declaration,
    /// assignment, array-element assignment, or a bare expression.
    fn parse_identifier_led(&mut self, analyzer: &mut LineAnalyzer, name: String) -> LineResult {
        let token = analyzer.next_token();
        match token.kind {
            TokenKind::LabelSign => {
                expect_line_end(analyzer, StatementKind::Label)?;
                self.push_stmt(StmtKind::LabelDeclare { name });
                Ok(())
            }
            TokenKind::Operator if token.content == "=" => {
                const STMT: StatementKind = StatementKind::Assign;
                let expr_start = analyzer.cursor();
                match_valid_expr(analyzer, STMT)?;
                expect_line_end(analyzer, STMT)?;
                analyzer.set_cursor(expr_start);
                let value = build_expr(analyzer);
                self.push_stmt(StmtKind::Assign { name, value });
                Ok(())
            }
            TokenKind::BracketL => {
                const STMT: StatementKind = StatementKind::AssignArray;
                // `a[expr] = …` is an element assignment; anything else that
                // starts with `a[` is an expression statement
                let subscript_start = analyzer.cursor();
                if !match_expr(analyzer) {
                    return self.parse_bare_expression(analyzer);
                }
                if analyzer.next_token().kind != TokenKind::BracketR {
                    return self.parse_bare_expression(analyzer);
                }
                if !analyzer.next_token().is_operator("=") {
                    return self.parse_bare_expression(analyzer);
                }
                let value_start = analyzer.cursor();
                match_valid_expr(analyzer, STMT)?;
                expect_line_end(analyzer, STMT)?;
                analyzer.set_cursor(subscript_start);
                let subscript = build_expr(analyzer);
                analyzer.set_cursor(value_start);
                let value = build_expr(analyzer);
                self.push_stmt(StmtKind::AssignArray {
                    name,
                    subscript,
                    value,
                });
                Ok(())
            }
            _ => self.parse_bare_expression(analyzer),
        }
    }

    fn parse_bare_expression(&mut self, analyzer: &mut LineAnalyzer) -> LineResult {
        const STMT: StatementKind = StatementKind::Expr;
        analyzer.reset();
        match_valid_expr(analyzer, STMT)?;
        expect_line_end(analyzer, STMT)?;
        analyzer.reset();
        let expr = build_expr(analyzer);
        self.push_stmt(StmtKind::Expr(expr));
        Ok(())
    }
}

/// Parses full KBasic source into a [`Program`].
///
/// Lines are split on `\n` with trailing whitespace stripped; `;` separates
/// statements within a line and `#` starts a comment.
pub fn parse(source: &str) -> Result<Program, SyntaxErrorReport> {
    let mut parser = SourceParser::new();

    for raw_line in source.split_inclusive('\n') {
        parser.line_number += 1;
        let mut line = raw_line.trim_end();

        loop {
            let mut analyzer = LineAnalyzer::new(line);
            parser
                .parse_statement(&mut analyzer)
                .map_err(|(error, statement)| SyntaxErrorReport {
                    error,
                    statement,
                    line: parser.line_number,
                })?;
            // a `;` hands the rest of the line back to the statement loop
            if analyzer.byte_at_cursor() == b';' {
                line = &line[analyzer.cursor() + 1..];
            } else {
                break;
            }
        }
    }

    if parser.frames.len() != 1 {
        return Err(SyntaxErrorReport {
            error: SyntaxError::UnterminatedFuncOrCtrl,
            statement: StatementKind::None,
            line: parser.line_number,
        });
    }

    let Some(Frame::Program { stmts }) = parser.frames.pop() else {
        unreachable!("bottom frame is the program");
    };
    Ok(Program {
        statements: stmts,
        num_controls: parser.control_counter,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_ok(source: &str) -> Program {
        parse(source).expect("source should parse")
    }

    fn parse_err(source: &str) -> SyntaxErrorReport {
        parse(source).expect_err("source should not parse")
    }

    fn single_expr(source: &str) -> Expr {
        let program = parse_ok(source);
        assert_eq!(program.statements.len(), 1);
        match &program.statements[0].kind {
            StmtKind::Expr(expr) => expr.clone(),
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_shapes_the_tree() {
        // 3 + 4 * 2 keeps the multiplication on the right
        let expr = single_expr("3 + 4 * 2");
        let Expr::Binary { op, left, right } = expr else {
            panic!("expected binary root");
        };
        assert_eq!(op, Operator::Add);
        assert_eq!(*left, Expr::LiteralNumeric(3.0));
        let Expr::Binary { op, .. } = *right else {
            panic!("expected nested binary");
        };
        assert_eq!(op, Operator::Mul);
    }

    #[test]
    fn equal_precedence_associates_left() {
        let expr = single_expr("10 - 4 - 3");
        let Expr::Binary { op, left, right } = expr else {
            panic!("expected binary root");
        };
        assert_eq!(op, Operator::Sub);
        assert_eq!(*right, Expr::LiteralNumeric(3.0));
        assert!(matches!(*left, Expr::Binary { op: Operator::Sub, .. }));
    }

    #[test]
    fn parens_override_precedence() {
        let expr = single_expr("(3 + 4) * 2");
        let Expr::Binary { op, left, .. } = expr else {
            panic!("expected binary root");
        };
        assert_eq!(op, Operator::Mul);
        assert!(matches!(*left, Expr::Paren(_)));
    }

    #[test]
    fn call_arguments_split_at_top_level_commas() {
        let expr = single_expr("f(1 + 2, g(3), x)");
        let Expr::FunctionCall { name, args } = expr else {
            panic!("expected call root");
        };
        assert_eq!(name, "f");
        assert_eq!(args.len(), 3);
        assert!(matches!(args[0], Expr::Binary { op: Operator::Add, .. }));
        assert!(matches!(&args[1], Expr::FunctionCall { name, .. } if name == "g"));
        assert_eq!(args[2], Expr::Variable("x".to_owned()));
    }

    #[test]
    fn array_access_subscript_is_an_expression() {
        let expr = single_expr("a[i + 1]");
        let Expr::ArrayAccess { name, subscript } = expr else {
            panic!("expected array access");
        };
        assert_eq!(name, "a");
        assert!(matches!(*subscript, Expr::Binary { op: Operator::Add, .. }));
    }

    #[test]
    fn deeply_nested_parens_parse() {
        let mut source = String::new();
        source.push_str(&"(".repeat(100));
        source.push('1');
        source.push_str(&")".repeat(100));
        let mut expr = single_expr(&source);
        let mut depth = 0;
        while let Expr::Paren(inner) = expr {
            depth += 1;
            expr = *inner;
        }
        assert_eq!(depth, 100);
        assert_eq!(expr, Expr::LiteralNumeric(1.0));
    }

    #[test]
    fn control_ids_assigned_in_visit_order() {
        let program = parse_ok(
            "func f()\n\
             end func\n\
             if 1\n\
             end if\n\
             while 0\n\
             end while\n",
        );
        let ids: Vec<u32> = program
            .statements
            .iter()
            .map(|stmt| match &stmt.kind {
                StmtKind::FunctionDeclare { control_id, .. }
                | StmtKind::If { control_id, .. }
                | StmtKind::While { control_id, .. } => *control_id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(program.num_controls, 3);
    }

    #[test]
    fn semicolons_separate_statements() {
        let program = parse_ok("dim a = 1; dim b = 2\n");
        assert_eq!(program.statements.len(), 2);
        assert_eq!(program.statements[0].line, 1);
        assert_eq!(program.statements[1].line, 1);
    }

    #[test]
    fn comments_end_the_line() {
        let program = parse_ok("dim a = 1 # trailing words\n# whole line\n");
        assert_eq!(program.statements.len(), 1);
    }

    #[test]
    fn if_elseif_else_structure() {
        let program = parse_ok(
            "dim n = 10\n\
             dim a\n\
             if n > 5\n\
             a = 1\n\
             elseif n > 0\n\
             a = 2\n\
             else\n\
             a = 3\n\
             end if\n",
        );
        let StmtKind::If {
            then_body,
            elseifs,
            else_body,
            ..
        } = &program.statements[2].kind
        else {
            panic!("expected if");
        };
        assert_eq!(then_body.len(), 1);
        assert_eq!(elseifs.len(), 1);
        assert_eq!(else_body.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn break_and_continue_bind_to_nearest_loop() {
        let program = parse_ok(
            "while 1\n\
             for i = 1 to 3\n\
             break\n\
             continue\n\
             next\n\
             end while\n",
        );
        let StmtKind::While { body, control_id, .. } = &program.statements[0].kind else {
            panic!("expected while");
        };
        assert_eq!(*control_id, 1);
        let StmtKind::For { body: for_body, control_id, .. } = &body[0].kind else {
            panic!("expected for");
        };
        assert_eq!(*control_id, 2);
        assert_eq!(for_body[0].kind, StmtKind::Break { loop_id: 2 });
        assert_eq!(for_body[1].kind, StmtKind::Continue { loop_id: 2 });
    }

    #[test]
    fn next_checks_the_loop_variable() {
        let report = parse_err("for i = 1 to 3\nnext j\n");
        assert_eq!(report.error, SyntaxError::ForVarMismatch);
        assert_eq!(report.line, 2);
        assert!(parse("for i = 1 to 3\nnext i\n").is_ok());
    }

    #[test]
    fn func_params_allow_array_markers() {
        let program = parse_ok("func f(a, b[])\nend func\n");
        let StmtKind::FunctionDeclare { params, .. } = &program.statements[0].kind else {
            panic!("expected function");
        };
        assert_eq!(params.len(), 2);
        assert!(!params[0].is_array);
        assert!(params[1].is_array);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert_eq!(parse_err("break\n").error, SyntaxError::BreakOutsideLoop);
        assert_eq!(
            parse_err("continue\n").error,
            SyntaxError::ContinueOutsideLoop
        );
    }

    #[test]
    fn return_outside_function_is_rejected() {
        assert_eq!(parse_err("return 1\n").error, SyntaxError::ReturnOutsideFunc);
    }

    #[test]
    fn end_must_match_the_open_block() {
        let report = parse_err("if 1\nend while\n");
        assert_eq!(report.error, SyntaxError::EndKeywordNotMatch);
        assert_eq!(parse_err("end dim\n").error, SyntaxError::EndKeywordInvalid);
    }

    #[test]
    fn nested_functions_are_rejected() {
        let report = parse_err("func f()\nfunc g()\nend func\nend func\n");
        assert_eq!(report.error, SyntaxError::FuncNested);
        assert_eq!(report.line, 2);
    }

    #[test]
    fn unterminated_block_is_reported_at_the_last_line() {
        let report = parse_err("while 1\ndim x = 2\n");
        assert_eq!(report.error, SyntaxError::UnterminatedFuncOrCtrl);
        assert_eq!(report.line, 2);
    }

    #[test]
    fn invalid_expression_stops_with_line_number() {
        let report = parse_err("dim x = 1\ndim y = 2 +\n");
        assert_eq!(report.error, SyntaxError::ExprInvalid);
        assert_eq!(report.line, 2);
        assert_eq!(report.statement, StatementKind::Dim);
    }

    #[test]
    fn unary_operators_nest() {
        let expr = single_expr("!(1 > 2)");
        assert!(matches!(
            expr,
            Expr::Unary {
                op: Operator::Not,
                ..
            }
        ));
        let expr = single_expr("1 - -2");
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary root");
        };
        assert_eq!(op, Operator::Sub);
        assert!(matches!(
            *right,
            Expr::Unary {
                op: Operator::Neg,
                ..
            }
        ));
    }

    #[test]
    fn assign_array_element() {
        let program = parse_ok("a[0] = 7\n");
        assert!(matches!(
            program.statements[0].kind,
            StmtKind::AssignArray { .. }
        ));
    }

    #[test]
    fn label_declaration() {
        let program = parse_ok("start:\ngoto start\n");
        assert_eq!(
            program.statements[0].kind,
            StmtKind::LabelDeclare {
                name: "start".to_owned()
            }
        );
        assert_eq!(
            program.statements[1].kind,
            StmtKind::Goto {
                label: "start".to_owned()
            }
        );
    }

    #[test]
    fn do_while_loop() {
        let program = parse_ok("dim i = 0\ndo\ni = i + 1\nwhile i < 3\n");
        assert!(matches!(
            program.statements[1].kind,
            StmtKind::DoWhile { .. }
        ));
    }
}
