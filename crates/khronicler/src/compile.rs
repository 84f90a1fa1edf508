//! Two-pass compiler from the AST to a linear opcode stream.
//!
//! Pass one collects function declarations, goto labels and a label bundle
//! for every control-flow construct (indexed by the parser's control id).
//! Pass two walks the statements depth-first and appends opcodes, binding
//! label positions as it goes. Jump opcodes emitted before their target is
//! known carry the index of a label-position record; a final pass copies
//! the bound positions into the opcode payloads.

use indexmap::IndexMap;
use strum::IntoStaticStr;

use crate::{
    ast::{ControlId, Expr, Operator, Program, Stmt, StmtKind},
    builtins::Builtin,
    intern::StringPool,
    op::{JumpTarget, Op, VarAccess},
};

/// Longest identifier that fits the binary image's fixed-length name fields.
pub const IDENTIFIER_LEN_MAX: usize = 15;

/// Semantic error categories, raised against a specific statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SemanticError {
    UnrecognizedAst,
    NotAProgram,
    VarNameTooLong,
    VarDuplicated,
    VarNotFound,
    VarIsNotArray,
    VarIsNotPrimitive,
    FuncNameTooLong,
    FuncDuplicated,
    FuncNotFound,
    FuncArgListMismatch,
    LabelNameTooLong,
    LabelDuplicated,
    GotoLabelNotFound,
    GotoLabelScopeMismatch,
    StrPoolExceed,
}

impl SemanticError {
    pub fn message(self) -> &'static str {
        match self {
            Self::UnrecognizedAst => "Unrecognized abstract syntax tree node",
            Self::NotAProgram => "Input is not a valid KBasic program",
            Self::VarNameTooLong => "Variable name is too long",
            Self::VarDuplicated => "Duplicate variable declaration",
            Self::VarNotFound => "Undefined variable",
            Self::VarIsNotArray => "Variable is not an array",
            Self::VarIsNotPrimitive => "Variable is not a primitive type",
            Self::FuncNameTooLong => "Function name is too long",
            Self::FuncDuplicated => "Duplicate function definition",
            Self::FuncNotFound => "Undefined function",
            Self::FuncArgListMismatch => "Argument count mismatch in call to function",
            Self::LabelNameTooLong => "Label name is too long",
            Self::LabelDuplicated => "Duplicate label definition",
            Self::GotoLabelNotFound => "Undefined label",
            Self::GotoLabelScopeMismatch => "Cannot jump to label across function boundaries",
            Self::StrPoolExceed => "String constant pool capacity exceeded",
        }
    }
}

impl std::fmt::Display for SemanticError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// A semantic error with the source line of the statement it stopped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemanticErrorReport {
    pub error: SemanticError,
    pub line: u32,
}

impl std::fmt::Display for SemanticErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.error.message())
    }
}

impl std::error::Error for SemanticErrorReport {}

/// A declared variable and its allocated slot.
#[derive(Debug, Clone, Copy)]
struct VarDecl {
    index: u32,
    is_array: bool,
}

#[derive(Debug)]
struct FuncBuild {
    num_params: u32,
    locals: IndexMap<String, VarDecl>,
    opcode_start: u32,
}

/// A user function as recorded in the compiled program and the image's
/// function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncInfo {
    pub name: String,
    pub num_params: u32,
    /// Locals including parameters; the VM sizes call frames from this.
    pub num_locals: u32,
    pub opcode_start: u32,
}

/// A host-provided extension function stub carried through to the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtFunction {
    pub call_id: u32,
    pub name: String,
    pub num_params: u32,
}

/// Result of compilation, ready for serialization.
#[derive(Debug)]
pub struct CompiledProgram {
    pub num_globals: u32,
    pub funcs: Vec<FuncInfo>,
    pub ops: Vec<Op>,
    pub pool: Vec<u8>,
    pub extension_id: String,
    pub ext_funcs: Vec<ExtFunction>,
}

impl CompiledProgram {
    /// Installs the extension identifier and its function stubs. The id is
    /// truncated to the identifier budget like every serialized name.
    pub fn set_extension(&mut self, id: &str, stubs: Vec<ExtFunction>) {
        let mut id = id.to_owned();
        id.truncate(IDENTIFIER_LEN_MAX);
        self.extension_id = id;
        self.ext_funcs = stubs;
    }
}

/// Position slots that belong to one control-flow construct.
#[derive(Debug)]
enum ControlBundle {
    Function { end: usize },
    If { then_end: usize, elseif_ends: Vec<usize>, end: usize },
    While { cond: usize, end: usize },
    DoWhile { start: usize, cond: usize, end: usize },
    For { cond: usize, increase: usize, end: usize },
}

#[derive(Debug)]
struct GotoLabel {
    slot: usize,
    /// Function scope the label was declared in, `None` at module level.
    scope: Option<usize>,
}

struct Compiler {
    globals: IndexMap<String, VarDecl>,
    funcs: IndexMap<String, FuncBuild>,
    labels: IndexMap<String, GotoLabel>,
    /// Backing store for every label slot; `-1` means unbound.
    label_positions: Vec<i32>,
    bundles: Vec<Option<ControlBundle>>,
    ops: Vec<Op>,
    pool: StringPool,
    current_func: Option<usize>,
}

type StmtResult = Result<(), SemanticErrorReport>;

fn stmt_error(error: SemanticError, stmt: &Stmt) -> SemanticErrorReport {
    SemanticErrorReport {
        error,
        line: stmt.line,
    }
}

impl Compiler {
    fn new(program: &Program) -> Self {
        Self {
            globals: IndexMap::new(),
            funcs: IndexMap::new(),
            labels: IndexMap::new(),
            label_positions: Vec::new(),
            bundles: (0..program.num_controls).map(|_| None).collect(),
            ops: Vec::new(),
            pool: StringPool::new(),
            current_func: None,
        }
    }

    fn new_slot(&mut self) -> usize {
        self.label_positions.push(-1);
        self.label_positions.len() - 1
    }

    /// Binds a label slot to the current end of the opcode list.
    fn bind(&mut self, slot: usize) {
        self.label_positions[slot] = self.ops.len() as i32;
    }

    fn current_pos(&self) -> u32 {
        self.ops.len() as u32
    }

    fn bundle(&self, control_id: ControlId) -> &ControlBundle {
        self.bundles[(control_id - 1) as usize]
            .as_ref()
            .expect("bundle initialized during the scan pass")
    }

    /// Resolves a variable reference: the current function's locals first,
    /// then the globals.
    fn resolve_var(&self, name: &str) -> Option<(bool, VarDecl)> {
        if let Some(func_index) = self.current_func {
            let (_, func) = self.funcs.get_index(func_index).expect("current function exists");
            if let Some(decl) = func.locals.get(name) {
                return Some((true, *decl));
            }
        }
        self.globals.get(name).map(|decl| (false, *decl))
    }

    fn scope_mut(&mut self) -> &mut IndexMap<String, VarDecl> {
        match self.current_func {
            Some(func_index) => {
                let (_, func) = self
                    .funcs
                    .get_index_mut(func_index)
                    .expect("current function exists");
                &mut func.locals
            }
            None => &mut self.globals,
        }
    }

    /// Declares a variable in the current scope.
    fn declare_var(&mut self, name: &str, is_array: bool) -> Result<VarAccess, SemanticError> {
        if name.len() > IDENTIFIER_LEN_MAX {
            return Err(SemanticError::VarNameTooLong);
        }
        let is_local = self.current_func.is_some();
        let scope = self.scope_mut();
        if scope.contains_key(name) {
            return Err(SemanticError::VarDuplicated);
        }
        let decl = VarDecl {
            index: scope.len() as u32,
            is_array,
        };
        scope.insert(name.to_owned(), decl);
        Ok(VarAccess {
            is_local,
            index: decl.index,
        })
    }

    /// Declares an array, or retypes a primitive already declared in the
    /// same scope (`dim a` followed by `dim a[n]` is legal; a second array
    /// declaration is a duplicate).
    fn declare_array(&mut self, name: &str) -> Result<VarAccess, SemanticError> {
        if name.len() > IDENTIFIER_LEN_MAX {
            return Err(SemanticError::VarNameTooLong);
        }
        let is_local = self.current_func.is_some();
        let scope = self.scope_mut();
        if let Some(decl) = scope.get_mut(name) {
            if decl.is_array {
                return Err(SemanticError::VarDuplicated);
            }
            decl.is_array = true;
            let index = decl.index;
            return Ok(VarAccess { is_local, index });
        }
        self.declare_var(name, true)
    }

    // -----------------------------------------------------------------
    // Pass 1: declarations, labels and control bundles
    // -----------------------------------------------------------------

    fn scan_functions(&mut self, program: &Program) -> StmtResult {
        for stmt in &program.statements {
            let StmtKind::FunctionDeclare { name, params, .. } = &stmt.kind else {
                continue;
            };
            if name.len() > IDENTIFIER_LEN_MAX {
                return Err(stmt_error(SemanticError::FuncNameTooLong, stmt));
            }
            if self.funcs.contains_key(name) {
                return Err(stmt_error(SemanticError::FuncDuplicated, stmt));
            }
            self.funcs.insert(
                name.clone(),
                FuncBuild {
                    num_params: params.len() as u32,
                    locals: IndexMap::new(),
                    opcode_start: 0,
                },
            );
        }
        Ok(())
    }

    fn init_bundle(&mut self, control_id: ControlId, bundle: ControlBundle) {
        self.bundles[(control_id - 1) as usize] = Some(bundle);
    }

    fn scan_labels(&mut self, statements: &[Stmt]) -> StmtResult {
        for stmt in statements {
            match &stmt.kind {
                StmtKind::LabelDeclare { name } => {
                    if name.len() > IDENTIFIER_LEN_MAX {
                        return Err(stmt_error(SemanticError::LabelNameTooLong, stmt));
                    }
                    if self.labels.contains_key(name) {
                        return Err(stmt_error(SemanticError::LabelDuplicated, stmt));
                    }
                    let slot = self.new_slot();
                    let scope = self.current_func;
                    self.labels.insert(name.clone(), GotoLabel { slot, scope });
                }
                StmtKind::FunctionDeclare { control_id, name, body, .. } => {
                    let end = self.new_slot();
                    self.init_bundle(*control_id, ControlBundle::Function { end });
                    self.current_func = self.funcs.get_index_of(name.as_str());
                    self.scan_labels(body)?;
                    self.current_func = None;
                }
                StmtKind::If {
                    control_id,
                    then_body,
                    elseifs,
                    else_body,
                    ..
                } => {
                    let then_end = self.new_slot();
                    let elseif_ends = (0..elseifs.len()).map(|_| self.new_slot()).collect();
                    let end = self.new_slot();
                    self.init_bundle(
                        *control_id,
                        ControlBundle::If {
                            then_end,
                            elseif_ends,
                            end,
                        },
                    );
                    self.scan_labels(then_body)?;
                    for arm in elseifs {
                        self.scan_labels(&arm.body)?;
                    }
                    if let Some(else_body) = else_body {
                        self.scan_labels(else_body)?;
                    }
                }
                StmtKind::While { control_id, body, .. } => {
                    let cond = self.new_slot();
                    let end = self.new_slot();
                    self.init_bundle(*control_id, ControlBundle::While { cond, end });
                    self.scan_labels(body)?;
                }
                StmtKind::DoWhile { control_id, body, .. } => {
                    let start = self.new_slot();
                    let cond = self.new_slot();
                    let end = self.new_slot();
                    self.init_bundle(*control_id, ControlBundle::DoWhile { start, cond, end });
                    self.scan_labels(body)?;
                }
                StmtKind::For { control_id, body, .. } => {
                    let cond = self.new_slot();
                    let increase = self.new_slot();
                    let end = self.new_slot();
                    self.init_bundle(*control_id, ControlBundle::For { cond, increase, end });
                    self.scan_labels(body)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pass 2: emission
    // -----------------------------------------------------------------

    fn build_expression(&mut self, expr: &Expr) -> Result<(), SemanticError> {
        match expr {
            Expr::LiteralNumeric(value) => {
                self.ops.push(Op::PushNum(*value));
            }
            Expr::LiteralString(text) => {
                let offset = self
                    .pool
                    .append(text)
                    .map_err(|_| SemanticError::StrPoolExceed)?;
                self.ops.push(Op::PushStr(offset));
            }
            Expr::Variable(name) => {
                let (is_local, decl) =
                    self.resolve_var(name).ok_or(SemanticError::VarNotFound)?;
                self.ops.push(Op::PushVar(VarAccess {
                    is_local,
                    index: decl.index,
                }));
            }
            Expr::Paren(inner) => {
                self.build_expression(inner)?;
            }
            Expr::Unary { op, operand } => {
                self.build_expression(operand)?;
                self.ops.push(Op::UnaryOp(*op as u32));
            }
            Expr::Binary { op, left, right } => {
                self.build_expression(left)?;
                self.build_expression(right)?;
                self.ops.push(Op::BinaryOp(*op as u32));
            }
            Expr::ArrayAccess { name, subscript } => {
                let (is_local, decl) =
                    self.resolve_var(name).ok_or(SemanticError::VarNotFound)?;
                if !decl.is_array {
                    return Err(SemanticError::VarIsNotArray);
                }
                self.build_expression(subscript)?;
                self.ops.push(Op::ArrGet(VarAccess {
                    is_local,
                    index: decl.index,
                }));
            }
            Expr::FunctionCall { name, args } => {
                // user functions shadow built-ins
                let user = self.funcs.get_index_of(name.as_str());
                match user {
                    Some(func_index) => {
                        let (_, func) = self.funcs.get_index(func_index).expect("index from lookup");
                        if args.len() as u32 != func.num_params {
                            return Err(SemanticError::FuncArgListMismatch);
                        }
                        for arg in args {
                            self.build_expression(arg)?;
                        }
                        self.ops.push(Op::CallFunc(func_index as u32));
                    }
                    None => {
                        let builtin =
                            Builtin::lookup(name).ok_or(SemanticError::FuncNotFound)?;
                        if args.len() != builtin.arity() {
                            return Err(SemanticError::FuncArgListMismatch);
                        }
                        for arg in args {
                            self.build_expression(arg)?;
                        }
                        self.ops.push(Op::CallBuiltIn(builtin as u32));
                    }
                }
            }
        }
        Ok(())
    }

    fn build_expr_in_stmt(&mut self, expr: &Expr, stmt: &Stmt) -> StmtResult {
        self.build_expression(expr)
            .map_err(|error| stmt_error(error, stmt))
    }

    fn lookup_goto_label(&self, name: &str, stmt: &Stmt) -> Result<usize, SemanticErrorReport> {
        let label = self
            .labels
            .get(name)
            .ok_or_else(|| stmt_error(SemanticError::GotoLabelNotFound, stmt))?;
        if label.scope != self.current_func {
            return Err(stmt_error(SemanticError::GotoLabelScopeMismatch, stmt));
        }
        Ok(label.slot)
    }

    fn build_statements(&mut self, statements: &[Stmt]) -> StmtResult {
        for stmt in statements {
            match &stmt.kind {
                StmtKind::FunctionDeclare {
                    control_id,
                    name,
                    params,
                    body,
                } => {
                    let ControlBundle::Function { end } = self.bundle(*control_id) else {
                        unreachable!("function bundle for function control id");
                    };
                    let end = *end;
                    let func_index = self
                        .funcs
                        .get_index_of(name.as_str())
                        .expect("function recorded during the scan pass");
                    self.current_func = Some(func_index);
                    // skip over the body in straight-line execution
                    self.ops.push(Op::Goto(JumpTarget::Slot(end as u32)));
                    let start = self.current_pos();
                    self.funcs[func_index].opcode_start = start;
                    for param in params {
                        self.declare_var(&param.name, param.is_array)
                            .map_err(|error| stmt_error(error, stmt))?;
                    }
                    self.build_statements(body)?;
                    if !matches!(self.ops.last(), Some(Op::Return)) {
                        self.ops.push(Op::PushNum(0.0));
                        self.ops.push(Op::Return);
                    }
                    self.current_func = None;
                    self.bind(end);
                }
                StmtKind::IfGoto { condition, label } => {
                    let slot = self.lookup_goto_label(label, stmt)?;
                    self.build_expr_in_stmt(condition, stmt)?;
                    self.ops.push(Op::IfGoto(JumpTarget::Slot(slot as u32)));
                }
                StmtKind::If {
                    control_id,
                    condition,
                    then_body,
                    elseifs,
                    else_body,
                } => {
                    let ControlBundle::If {
                        then_end,
                        elseif_ends,
                        end,
                    } = self.bundle(*control_id)
                    else {
                        unreachable!("if bundle for if control id");
                    };
                    let (then_end, elseif_ends, end) = (*then_end, elseif_ends.clone(), *end);

                    self.build_expr_in_stmt(condition, stmt)?;
                    self.ops.push(Op::UnlessGoto(JumpTarget::Slot(then_end as u32)));
                    self.build_statements(then_body)?;
                    self.ops.push(Op::Goto(JumpTarget::Slot(end as u32)));
                    self.bind(then_end);

                    for (arm, arm_end) in elseifs.iter().zip(elseif_ends) {
                        self.build_expr_in_stmt(&arm.condition, stmt)?;
                        self.ops.push(Op::UnlessGoto(JumpTarget::Slot(arm_end as u32)));
                        self.build_statements(&arm.body)?;
                        self.ops.push(Op::Goto(JumpTarget::Slot(end as u32)));
                        self.bind(arm_end);
                    }

                    if let Some(else_body) = else_body {
                        self.build_statements(else_body)?;
                    }
                    self.bind(end);
                }
                StmtKind::While {
                    control_id,
                    condition,
                    body,
                } => {
                    let ControlBundle::While { cond, end } = self.bundle(*control_id) else {
                        unreachable!("while bundle for while control id");
                    };
                    let (cond, end) = (*cond, *end);
                    self.bind(cond);
                    self.build_expr_in_stmt(condition, stmt)?;
                    self.ops.push(Op::UnlessGoto(JumpTarget::Slot(end as u32)));
                    self.build_statements(body)?;
                    self.ops.push(Op::Goto(JumpTarget::Slot(cond as u32)));
                    self.bind(end);
                }
                StmtKind::DoWhile {
                    control_id,
                    condition,
                    body,
                } => {
                    let ControlBundle::DoWhile { start, cond, end } = self.bundle(*control_id)
                    else {
                        unreachable!("do-while bundle for do-while control id");
                    };
                    let (start, cond, end) = (*start, *cond, *end);
                    self.bind(start);
                    self.build_statements(body)?;
                    self.bind(cond);
                    self.build_expr_in_stmt(condition, stmt)?;
                    self.ops.push(Op::IfGoto(JumpTarget::Slot(start as u32)));
                    self.bind(end);
                }
                StmtKind::For {
                    control_id,
                    variable,
                    from,
                    to,
                    step,
                    body,
                } => {
                    let ControlBundle::For { cond, increase, end } = self.bundle(*control_id)
                    else {
                        unreachable!("for bundle for for control id");
                    };
                    let (cond, increase, end) = (*cond, *increase, *end);

                    // a loop variable that was never declared is created in
                    // the current scope
                    let access = match self.resolve_var(variable) {
                        Some((_, decl)) if decl.is_array => {
                            return Err(stmt_error(SemanticError::VarIsNotPrimitive, stmt));
                        }
                        Some((is_local, decl)) => VarAccess {
                            is_local,
                            index: decl.index,
                        },
                        None => self
                            .declare_var(variable, false)
                            .map_err(|error| stmt_error(error, stmt))?,
                    };

                    self.build_expr_in_stmt(from, stmt)?;
                    self.ops.push(Op::SetVar(access));
                    self.bind(cond);
                    self.build_expr_in_stmt(to, stmt)?;
                    self.ops.push(Op::PushVar(access));
                    self.ops.push(Op::BinaryOp(Operator::Gteq as u32));
                    self.ops.push(Op::UnlessGoto(JumpTarget::Slot(end as u32)));
                    self.build_statements(body)?;
                    self.bind(increase);
                    match step {
                        Some(step) => self.build_expr_in_stmt(step, stmt)?,
                        None => self.ops.push(Op::PushNum(1.0)),
                    }
                    self.ops.push(Op::PushVar(access));
                    self.ops.push(Op::BinaryOp(Operator::Add as u32));
                    self.ops.push(Op::SetVar(access));
                    self.ops.push(Op::Goto(JumpTarget::Slot(cond as u32)));
                    self.bind(end);
                }
                StmtKind::Break { loop_id } => {
                    let slot = match self.bundle(*loop_id) {
                        ControlBundle::While { end, .. }
                        | ControlBundle::DoWhile { end, .. }
                        | ControlBundle::For { end, .. } => *end,
                        _ => unreachable!("break targets a loop bundle"),
                    };
                    self.ops.push(Op::Goto(JumpTarget::Slot(slot as u32)));
                }
                StmtKind::Continue { loop_id } => {
                    let slot = match self.bundle(*loop_id) {
                        ControlBundle::While { cond, .. }
                        | ControlBundle::DoWhile { cond, .. } => *cond,
                        ControlBundle::For { increase, .. } => *increase,
                        _ => unreachable!("continue targets a loop bundle"),
                    };
                    self.ops.push(Op::Goto(JumpTarget::Slot(slot as u32)));
                }
                StmtKind::Exit { value } => {
                    match value {
                        Some(expr) => self.build_expr_in_stmt(expr, stmt)?,
                        None => self.ops.push(Op::PushNum(0.0)),
                    }
                    self.ops.push(Op::Stop);
                }
                StmtKind::Return { value } => {
                    match value {
                        Some(expr) => self.build_expr_in_stmt(expr, stmt)?,
                        None => self.ops.push(Op::PushNum(0.0)),
                    }
                    self.ops.push(Op::Return);
                }
                StmtKind::Goto { label } => {
                    let slot = self.lookup_goto_label(label, stmt)?;
                    self.ops.push(Op::Goto(JumpTarget::Slot(slot as u32)));
                }
                StmtKind::Dim { name, initializer } => {
                    let access = self
                        .declare_var(name, false)
                        .map_err(|error| stmt_error(error, stmt))?;
                    if let Some(initializer) = initializer {
                        self.build_expr_in_stmt(initializer, stmt)?;
                        self.ops.push(Op::SetVar(access));
                    }
                }
                StmtKind::DimArray { name, dimension } => {
                    let access = self
                        .declare_array(name)
                        .map_err(|error| stmt_error(error, stmt))?;
                    self.build_expr_in_stmt(dimension, stmt)?;
                    self.ops.push(Op::SetVarAsArray(access));
                }
                StmtKind::Redim { name, dimension } => {
                    let (is_local, decl) = self
                        .resolve_var(name)
                        .ok_or_else(|| stmt_error(SemanticError::VarNotFound, stmt))?;
                    if !decl.is_array {
                        return Err(stmt_error(SemanticError::VarIsNotArray, stmt));
                    }
                    self.build_expr_in_stmt(dimension, stmt)?;
                    self.ops.push(Op::SetVarAsArray(VarAccess {
                        is_local,
                        index: decl.index,
                    }));
                }
                StmtKind::Assign { name, value } => {
                    let (is_local, decl) = self
                        .resolve_var(name)
                        .ok_or_else(|| stmt_error(SemanticError::VarNotFound, stmt))?;
                    if decl.is_array {
                        return Err(stmt_error(SemanticError::VarIsNotPrimitive, stmt));
                    }
                    self.build_expr_in_stmt(value, stmt)?;
                    self.ops.push(Op::SetVar(VarAccess {
                        is_local,
                        index: decl.index,
                    }));
                }
                StmtKind::AssignArray {
                    name,
                    subscript,
                    value,
                } => {
                    let (is_local, decl) = self
                        .resolve_var(name)
                        .ok_or_else(|| stmt_error(SemanticError::VarNotFound, stmt))?;
                    if !decl.is_array {
                        return Err(stmt_error(SemanticError::VarIsNotArray, stmt));
                    }
                    self.build_expr_in_stmt(subscript, stmt)?;
                    self.build_expr_in_stmt(value, stmt)?;
                    self.ops.push(Op::ArrSet(VarAccess {
                        is_local,
                        index: decl.index,
                    }));
                }
                StmtKind::LabelDeclare { name } => {
                    let slot = self
                        .labels
                        .get(name)
                        .expect("label recorded during the scan pass")
                        .slot;
                    self.bind(slot);
                }
                StmtKind::Expr(expr) => {
                    self.build_expr_in_stmt(expr, stmt)?;
                    // discard the leftover stack top
                    self.ops.push(Op::Pop);
                }
            }
        }
        Ok(())
    }

    /// Replaces every label-slot jump parameter with its bound position.
    fn resolve_jumps(&mut self) {
        for op in &mut self.ops {
            let (Op::Goto(target) | Op::IfGoto(target) | Op::UnlessGoto(target)) = op else {
                continue;
            };
            if let JumpTarget::Slot(slot) = *target {
                let pos = self.label_positions[slot as usize];
                debug_assert!(pos >= 0, "label slot {slot} never bound");
                *target = JumpTarget::Pos(pos as u32);
            }
        }
    }
}

/// Compiles a parsed program into an opcode stream, string pool and
/// function table.
pub fn compile(program: &Program) -> Result<CompiledProgram, SemanticErrorReport> {
    let mut compiler = Compiler::new(program);

    compiler.scan_functions(program)?;
    compiler.scan_labels(&program.statements)?;
    compiler.build_statements(&program.statements)?;

    // implicit `exit 0` at the end of the module
    compiler.ops.push(Op::PushNum(0.0));
    compiler.ops.push(Op::Stop);

    compiler.resolve_jumps();

    let funcs = compiler
        .funcs
        .into_iter()
        .map(|(name, func)| FuncInfo {
            name,
            num_params: func.num_params,
            num_locals: func.locals.len() as u32,
            opcode_start: func.opcode_start,
        })
        .collect();

    Ok(CompiledProgram {
        num_globals: compiler.globals.len() as u32,
        funcs,
        ops: compiler.ops,
        pool: compiler.pool.into_bytes(),
        extension_id: String::new(),
        ext_funcs: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{op::OpId, parse::parse};

    fn compile_source(source: &str) -> CompiledProgram {
        compile(&parse(source).expect("parses")).expect("compiles")
    }

    fn compile_error(source: &str) -> SemanticErrorReport {
        compile(&parse(source).expect("parses")).expect_err("should not compile")
    }

    #[test]
    fn trailing_stop_is_appended() {
        let compiled = compile_source("dim x = 1\n");
        let ids: Vec<OpId> = compiled.ops.iter().map(Op::id).collect();
        assert_eq!(
            ids,
            vec![OpId::PushNum, OpId::SetVar, OpId::PushNum, OpId::Stop]
        );
    }

    #[test]
    fn every_jump_is_resolved_within_bounds() {
        let compiled = compile_source(
            "dim i = 0\n\
             while i < 3\n\
             if i = 1\n\
             i = i + 2\n\
             elseif i = 0\n\
             i = i + 1\n\
             else\n\
             break\n\
             end if\n\
             end while\n\
             exit i\n",
        );
        let count = compiled.ops.len() as u32;
        for op in &compiled.ops {
            if let Op::Goto(target) | Op::IfGoto(target) | Op::UnlessGoto(target) = op {
                let pos = target.pos();
                assert!(pos <= count, "jump target {pos} out of range {count}");
            }
        }
    }

    #[test]
    fn string_pool_offsets_are_monotonic() {
        let compiled = compile_source("dim a = \"xx\"\ndim b = \"yy\"\ndim c = \"xx\"\n");
        let offsets: Vec<u32> = compiled
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::PushStr(offset) => Some(*offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 3, 6]);
        assert_eq!(compiled.pool.len(), 9);
    }

    #[test]
    fn locals_shadow_globals() {
        let compiled = compile_source(
            "dim x = 1\n\
             func f(x)\n\
             return x\n\
             end func\n\
             dim y = f(2)\n",
        );
        // the `return x` must read the local parameter, not the global
        let reads: Vec<&Op> = compiled
            .ops
            .iter()
            .filter(|op| matches!(op, Op::PushVar(access) if access.is_local))
            .collect();
        assert_eq!(reads.len(), 1);
    }

    #[test]
    fn function_records_count_params_and_locals() {
        let compiled = compile_source(
            "func add(a, b)\n\
             dim total = a + b\n\
             return total\n\
             end func\n",
        );
        assert_eq!(compiled.funcs.len(), 1);
        let func = &compiled.funcs[0];
        assert_eq!(func.name, "add");
        assert_eq!(func.num_params, 2);
        assert_eq!(func.num_locals, 3);
        // entry point is right after the skip-over goto
        assert_eq!(func.opcode_start, 1);
    }

    #[test]
    fn function_without_return_gets_one() {
        let compiled = compile_source("func f()\ndim x = 1\nend func\n");
        let ids: Vec<OpId> = compiled.ops.iter().map(Op::id).collect();
        assert_eq!(ids[3], OpId::PushNum);
        assert_eq!(ids[4], OpId::Return);
    }

    #[test]
    fn undefined_variable_is_reported_with_line() {
        let report = compile_error("dim a = 1\ndim b = missing\n");
        assert_eq!(report.error, SemanticError::VarNotFound);
        assert_eq!(report.line, 2);
    }

    #[test]
    fn duplicate_variable_in_scope() {
        assert_eq!(
            compile_error("dim a\ndim a\n").error,
            SemanticError::VarDuplicated
        );
        // a local may reuse a global name
        assert!(
            compile(&parse("dim a\nfunc f()\ndim a\nreturn a\nend func\n").unwrap()).is_ok()
        );
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let report = compile_error("func f(x)\nreturn x\nend func\ndim a = f(1, 2)\n");
        assert_eq!(report.error, SemanticError::FuncArgListMismatch);
        let report = compile_error("dim a = sin(1, 2)\n");
        assert_eq!(report.error, SemanticError::FuncArgListMismatch);
    }

    #[test]
    fn unknown_function_is_reported() {
        assert_eq!(
            compile_error("dim a = nosuch(1)\n").error,
            SemanticError::FuncNotFound
        );
    }

    #[test]
    fn subscripting_a_plain_variable_fails() {
        assert_eq!(
            compile_error("dim a\ndim b = a[0]\n").error,
            SemanticError::VarIsNotArray
        );
        assert_eq!(
            compile_error("dim a\na[0] = 1\n").error,
            SemanticError::VarIsNotArray
        );
    }

    #[test]
    fn for_loop_declares_its_variable_when_missing() {
        let compiled = compile_source("for k = 1 to 3\nnext\nexit k\n");
        assert_eq!(compiled.num_globals, 1);
        // an existing variable is reused, not redeclared
        let compiled = compile_source("dim k = 9\nfor k = 1 to 3\nnext\nexit k\n");
        assert_eq!(compiled.num_globals, 1);
    }

    #[test]
    fn dim_array_retypes_an_existing_primitive() {
        let compiled = compile_source("dim a\ndim a[10]\nexit 0\n");
        assert_eq!(compiled.num_globals, 1);
        // a second array declaration is still a duplicate
        assert_eq!(
            compile_error("dim a[3]\ndim a[4]\n").error,
            SemanticError::VarDuplicated
        );
    }

    #[test]
    fn for_variable_must_be_primitive() {
        assert_eq!(
            compile_error("dim a[3]\nfor a = 1 to 2\nnext\n").error,
            SemanticError::VarIsNotPrimitive
        );
    }

    #[test]
    fn goto_scope_rules() {
        // label inside the same function: fine
        assert!(
            compile(
                &parse("func f()\nlbl:\ngoto lbl\nreturn 0\nend func\n").unwrap()
            )
            .is_ok()
        );
        // goto from a function to a module-level label: scope mismatch
        let report = compile_error("top:\nfunc f()\ngoto top\nend func\n");
        assert_eq!(report.error, SemanticError::GotoLabelScopeMismatch);
        // unknown label
        assert_eq!(
            compile_error("goto nowhere\n").error,
            SemanticError::GotoLabelNotFound
        );
    }

    #[test]
    fn duplicate_label_is_reported() {
        assert_eq!(
            compile_error("a:\na:\n").error,
            SemanticError::LabelDuplicated
        );
    }

    #[test]
    fn long_names_overflow_the_identifier_budget() {
        let long = "x".repeat(IDENTIFIER_LEN_MAX + 1);
        assert_eq!(
            compile_error(&format!("dim {long}\n")).error,
            SemanticError::VarNameTooLong
        );
        assert_eq!(
            compile_error(&format!("func {long}()\nend func\n")).error,
            SemanticError::FuncNameTooLong
        );
        assert_eq!(
            compile_error(&format!("{long}:\n")).error,
            SemanticError::LabelNameTooLong
        );
    }

    #[test]
    fn string_pool_overflow_is_reported() {
        let mut source = String::new();
        // each literal takes 130 pool bytes; 33 of them exceed 4096
        for index in 0..33 {
            let chunk = format!("{index:03}").repeat(43);
            source.push_str(&format!("dim s{index} = \"{chunk}\"\n"));
        }
        let report = compile_error(&source);
        assert_eq!(report.error, SemanticError::StrPoolExceed);
    }

    #[test]
    fn bare_expression_is_popped() {
        let compiled = compile_source("p(\"hi\")\n");
        let ids: Vec<OpId> = compiled.ops.iter().map(Op::id).collect();
        assert_eq!(
            ids,
            vec![
                OpId::PushStr,
                OpId::CallBuiltIn,
                OpId::Pop,
                OpId::PushNum,
                OpId::Stop
            ]
        );
    }

    #[test]
    fn extension_stubs_are_carried() {
        let mut compiled = compile_source("exit 0\n");
        compiled.set_extension(
            "demo_ext",
            vec![ExtFunction {
                call_id: 7,
                name: "blit".to_owned(),
                num_params: 2,
            }],
        );
        assert_eq!(compiled.extension_id, "demo_ext");
        assert_eq!(compiled.ext_funcs.len(), 1);
    }
}
