//! Bytecode emitter: lowers the syntax tree into `CodeObject`s.
//!
//! Compilation runs single-pass with jump patching. A stack of function
//! compilers mirrors lexical nesting; resolving a name walks that stack and
//! records upvalue descriptors for captures. The top level compiles as a
//! zero-parameter function whose plain names are all globals; inside
//! functions, locals are block-scoped slots.

use std::rc::Rc;

use thiserror::Error;

use crate::ast::{
    ArrowBody, BinaryOp, Expr, ExprKind, LogicalOp, Program, SceneElement, Stmt, StmtKind, UnaryOp,
};
use crate::bytecode::{CodeObject, Constant, Op, UpvalueDesc};
use crate::token::Span;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EmitError {
    #[error("'break' outside of a loop at {span}")]
    BreakOutsideLoop { span: Span },
    #[error("'continue' outside of a loop at {span}")]
    ContinueOutsideLoop { span: Span },
    #[error("'this' outside of a method at {span}")]
    ThisOutsideMethod { span: Span },
    #[error("'super' outside of a class at {span}")]
    SuperOutsideClass { span: Span },
    #[error("'super' in a class with no base class at {span}")]
    SuperWithoutBase { span: Span },
    #[error("Too many constants in one function at {span}")]
    TooManyConstants { span: Span },
    #[error("Too many local variables in one function at {span}")]
    TooManyLocals { span: Span },
    #[error("Too many captured variables in one function at {span}")]
    TooManyUpvalues { span: Span },
    #[error("Too many arguments at {span}")]
    TooManyArguments { span: Span },
    #[error("Too many elements in literal at {span}")]
    LiteralTooLarge { span: Span },
}

pub type EmitResult<T> = Result<T, EmitError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
}

struct Local {
    name: String,
    depth: usize,
    slot: u8,
}

struct LoopCtx {
    /// Jump target for `continue`.
    start: usize,
    /// Placeholder jump positions patched to the loop exit.
    breaks: Vec<usize>,
    /// `tries` height when the loop began; early exits unwind down to it.
    try_depth: usize,
    /// `for` loops keep their iterator on the operand stack.
    iter_on_stack: bool,
}

/// Active `try` region; `break`/`continue`/`return` crossing it must pop the
/// handler and run the finally body inline.
#[derive(Clone, Copy)]
struct TryCtx<'a> {
    finally: Option<&'a [Stmt]>,
}

struct FnCompiler<'a> {
    kind: FnKind,
    name: String,
    params: Vec<String>,
    locals: Vec<Local>,
    /// All slot names ever declared, parameters first. Slots are not reused
    /// after a block exits; the frame reserves one stack slot per entry.
    slots: Vec<String>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    code: Vec<Op>,
    spans: Vec<Span>,
    consts: Vec<Constant>,
    loops: Vec<LoopCtx>,
    tries: Vec<TryCtx<'a>>,
}

impl<'a> FnCompiler<'a> {
    fn new(kind: FnKind, name: String, params: Vec<String>) -> Self {
        let locals = params
            .iter()
            .enumerate()
            .map(|(slot, name)| Local {
                name: name.clone(),
                depth: 0,
                slot: slot as u8,
            })
            .collect();
        Self {
            kind,
            name,
            slots: params.clone(),
            params,
            locals,
            scope_depth: 0,
            upvalues: Vec::new(),
            code: Vec::new(),
            spans: Vec::new(),
            consts: Vec::new(),
            loops: Vec::new(),
            tries: Vec::new(),
        }
    }

    fn finish(self) -> CodeObject {
        CodeObject {
            name: self.name,
            params: self.params,
            locals: self.slots,
            upvalues: self.upvalues,
            code: self.code,
            spans: self.spans,
            consts: self.consts,
        }
    }
}

struct ClassCtx {
    base: Option<String>,
}

pub struct Emitter<'a> {
    compilers: Vec<FnCompiler<'a>>,
    classes: Vec<ClassCtx>,
}

/// What a function body looks like at the AST level: statement lists for
/// declarations, a bare expression for `(x) -> x + 1` arrows.
enum FnBody<'a> {
    Stmts(&'a [Stmt]),
    Expr(&'a Expr),
}

pub fn compile(program: &Program) -> EmitResult<Rc<CodeObject>> {
    let mut emitter = Emitter {
        compilers: vec![FnCompiler::new(FnKind::Script, "<main>".to_string(), Vec::new())],
        classes: Vec::new(),
    };
    for statement in &program.statements {
        emitter.compile_stmt(statement)?;
    }
    let end = program
        .statements
        .last()
        .map(|stmt| stmt.span)
        .unwrap_or_default();
    emitter.emit_const(Constant::Null, end)?;
    emitter.emit(Op::Return, end);
    let compiler = emitter.compilers.pop().expect("script compiler present");
    Ok(Rc::new(compiler.finish()))
}

impl<'a> Emitter<'a> {
    fn current(&mut self) -> &mut FnCompiler<'a> {
        self.compilers.last_mut().expect("compiler stack non-empty")
    }

    fn emit(&mut self, op: Op, span: Span) -> usize {
        let compiler = self.current();
        compiler.code.push(op);
        compiler.spans.push(span);
        compiler.code.len() - 1
    }

    fn add_const(&mut self, constant: Constant, span: Span) -> EmitResult<u16> {
        let consts = &mut self.current().consts;
        if let Some(index) = consts.iter().position(|existing| existing == &constant) {
            return Ok(index as u16);
        }
        if consts.len() > u16::MAX as usize {
            return Err(EmitError::TooManyConstants { span });
        }
        consts.push(constant);
        Ok((consts.len() - 1) as u16)
    }

    fn emit_const(&mut self, constant: Constant, span: Span) -> EmitResult<()> {
        let index = self.add_const(constant, span)?;
        self.emit(Op::LoadConst(index), span);
        Ok(())
    }

    /// Rewrites the placeholder jump at `at` to land on the next instruction.
    fn patch_jump(&mut self, at: usize) {
        let target = self.current().code.len();
        let offset = (target as i64 - (at as i64 + 1)) as i32;
        match &mut self.current().code[at] {
            Op::Jump(slot) | Op::JumpIfFalse(slot) | Op::JumpIfTrue(slot) | Op::ForIter(slot) => {
                *slot = offset;
            }
            other => unreachable!("patch_jump on non-jump {other:?}"),
        }
    }

    fn patch_try(&mut self, at: usize, catch_target: Option<usize>, finally_target: Option<usize>) {
        let relative = |target: usize| (target as i64 - (at as i64 + 1)) as i32;
        match &mut self.current().code[at] {
            Op::PushTry { catch, finally } => {
                *catch = catch_target.map(relative);
                *finally = finally_target.map(relative);
            }
            other => unreachable!("patch_try on non-try {other:?}"),
        }
    }

    /// Emits a backward jump to an already-known target.
    fn emit_jump_back(&mut self, target: usize, span: Span) {
        let at = self.current().code.len();
        let offset = (target as i64 - (at as i64 + 1)) as i32;
        self.emit(Op::Jump(offset), span);
    }

    // Scopes and name resolution.

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let compiler = self.current();
        compiler.scope_depth -= 1;
        let depth = compiler.scope_depth;
        compiler.locals.retain(|local| local.depth <= depth);
    }

    fn declare_local(&mut self, name: &str, span: Span) -> EmitResult<u8> {
        let compiler = self.current();
        if compiler.slots.len() >= u8::MAX as usize {
            return Err(EmitError::TooManyLocals { span });
        }
        let slot = compiler.slots.len() as u8;
        compiler.slots.push(name.to_string());
        let depth = compiler.scope_depth;
        compiler.locals.push(Local {
            name: name.to_string(),
            depth,
            slot,
        });
        Ok(slot)
    }

    fn resolve_local(&self, compiler_index: usize, name: &str) -> Option<u8> {
        self.compilers[compiler_index]
            .locals
            .iter()
            .rev()
            .find(|local| local.name == name)
            .map(|local| local.slot)
    }

    fn add_upvalue(
        &mut self,
        compiler_index: usize,
        desc: UpvalueDesc,
        span: Span,
    ) -> EmitResult<u8> {
        let upvalues = &mut self.compilers[compiler_index].upvalues;
        if let Some(index) = upvalues.iter().position(|existing| existing == &desc) {
            return Ok(index as u8);
        }
        if upvalues.len() >= u8::MAX as usize {
            return Err(EmitError::TooManyUpvalues { span });
        }
        upvalues.push(desc);
        Ok((upvalues.len() - 1) as u8)
    }

    /// Resolves `name` in an enclosing function, threading capture
    /// descriptors through every function boundary in between.
    fn resolve_upvalue(
        &mut self,
        compiler_index: usize,
        name: &str,
        span: Span,
    ) -> EmitResult<Option<u8>> {
        if compiler_index == 0 {
            return Ok(None);
        }
        let parent = compiler_index - 1;
        if let Some(slot) = self.resolve_local(parent, name) {
            let index = self.add_upvalue(
                compiler_index,
                UpvalueDesc {
                    from_parent_local: true,
                    index: slot,
                },
                span,
            )?;
            return Ok(Some(index));
        }
        if let Some(forwarded) = self.resolve_upvalue(parent, name, span)? {
            let index = self.add_upvalue(
                compiler_index,
                UpvalueDesc {
                    from_parent_local: false,
                    index: forwarded,
                },
                span,
            )?;
            return Ok(Some(index));
        }
        Ok(None)
    }

    fn emit_load_name(&mut self, name: &str, span: Span) -> EmitResult<()> {
        let index = self.compilers.len() - 1;
        if self.compilers[index].kind != FnKind::Script {
            if let Some(slot) = self.resolve_local(index, name) {
                self.emit(Op::LoadLocal(slot), span);
                return Ok(());
            }
            if let Some(upvalue) = self.resolve_upvalue(index, name, span)? {
                self.emit(Op::LoadUpvalue(upvalue), span);
                return Ok(());
            }
        }
        self.emit(Op::LoadGlobal(name.to_string()), span);
        Ok(())
    }

    /// Stores resolve existing bindings first (local, then captured); a name
    /// with neither becomes a new block-scoped local, or a global at the top
    /// level.
    fn emit_store_name(&mut self, name: &str, span: Span) -> EmitResult<()> {
        let index = self.compilers.len() - 1;
        if self.compilers[index].kind == FnKind::Script {
            self.emit(Op::StoreGlobal(name.to_string()), span);
            return Ok(());
        }
        if let Some(slot) = self.resolve_local(index, name) {
            self.emit(Op::StoreLocal(slot), span);
            return Ok(());
        }
        if let Some(upvalue) = self.resolve_upvalue(index, name, span)? {
            self.emit(Op::StoreUpvalue(upvalue), span);
            return Ok(());
        }
        let slot = self.declare_local(name, span)?;
        self.emit(Op::StoreLocal(slot), span);
        Ok(())
    }

    // Functions.

    fn compile_function(
        &mut self,
        kind: FnKind,
        name: String,
        params: Vec<String>,
        body: FnBody<'a>,
        span: Span,
    ) -> EmitResult<u16> {
        if params.len() > u8::MAX as usize {
            return Err(EmitError::TooManyLocals { span });
        }
        self.compilers.push(FnCompiler::new(kind, name, params));
        match body {
            FnBody::Stmts(statements) => {
                for statement in statements {
                    self.compile_stmt(statement)?;
                }
                self.emit_const(Constant::Null, span)?;
                self.emit(Op::Return, span);
            }
            FnBody::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Return, expr.span);
            }
        }
        let compiler = self.compilers.pop().expect("function compiler present");
        self.add_const(Constant::Code(Rc::new(compiler.finish())), span)
    }

    // Statements.

    fn compile_stmt(&mut self, stmt: &'a Stmt) -> EmitResult<()> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                if let ExprKind::Assign { .. } = expr.kind {
                    self.compile_assign(expr, false)?;
                } else {
                    self.compile_expr(expr)?;
                    self.emit(Op::Pop, span);
                }
            }
            StmtKind::Block(body) => {
                self.begin_scope();
                for statement in body {
                    self.compile_stmt(statement)?;
                }
                self.end_scope();
            }
            StmtKind::If {
                condition,
                then_body,
                else_body,
            } => {
                self.compile_expr(condition)?;
                let skip_then = self.emit(Op::JumpIfFalse(0), span);
                self.begin_scope();
                for statement in then_body {
                    self.compile_stmt(statement)?;
                }
                self.end_scope();
                match else_body {
                    Some(else_body) => {
                        let skip_else = self.emit(Op::Jump(0), span);
                        self.patch_jump(skip_then);
                        self.begin_scope();
                        for statement in else_body {
                            self.compile_stmt(statement)?;
                        }
                        self.end_scope();
                        self.patch_jump(skip_else);
                    }
                    None => self.patch_jump(skip_then),
                }
            }
            StmtKind::While { condition, body } => {
                let start = self.current().code.len();
                let try_depth = self.current().tries.len();
                self.compile_expr(condition)?;
                let exit = self.emit(Op::JumpIfFalse(0), span);
                self.current().loops.push(LoopCtx {
                    start,
                    breaks: Vec::new(),
                    try_depth,
                    iter_on_stack: false,
                });
                self.begin_scope();
                for statement in body {
                    self.compile_stmt(statement)?;
                }
                self.end_scope();
                self.emit_jump_back(start, span);
                self.patch_jump(exit);
                let ctx = self.current().loops.pop().expect("loop context present");
                for break_at in ctx.breaks {
                    self.patch_jump(break_at);
                }
            }
            StmtKind::For {
                variable,
                iterable,
                body,
            } => {
                self.compile_expr(iterable)?;
                self.emit(Op::GetIter, span);
                let start = self.current().code.len();
                let try_depth = self.current().tries.len();
                let exit = self.emit(Op::ForIter(0), span);
                self.current().loops.push(LoopCtx {
                    start,
                    breaks: Vec::new(),
                    try_depth,
                    iter_on_stack: true,
                });
                self.begin_scope();
                if self.current().kind == FnKind::Script {
                    self.emit(Op::StoreGlobal(variable.clone()), span);
                } else {
                    let slot = self.declare_local(variable, span)?;
                    self.emit(Op::StoreLocal(slot), span);
                }
                for statement in body {
                    self.compile_stmt(statement)?;
                }
                self.end_scope();
                self.emit_jump_back(start, span);
                self.patch_jump(exit);
                let ctx = self.current().loops.pop().expect("loop context present");
                for break_at in ctx.breaks {
                    self.patch_jump(break_at);
                }
            }
            StmtKind::FunctionDef { name, params, body } => {
                let proto = self.compile_function(
                    FnKind::Function,
                    name.clone(),
                    params.clone(),
                    FnBody::Stmts(body),
                    span,
                )?;
                self.emit(Op::MakeFunction(proto), span);
                self.emit_store_name(name, span)?;
            }
            StmtKind::Return(value) => {
                // The return value is computed before any finally runs; the
                // finally bodies execute above it on the stack.
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_const(Constant::Null, span)?,
                }
                self.unwind_tries(0, span)?;
                self.emit(Op::Return, span);
            }
            StmtKind::ClassDef {
                name,
                base,
                methods,
            } => {
                if let Some(base) = base {
                    self.emit_load_name(base, span)?;
                }
                self.classes.push(ClassCtx { base: base.clone() });
                let mut method_names = Vec::with_capacity(methods.len());
                for method in methods {
                    let mut params = Vec::with_capacity(method.params.len() + 1);
                    params.push("this".to_string());
                    params.extend(method.params.iter().cloned());
                    let proto = self.compile_function(
                        FnKind::Method,
                        format!("{name}.{}", method.name),
                        params,
                        FnBody::Stmts(&method.body),
                        method.span,
                    )?;
                    self.emit(Op::MakeFunction(proto), method.span);
                    method_names.push(method.name.clone());
                }
                self.classes.pop();
                self.emit(
                    Op::MakeClass {
                        name: name.clone(),
                        methods: method_names,
                        has_base: base.is_some(),
                    },
                    span,
                );
                self.emit_store_name(name, span)?;
            }
            StmtKind::Break => {
                let Some(loop_index) = self.current().loops.len().checked_sub(1) else {
                    return Err(EmitError::BreakOutsideLoop { span });
                };
                let (try_depth, iter_on_stack) = {
                    let ctx = &self.current().loops[loop_index];
                    (ctx.try_depth, ctx.iter_on_stack)
                };
                self.unwind_tries(try_depth, span)?;
                if iter_on_stack {
                    self.emit(Op::Pop, span);
                }
                let jump = self.emit(Op::Jump(0), span);
                self.current().loops[loop_index].breaks.push(jump);
            }
            StmtKind::Continue => {
                let Some(loop_index) = self.current().loops.len().checked_sub(1) else {
                    return Err(EmitError::ContinueOutsideLoop { span });
                };
                let (try_depth, start) = {
                    let ctx = &self.current().loops[loop_index];
                    (ctx.try_depth, ctx.start)
                };
                self.unwind_tries(try_depth, span)?;
                self.emit_jump_back(start, span);
            }
            StmtKind::Try {
                body,
                catch,
                finally,
            } => self.compile_try(body, catch, finally, span)?,
            StmtKind::Throw(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Throw, span);
            }
            StmtKind::Match {
                subject,
                arms,
                default,
            } => self.compile_match(subject, arms, default, span)?,
            StmtKind::Scene { name, elements } => {
                self.compile_scene(name, elements, span)?;
            }
            StmtKind::WebApp { routes } => {
                for route in routes {
                    self.emit(Op::LoadGlobal("__route".to_string()), route.span);
                    self.emit_const(Constant::Str(route.path.clone()), route.span)?;
                    let proto = self.compile_function(
                        FnKind::Function,
                        format!("<route {}>", route.path),
                        Vec::new(),
                        FnBody::Stmts(&route.body),
                        route.span,
                    )?;
                    self.emit(Op::MakeFunction(proto), route.span);
                    self.emit(Op::Call(2), route.span);
                    self.emit(Op::Pop, route.span);
                }
            }
            StmtKind::Import { module, names } => {
                // Reserved syntax lowers to a host hook rather than being
                // dropped; the default registry installs a no-op `__import`.
                self.emit(Op::LoadGlobal("__import".to_string()), span);
                self.emit_const(Constant::Str(module.clone()), span)?;
                self.emit(Op::Call(1), span);
                for name in names {
                    self.emit(Op::Dup, span);
                    self.emit(Op::GetMember(name.clone()), span);
                    self.emit_store_name(name, span)?;
                }
                self.emit(Op::Pop, span);
            }
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &'a [Stmt],
        catch: &'a Option<(Option<String>, Vec<Stmt>)>,
        finally: &'a Option<Vec<Stmt>>,
        span: Span,
    ) -> EmitResult<()> {
        let finally_stmts = finally.as_deref();
        let push_at = self.emit(
            Op::PushTry {
                catch: None,
                finally: None,
            },
            span,
        );

        self.current().tries.push(TryCtx {
            finally: finally_stmts,
        });
        self.begin_scope();
        for statement in body {
            self.compile_stmt(statement)?;
        }
        self.end_scope();
        self.current().tries.pop();
        self.emit(Op::PopTry, span);
        if let Some(stmts) = finally_stmts {
            self.compile_scoped(stmts)?;
        }
        let mut end_jumps = vec![self.emit(Op::Jump(0), span)];

        let mut catch_target = None;
        let mut inner_push = None;
        if let Some((binding, catch_body)) = catch {
            catch_target = Some(self.current().code.len());
            self.begin_scope();
            match binding {
                // The unwinder leaves the raised value on the stack.
                Some(name) => {
                    if self.current().kind == FnKind::Script {
                        self.emit(Op::StoreGlobal(name.clone()), span);
                    } else {
                        let slot = self.declare_local(name, span)?;
                        self.emit(Op::StoreLocal(slot), span);
                    }
                }
                None => {
                    self.emit(Op::Pop, span);
                }
            }
            // A finally must also run when the catch body itself throws.
            if finally_stmts.is_some() {
                inner_push = Some(self.emit(
                    Op::PushTry {
                        catch: None,
                        finally: None,
                    },
                    span,
                ));
                self.current().tries.push(TryCtx {
                    finally: finally_stmts,
                });
            }
            for statement in catch_body {
                self.compile_stmt(statement)?;
            }
            if finally_stmts.is_some() {
                self.current().tries.pop();
                self.emit(Op::PopTry, span);
            }
            if let Some(stmts) = finally_stmts {
                self.compile_scoped(stmts)?;
            }
            self.end_scope();
            end_jumps.push(self.emit(Op::Jump(0), span));
        }

        // Out-of-line exceptional path: run the finally, then rethrow the
        // value the unwinder pushed. Both handlers share it.
        let mut finally_target = None;
        if let Some(stmts) = finally_stmts {
            finally_target = Some(self.current().code.len());
            self.compile_scoped(stmts)?;
            self.emit(Op::Throw, span);
        }

        for at in end_jumps {
            self.patch_jump(at);
        }
        self.patch_try(push_at, catch_target, finally_target);
        if let Some(inner_at) = inner_push {
            self.patch_try(inner_at, None, finally_target);
        }
        Ok(())
    }

    fn compile_scoped(&mut self, body: &'a [Stmt]) -> EmitResult<()> {
        self.begin_scope();
        for statement in body {
            self.compile_stmt(statement)?;
        }
        self.end_scope();
        Ok(())
    }

    fn compile_match(
        &mut self,
        subject: &'a Expr,
        arms: &'a [(Expr, Vec<Stmt>)],
        default: &'a Option<Vec<Stmt>>,
        span: Span,
    ) -> EmitResult<()> {
        self.compile_expr(subject)?;
        let mut end_jumps = Vec::new();
        for (case, body) in arms {
            self.emit(Op::Dup, case.span);
            self.compile_expr(case)?;
            self.emit(Op::Eq, case.span);
            let next_arm = self.emit(Op::JumpIfFalse(0), case.span);
            self.emit(Op::Pop, case.span); // discriminant, once an arm matches
            self.compile_scoped(body)?;
            end_jumps.push(self.emit(Op::Jump(0), case.span));
            self.patch_jump(next_arm);
        }
        self.emit(Op::Pop, span); // discriminant, when no arm matched
        if let Some(body) = default {
            self.compile_scoped(body)?;
        }
        for at in end_jumps {
            self.patch_jump(at);
        }
        Ok(())
    }

    fn compile_scene(
        &mut self,
        name: &str,
        elements: &'a [SceneElement],
        span: Span,
    ) -> EmitResult<()> {
        self.emit(Op::LoadGlobal("__scene".to_string()), span);
        self.emit_const(Constant::Str(name.to_string()), span)?;
        for element in elements {
            self.emit_const(Constant::Str("type".to_string()), span)?;
            self.emit_const(Constant::Str(element.element_type.clone()), span)?;
            for (key, value) in &element.properties {
                self.emit_const(Constant::Str(key.clone()), value.span)?;
                self.compile_expr(value)?;
            }
            let entries = element.properties.len() + 1;
            if entries > u16::MAX as usize {
                return Err(EmitError::LiteralTooLarge { span });
            }
            self.emit(Op::MakeObject(entries as u16), span);
        }
        if elements.len() > u16::MAX as usize {
            return Err(EmitError::LiteralTooLarge { span });
        }
        self.emit(Op::MakeArray(elements.len() as u16), span);
        self.emit(Op::Call(2), span);
        self.emit(Op::Pop, span);
        Ok(())
    }

    /// Emits `POP_TRY` plus the inline finally body for every try region
    /// above `target_depth`, innermost first, for a jump that leaves them.
    fn unwind_tries(&mut self, target_depth: usize, span: Span) -> EmitResult<()> {
        let saved: Vec<TryCtx<'a>> = self.current().tries.split_off(target_depth);
        for ctx in saved.iter().rev() {
            self.emit(Op::PopTry, span);
            if let Some(stmts) = ctx.finally {
                self.compile_scoped(stmts)?;
            }
        }
        self.current().tries.extend(saved);
        Ok(())
    }

    // Expressions.

    fn compile_expr(&mut self, expr: &'a Expr) -> EmitResult<()> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Number(value) => self.emit_const(Constant::Number(*value), span)?,
            ExprKind::Str(value) => self.emit_const(Constant::Str(value.clone()), span)?,
            ExprKind::Bool(value) => self.emit_const(Constant::Bool(*value), span)?,
            ExprKind::Null => self.emit_const(Constant::Null, span)?,
            ExprKind::Identifier(name) => self.emit_load_name(name, span)?,
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Neg => self.emit(Op::Neg, span),
                    UnaryOp::Not => self.emit(Op::Not, span),
                };
            }
            ExprKind::Binary { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(binary_op(*op), span);
            }
            ExprKind::Logical { op, left, right } => {
                // Short-circuit keeps the deciding value as the result.
                self.compile_expr(left)?;
                self.emit(Op::Dup, span);
                let skip = match op {
                    LogicalOp::And => self.emit(Op::JumpIfFalse(0), span),
                    LogicalOp::Or => self.emit(Op::JumpIfTrue(0), span),
                };
                self.emit(Op::Pop, span);
                self.compile_expr(right)?;
                self.patch_jump(skip);
            }
            ExprKind::Assign { .. } => self.compile_assign(expr, true)?,
            ExprKind::Array(elements) => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                if elements.len() > u16::MAX as usize {
                    return Err(EmitError::LiteralTooLarge { span });
                }
                self.emit(Op::MakeArray(elements.len() as u16), span);
            }
            ExprKind::Object(entries) => {
                for (key, value) in entries {
                    self.emit_const(Constant::Str(key.clone()), value.span)?;
                    self.compile_expr(value)?;
                }
                if entries.len() > u16::MAX as usize {
                    return Err(EmitError::LiteralTooLarge { span });
                }
                self.emit(Op::MakeObject(entries.len() as u16), span);
            }
            ExprKind::Member { object, name } => {
                self.compile_expr(object)?;
                self.emit(Op::GetMember(name.clone()), span);
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::GetIndex, span);
            }
            ExprKind::Call { callee, args } => {
                self.compile_expr(callee)?;
                let argc = self.compile_args(args, span)?;
                self.emit(Op::Call(argc), span);
            }
            ExprKind::Arrow { params, body } => {
                let proto = match body {
                    ArrowBody::Expr(expr) => self.compile_function(
                        FnKind::Function,
                        "<arrow>".to_string(),
                        params.clone(),
                        FnBody::Expr(expr),
                        span,
                    )?,
                    ArrowBody::Block(statements) => self.compile_function(
                        FnKind::Function,
                        "<arrow>".to_string(),
                        params.clone(),
                        FnBody::Stmts(statements),
                        span,
                    )?,
                };
                self.emit(Op::MakeFunction(proto), span);
            }
            ExprKind::New { class, args } => {
                self.compile_expr(class)?;
                let argc = self.compile_args(args, span)?;
                self.emit(Op::New(argc), span);
            }
            ExprKind::This => self.emit_this(span)?,
            ExprKind::SuperCall { method, args } => {
                let base = match self.classes.last() {
                    None => return Err(EmitError::SuperOutsideClass { span }),
                    Some(ClassCtx { base: None }) => {
                        return Err(EmitError::SuperWithoutBase { span });
                    }
                    Some(ClassCtx { base: Some(base) }) => base.clone(),
                };
                // Direct lookup against the declared base, with `this`
                // prepended to the arguments.
                self.emit_load_name(&base, span)?;
                self.emit(Op::LoadSuper(method.clone()), span);
                self.emit_this(span)?;
                let argc = self.compile_args(args, span)?;
                if argc == u8::MAX {
                    return Err(EmitError::TooManyArguments { span });
                }
                self.emit(Op::Call(argc + 1), span);
            }
            ExprKind::Await(operand) => {
                // Reserved: evaluates as its operand in the synchronous core.
                self.compile_expr(operand)?;
            }
        }
        Ok(())
    }

    fn compile_args(&mut self, args: &'a [Expr], span: Span) -> EmitResult<u8> {
        if args.len() > u8::MAX as usize {
            return Err(EmitError::TooManyArguments { span });
        }
        for arg in args {
            self.compile_expr(arg)?;
        }
        Ok(args.len() as u8)
    }

    fn emit_this(&mut self, span: Span) -> EmitResult<()> {
        let index = self.compilers.len() - 1;
        if self.compilers[index].kind == FnKind::Method {
            self.emit(Op::LoadThis, span);
            return Ok(());
        }
        // Arrows and nested functions reach the enclosing method's `this`
        // through a normal capture.
        if self.compilers[index].kind != FnKind::Script
            && let Some(upvalue) = self.resolve_upvalue(index, "this", span)?
        {
            self.emit(Op::LoadUpvalue(upvalue), span);
            return Ok(());
        }
        Err(EmitError::ThisOutsideMethod { span })
    }

    fn compile_assign(&mut self, expr: &'a Expr, want_value: bool) -> EmitResult<()> {
        let span = expr.span;
        let ExprKind::Assign { target, op, value } = &expr.kind else {
            unreachable!("compile_assign on non-assignment");
        };
        match &target.kind {
            ExprKind::Identifier(name) => {
                match op {
                    None => self.compile_expr(value)?,
                    Some(op) => {
                        // Compound assignment reads and writes the same
                        // binding; an unknown name resolves to a global on
                        // both sides.
                        self.emit_load_name(name, target.span)?;
                        self.compile_expr(value)?;
                        self.emit(binary_op(*op), span);
                    }
                }
                if want_value {
                    self.emit(Op::Dup, span);
                }
                match op {
                    None => self.emit_store_name(name, span)?,
                    Some(_) => self.emit_store_resolved(name, span)?,
                }
            }
            ExprKind::Member { object, name } => {
                self.compile_expr(object)?;
                if op.is_some() {
                    self.emit(Op::Dup, span);
                    self.emit(Op::GetMember(name.clone()), target.span);
                }
                self.compile_expr(value)?;
                if let Some(op) = op {
                    self.emit(binary_op(*op), span);
                }
                self.emit(Op::SetMember(name.clone()), span);
                if !want_value {
                    self.emit(Op::Pop, span);
                }
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                if op.is_some() {
                    // `a[i] op= e` re-evaluates the object and index; the
                    // instruction set has no stack rotation.
                    self.compile_expr(object)?;
                    self.compile_expr(index)?;
                    self.emit(Op::GetIndex, target.span);
                }
                self.compile_expr(value)?;
                if let Some(op) = op {
                    self.emit(binary_op(*op), span);
                }
                self.emit(Op::SetIndex, span);
                if !want_value {
                    self.emit(Op::Pop, span);
                }
            }
            _ => unreachable!("parser validated the assignment target"),
        }
        Ok(())
    }

    /// Store for compound assignment: writes wherever the load resolved,
    /// never declaring a new local.
    fn emit_store_resolved(&mut self, name: &str, span: Span) -> EmitResult<()> {
        let index = self.compilers.len() - 1;
        if self.compilers[index].kind != FnKind::Script {
            if let Some(slot) = self.resolve_local(index, name) {
                self.emit(Op::StoreLocal(slot), span);
                return Ok(());
            }
            if let Some(upvalue) = self.resolve_upvalue(index, name, span)? {
                self.emit(Op::StoreUpvalue(upvalue), span);
                return Ok(());
            }
        }
        self.emit(Op::StoreGlobal(name.to_string()), span);
        Ok(())
    }
}

fn binary_op(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Sub => Op::Sub,
        BinaryOp::Mul => Op::Mul,
        BinaryOp::Div => Op::Div,
        BinaryOp::Mod => Op::Mod,
        BinaryOp::Pow => Op::Pow,
        BinaryOp::Eq => Op::Eq,
        BinaryOp::Ne => Op::Ne,
        BinaryOp::Lt => Op::Lt,
        BinaryOp::Gt => Op::Gt,
        BinaryOp::Le => Op::Le,
        BinaryOp::Ge => Op::Ge,
    }
}
