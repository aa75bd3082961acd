//! Syntax tree produced by the parser and consumed by the emitter.
//!
//! Every node carries the span of the token that introduced it so the
//! emitter can attach source positions to each instruction. `to_source`
//! renders a tree back to canonical source text; parsing that text yields
//! the same tree again (modulo spans), which the REPL and the round-trip
//! tests rely on.

use crate::token::Span;

#[derive(Debug, PartialEq, Clone)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "^",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ArrowBody {
    Expr(Box<Expr>),
    Block(Vec<Stmt>),
}

#[derive(Debug, PartialEq, Clone)]
pub enum ExprKind {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Identifier(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Plain (`op == None`) or compound assignment. The target is validated
    /// by the parser to be an identifier, member access or index access.
    Assign {
        target: Box<Expr>,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Arrow {
        params: Vec<String>,
        body: ArrowBody,
    },
    New {
        class: Box<Expr>,
        args: Vec<Expr>,
    },
    This,
    SuperCall {
        method: String,
        args: Vec<Expr>,
    },
    /// `await expr` parses but evaluates as its operand.
    Await(Box<Expr>),
}

#[derive(Debug, PartialEq, Clone)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, PartialEq, Clone)]
pub struct SceneElement {
    pub element_type: String,
    pub properties: Vec<(String, Expr)>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Route {
    pub path: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, PartialEq, Clone)]
pub enum StmtKind {
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        condition: Expr,
        then_body: Vec<Stmt>,
        /// `elif` chains are nested: the else body of an `elif` holds a
        /// single `If` statement.
        else_body: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    For {
        variable: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    FunctionDef {
        name: String,
        params: Vec<String>,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    ClassDef {
        name: String,
        base: Option<String>,
        methods: Vec<MethodDef>,
    },
    Break,
    Continue,
    Try {
        body: Vec<Stmt>,
        catch: Option<(Option<String>, Vec<Stmt>)>,
        finally: Option<Vec<Stmt>>,
    },
    Throw(Expr),
    Match {
        subject: Expr,
        arms: Vec<(Expr, Vec<Stmt>)>,
        default: Option<Vec<Stmt>>,
    },
    Scene {
        name: String,
        elements: Vec<SceneElement>,
    },
    WebApp {
        routes: Vec<Route>,
    },
    /// `import m` has no names; `from m import a, b` lists them.
    Import {
        module: String,
        names: Vec<String>,
    },
}

/// Renders a program back to source text.
pub fn to_source(program: &Program) -> String {
    let mut out = String::new();
    for statement in &program.statements {
        write_stmt(&mut out, statement, 0);
    }
    out
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn write_body(out: &mut String, body: &[Stmt], level: usize) {
    out.push_str("{\n");
    for statement in body {
        write_stmt(out, statement, level + 1);
    }
    indent(out, level);
    out.push('}');
}

fn write_stmt(out: &mut String, stmt: &Stmt, level: usize) {
    indent(out, level);
    match &stmt.kind {
        StmtKind::Expr(expr) => out.push_str(&expr_source(expr)),
        StmtKind::Block(body) => write_body(out, body, level),
        StmtKind::If {
            condition,
            then_body,
            else_body,
        } => {
            out.push_str(&format!("if {} ", expr_source(condition)));
            write_body(out, then_body, level);
            if let Some(else_body) = else_body {
                out.push_str(" else ");
                write_body(out, else_body, level);
            }
        }
        StmtKind::While { condition, body } => {
            out.push_str(&format!("while {} ", expr_source(condition)));
            write_body(out, body, level);
        }
        StmtKind::For {
            variable,
            iterable,
            body,
        } => {
            out.push_str(&format!("for {variable} in {} ", expr_source(iterable)));
            write_body(out, body, level);
        }
        StmtKind::FunctionDef { name, params, body } => {
            out.push_str(&format!("function {name}({}) ", params.join(", ")));
            write_body(out, body, level);
        }
        StmtKind::Return(value) => match value {
            Some(expr) => out.push_str(&format!("return {}", expr_source(expr))),
            None => out.push_str("return"),
        },
        StmtKind::ClassDef {
            name,
            base,
            methods,
        } => {
            out.push_str(&format!("class {name}"));
            if let Some(base) = base {
                out.push_str(&format!(" extends {base}"));
            }
            out.push_str(" {\n");
            for method in methods {
                indent(out, level + 1);
                out.push_str(&format!(
                    "function {}({}) ",
                    method.name,
                    method.params.join(", ")
                ));
                write_body(out, &method.body, level + 1);
                out.push('\n');
            }
            indent(out, level);
            out.push('}');
        }
        StmtKind::Break => out.push_str("break"),
        StmtKind::Continue => out.push_str("continue"),
        StmtKind::Try {
            body,
            catch,
            finally,
        } => {
            out.push_str("try ");
            write_body(out, body, level);
            if let Some((binding, catch_body)) = catch {
                match binding {
                    Some(name) => out.push_str(&format!(" catch {name} ")),
                    None => out.push_str(" catch "),
                }
                write_body(out, catch_body, level);
            }
            if let Some(finally_body) = finally {
                out.push_str(" finally ");
                write_body(out, finally_body, level);
            }
        }
        StmtKind::Throw(expr) => out.push_str(&format!("throw {}", expr_source(expr))),
        StmtKind::Match {
            subject,
            arms,
            default,
        } => {
            out.push_str(&format!("match {} {{\n", expr_source(subject)));
            for (case, body) in arms {
                indent(out, level + 1);
                out.push_str(&format!("case {} ", expr_source(case)));
                write_body(out, body, level + 1);
                out.push('\n');
            }
            if let Some(body) = default {
                indent(out, level + 1);
                out.push_str("default ");
                write_body(out, body, level + 1);
                out.push('\n');
            }
            indent(out, level);
            out.push('}');
        }
        StmtKind::Scene { name, elements } => {
            out.push_str(&format!("scene {name} {{\n"));
            for element in elements {
                indent(out, level + 1);
                out.push_str(&element.element_type);
                for (key, value) in &element.properties {
                    out.push_str(&format!(" {key}: {}", expr_source(value)));
                }
                out.push('\n');
            }
            indent(out, level);
            out.push('}');
        }
        StmtKind::WebApp { routes } => {
            out.push_str("web.app {\n");
            for route in routes {
                indent(out, level + 1);
                out.push_str(&format!("route {} ", quote(&route.path)));
                write_body(out, &route.body, level + 1);
                out.push('\n');
            }
            indent(out, level);
            out.push('}');
        }
        StmtKind::Import { module, names } => {
            if names.is_empty() {
                out.push_str(&format!("import {module}"));
            } else {
                out.push_str(&format!("from {module} import {}", names.join(", ")));
            }
        }
    }
    out.push('\n');
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        match ch {
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            '\r' => quoted.push_str("\\r"),
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

fn number_source(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Wraps compound operands in parentheses so the printed form reparses with
/// the same shape regardless of the original precedence context.
fn operand_source(expr: &Expr) -> String {
    match expr.kind {
        ExprKind::Binary { .. } | ExprKind::Logical { .. } | ExprKind::Unary { .. } | ExprKind::Assign { .. } => {
            format!("({})", expr_source(expr))
        }
        _ => expr_source(expr),
    }
}

fn expr_source(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Number(value) => number_source(*value),
        ExprKind::Str(value) => quote(value),
        ExprKind::Bool(value) => value.to_string(),
        ExprKind::Null => "null".to_string(),
        ExprKind::Identifier(name) => name.clone(),
        ExprKind::Unary { op, operand } => match op {
            UnaryOp::Neg => format!("-{}", operand_source(operand)),
            UnaryOp::Not => format!("not {}", operand_source(operand)),
        },
        ExprKind::Binary { op, left, right } => format!(
            "{} {} {}",
            operand_source(left),
            op.symbol(),
            operand_source(right)
        ),
        ExprKind::Logical { op, left, right } => format!(
            "{} {} {}",
            operand_source(left),
            match op {
                LogicalOp::And => "and",
                LogicalOp::Or => "or",
            },
            operand_source(right)
        ),
        ExprKind::Assign { target, op, value } => {
            let operator = match op {
                None => "=".to_string(),
                Some(op) => format!("{}=", op.symbol()),
            };
            format!("{} {} {}", expr_source(target), operator, operand_source(value))
        }
        ExprKind::Array(elements) => {
            let rendered: Vec<_> = elements.iter().map(expr_source).collect();
            format!("[{}]", rendered.join(", "))
        }
        ExprKind::Object(entries) => {
            let rendered: Vec<_> = entries
                .iter()
                .map(|(key, value)| format!("{key}: {}", expr_source(value)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
        ExprKind::Member { object, name } => format!("{}.{name}", operand_source(object)),
        ExprKind::Index { object, index } => {
            format!("{}[{}]", operand_source(object), expr_source(index))
        }
        ExprKind::Call { callee, args } => {
            let rendered: Vec<_> = args.iter().map(expr_source).collect();
            format!("{}({})", operand_source(callee), rendered.join(", "))
        }
        ExprKind::Arrow { params, body } => match body {
            ArrowBody::Expr(expr) => {
                format!("({}) -> {}", params.join(", "), expr_source(expr))
            }
            ArrowBody::Block(statements) => {
                let mut out = format!("({}) -> ", params.join(", "));
                write_body(&mut out, statements, 0);
                out
            }
        },
        ExprKind::New { class, args } => {
            let rendered: Vec<_> = args.iter().map(expr_source).collect();
            format!("new {}({})", expr_source(class), rendered.join(", "))
        }
        ExprKind::This => "this".to_string(),
        ExprKind::SuperCall { method, args } => {
            let rendered: Vec<_> = args.iter().map(expr_source).collect();
            format!("super.{method}({})", rendered.join(", "))
        }
        ExprKind::Await(operand) => format!("await {}", operand_source(operand)),
    }
}
